//! Security event correlation from the journal or the auth log.
//!
//! systemd hosts are read through `journalctl -o json`; everything else
//! falls back to the tail of the first auth log that exists. Both paths
//! produce [`AuditEvent`]s which are then filtered to a time window.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::Host;
use crate::dispatch::{CommandTemplate, Parsed};
use crate::error::{Error, Result};
use crate::profile::InitSystem;

const JOURNAL: CommandTemplate =
    CommandTemplate::new("journalctl", &["-o", "json", "-n", "{count}", "--no-pager"]);

static SSH_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Failed (?:password|publickey) for (?:invalid user )?(\S+) from (\S+)").unwrap()
});
static SUDO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sudo(?:\[\d+\])?:\s+(\S+)\s*:.*COMMAND=(.+)$").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    SshFailure,
    Sudo,
    Journal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SshFailure => "SSH_FAILURE",
            EventKind::Sudo => "SUDO",
            EventKind::Journal => "JOURNAL",
        }
    }
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }

    /// syslog priority: 0-3 critical, 4 warning, 5-7 informational.
    pub fn from_priority(priority: u8) -> Self {
        match priority {
            0..=3 => Severity::Critical,
            4 => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub kind: EventKind,
    pub user: Option<String>,
    pub source_address: Option<String>,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditSettings {
    pub log_paths: Vec<PathBuf>,
    pub max_lines: usize,
    pub journal_records: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            log_paths: vec![PathBuf::from("/var/log/auth.log"), PathBuf::from("/var/log/secure")],
            max_lines: 500,
            journal_records: 1000,
        }
    }
}

pub struct Audit {
    host: Host,
    settings: AuditSettings,
}

impl Audit {
    pub fn new(host: Host, settings: AuditSettings) -> Self {
        Self { host, settings }
    }

    /// Events no older than `window`.
    pub async fn events(&self, window: Duration) -> Result<Vec<AuditEvent>> {
        self.events_at(Utc::now(), window).await
    }

    pub async fn events_at(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<AuditEvent>> {
        let window = chrono::Duration::from_std(window)
            .map_err(|_| Error::InvalidArgument(format!("window too large: {window:?}")))?;
        let events = match self.host.profile().init_system {
            InitSystem::Systemd => self.journal().await?,
            _ => self.syslog(now).await?,
        };
        Ok(within_window(events, now, window))
    }

    async fn journal(&self) -> Result<Vec<AuditEvent>> {
        let count = self.settings.journal_records.to_string();
        let inv = JOURNAL.render(&[("count", &count)]);
        let out = self.host.run("read journal", &inv).await?;
        Ok(parse_journal(&out.stdout).into_records("journalctl"))
    }

    async fn syslog(&self, now: DateTime<Utc>) -> Result<Vec<AuditEvent>> {
        for path in &self.settings.log_paths {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    debug!(path = %path.display(), "reading auth log");
                    let lines: Vec<&str> = content.lines().collect();
                    let start = lines.len().saturating_sub(self.settings.max_lines);
                    return Ok(parse_syslog(&lines[start..], now).into_records("syslog"));
                }
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(Error::io(path)(err)),
            }
        }
        warn!(paths = ?self.settings.log_paths, "no auth log found");
        Ok(Vec::new())
    }
}

/// Keeps events with `timestamp >= now - window`. A window reaching past the
/// earliest representable time keeps everything.
pub fn within_window(
    events: Vec<AuditEvent>,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Vec<AuditEvent> {
    match now.checked_sub_signed(window) {
        Some(cutoff) => events.into_iter().filter(|e| e.timestamp >= cutoff).collect(),
        None => events,
    }
}

/// `journalctl -o json`, one object per line.
pub fn parse_journal(raw: &str) -> Parsed<AuditEvent> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        match journal_event(line) {
            Some(event) => parsed.push(event),
            None => parsed.skip(),
        }
    }
    parsed
}

fn journal_event(line: &str) -> Option<AuditEvent> {
    let entry: Value = serde_json::from_str(line).ok()?;
    let micros: i64 = entry.get("__REALTIME_TIMESTAMP")?.as_str()?.parse().ok()?;
    let timestamp = DateTime::from_timestamp_micros(micros)?;
    let priority = entry
        .get("PRIORITY")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<u8>().ok())
        .unwrap_or(6);
    let message = journal_message(entry.get("MESSAGE")?)?;
    let ident = entry.get("SYSLOG_IDENTIFIER").and_then(Value::as_str);

    let mut event = classify(&message).unwrap_or_else(|| AuditEvent {
        kind: EventKind::Journal,
        user: None,
        source_address: None,
        message: String::new(),
        severity: Severity::Info,
        timestamp,
    });
    event.severity = Severity::from_priority(priority);
    event.timestamp = timestamp;
    event.message = match ident {
        Some(ident) => format!("{ident}: {message}"),
        None => message,
    };
    Some(event)
}

/// Non-UTF-8 messages are serialized by journald as byte arrays.
fn journal_message(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(bytes) => {
            let bytes: Option<Vec<u8>> = bytes
                .iter()
                .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            Some(String::from_utf8_lossy(&bytes?).into_owned())
        }
        _ => None,
    }
}

/// Auth log lines; only SSH failures and sudo invocations become events.
/// Matching lines whose timestamp cannot be read are counted as skipped.
pub fn parse_syslog(lines: &[&str], now: DateTime<Utc>) -> Parsed<AuditEvent> {
    let mut parsed = Parsed::default();
    for line in lines {
        let Some(mut event) = classify(line) else {
            continue;
        };
        match syslog_timestamp(line, now) {
            Some(ts) => {
                event.timestamp = ts;
                event.message = line.trim().to_string();
                parsed.push(event);
            }
            None => parsed.skip(),
        }
    }
    parsed
}

fn classify(text: &str) -> Option<AuditEvent> {
    let event = |kind, user: &str, address: Option<&str>, severity| AuditEvent {
        kind,
        user: Some(user.to_string()),
        source_address: address.map(str::to_string),
        message: text.to_string(),
        severity,
        timestamp: DateTime::<Utc>::MIN_UTC,
    };
    if let Some(caps) = SSH_FAILURE.captures(text) {
        return Some(event(EventKind::SshFailure, &caps[1], Some(&caps[2]), Severity::Warning));
    }
    SUDO.captures(text)
        .map(|caps| event(EventKind::Sudo, &caps[1], None, Severity::Info))
}

/// Reads either a traditional `Mon _2 HH:MM:SS` prefix, re-anchored to the
/// current local year, or an RFC 3339 prefix.
pub fn syslog_timestamp(line: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let first = line.split_whitespace().next()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(first) {
        return Some(ts.with_timezone(&Utc));
    }

    let mut tokens = line.split_whitespace();
    let (month, day, time) = (tokens.next()?, tokens.next()?, tokens.next()?);
    let year = now.with_timezone(&Local).year();
    let anchor = |year: i32| {
        let naive =
            NaiveDateTime::parse_from_str(&format!("{year} {month} {day} {time}"), "%Y %b %d %H:%M:%S").ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|ts| ts.with_timezone(&Utc))
    };
    let ts = anchor(year)?;
    // A December line read in January belongs to last year.
    if ts > now + chrono::Duration::days(1) {
        return anchor(year - 1);
    }
    Some(ts)
}
