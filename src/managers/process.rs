use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::info;

use super::Host;
use crate::dispatch::{CommandTemplate, Parsed};
use crate::error::{Error, Result};
use crate::exec::CommandResult;

const PS: CommandTemplate = CommandTemplate::new(
    "ps",
    &["-eo", "pid,ppid,user,%cpu,%mem,comm", "--no-headers"],
);
const KILL: CommandTemplate = CommandTemplate::new("kill", &["-{signal}", "{pid}"]);

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub user: String,
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub command: String,
}

/// Signals `kill` may deliver. Anything else is rejected before a process
/// is spawned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Kill,
    Usr1,
    Usr2,
    #[default]
    Term,
    Cont,
    Stop,
}

impl Signal {
    const TABLE: &'static [(Signal, &'static str, u8)] = &[
        (Signal::Hup, "HUP", 1),
        (Signal::Int, "INT", 2),
        (Signal::Quit, "QUIT", 3),
        (Signal::Kill, "KILL", 9),
        (Signal::Usr1, "USR1", 10),
        (Signal::Usr2, "USR2", 12),
        (Signal::Term, "TERM", 15),
        (Signal::Cont, "CONT", 18),
        (Signal::Stop, "STOP", 19),
    ];

    pub fn as_str(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(s, _, _)| *s == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("TERM")
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = Error;

    /// Accepts `TERM`, `sigterm` or `15`.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        let number = name.parse::<u8>().ok();
        Self::TABLE
            .iter()
            .find(|(_, n, num)| *n == name || Some(*num) == number)
            .map(|(signal, _, _)| *signal)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown signal: {s}")))
    }
}

pub struct Processes {
    host: Host,
}

impl Processes {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    pub async fn list(&self) -> Result<Vec<ProcessInfo>> {
        let out = self.host.run("list processes", &PS.render(&[])).await?;
        Ok(parse_ps(&out.stdout).into_records("ps"))
    }

    /// The `n` processes using the most CPU, highest first.
    pub async fn top(&self, n: usize) -> Result<Vec<ProcessInfo>> {
        let mut procs = self.list().await?;
        procs.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
        procs.truncate(n);
        Ok(procs)
    }

    pub async fn kill(&self, pid: u32, signal: Signal) -> Result<CommandResult> {
        if pid == 0 {
            return Err(Error::InvalidArgument("pid 0 addresses the whole process group".into()));
        }
        let pid = pid.to_string();
        info!(pid = %pid, %signal, "sending signal");
        let inv = KILL.render(&[("signal", signal.as_str()), ("pid", &pid)]);
        self.host.run("kill process", &inv).await
    }
}

/// `ps -eo pid,ppid,user,%cpu,%mem,comm --no-headers`.
pub fn parse_ps(raw: &str) -> Parsed<ProcessInfo> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 6 {
            parsed.skip();
            continue;
        }
        let fields = (
            tokens[0].parse::<u32>(),
            tokens[1].parse::<u32>(),
            tokens[3].parse::<f32>(),
            tokens[4].parse::<f32>(),
        );
        let (Ok(pid), Ok(ppid), Ok(cpu), Ok(mem)) = fields else {
            parsed.skip();
            continue;
        };
        parsed.push(ProcessInfo {
            pid,
            ppid,
            user: tokens[2].to_string(),
            cpu_percent: cpu,
            mem_percent: mem,
            command: tokens[5..].join(" "),
        });
    }
    parsed
}
