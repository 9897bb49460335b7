use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::managers::audit::AuditSettings;
use crate::managers::scan::ScanOptions;
use crate::profile::ProfileOverrides;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub schema: u32,
    pub timeouts: Timeouts,
    pub overrides: Overrides,
    pub audit: AuditConfig,
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub command_ms: u64,
    pub detect_ms: u64,
}

/// Each field is `"auto"` or a backend name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub package_manager: String,
    pub init_system: String,
    pub firewall: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub log_paths: Vec<PathBuf>,
    pub max_lines: usize,
    pub journal_records: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub concurrency: usize,
    pub connect_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema: 1,
            timeouts: Timeouts::default(),
            overrides: Overrides::default(),
            audit: AuditConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_ms: 30_000,
            detect_ms: 5_000,
        }
    }
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            package_manager: "auto".into(),
            init_system: "auto".into(),
            firewall: "auto".into(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        let defaults = AuditSettings::default();
        Self {
            log_paths: defaults.log_paths,
            max_lines: defaults.max_lines,
            journal_records: defaults.journal_records,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        let defaults = ScanOptions::default();
        Self {
            concurrency: defaults.concurrency,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
        }
    }
}

impl Settings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.command_ms)
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.detect_ms)
    }

    pub fn profile_overrides(&self) -> Result<ProfileOverrides> {
        Ok(ProfileOverrides {
            init_system: forced(&self.overrides.init_system).context("overrides.init_system")?,
            package_manager: forced(&self.overrides.package_manager)
                .context("overrides.package_manager")?,
            firewall: forced(&self.overrides.firewall).context("overrides.firewall")?,
        })
    }

    pub fn audit_settings(&self) -> AuditSettings {
        AuditSettings {
            log_paths: self.audit.log_paths.clone(),
            max_lines: self.audit.max_lines,
            journal_records: self.audit.journal_records,
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            concurrency: self.scan.concurrency,
            connect_timeout: Duration::from_millis(self.scan.connect_timeout_ms),
        }
    }
}

fn forced<T>(value: &str) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = crate::error::Error>,
{
    if value.is_empty() || value.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }
    Ok(Some(value.parse()?))
}

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("org", "hostctl", "hostctl")
        .context("unable to determine XDG project dirs")?;
    Ok(proj.config_dir().join("config.toml"))
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    let default_path = default_config_path()?;
    if !path.exists() {
        if path == default_path {
            tracing::warn!(path = %path.display(), "config file not found; using built-in defaults");
            return Ok(Settings::default());
        }
        anyhow::bail!("config file not found: {}", path.display());
    }

    let s = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_settings(&s)
}

pub fn parse_settings(s: &str) -> Result<Settings> {
    let settings: Settings = toml::from_str(s).context("failed to parse config TOML")?;
    anyhow::ensure!(settings.schema == 1, "unsupported config schema: {}", settings.schema);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{FirewallBackend, InitSystem};

    #[test]
    fn partial_file_keeps_defaults() {
        let s = parse_settings("schema = 1\n[timeouts]\ncommand_ms = 1000\n").unwrap();
        assert_eq!(s.command_timeout(), Duration::from_secs(1));
        assert_eq!(s.detect_timeout(), Duration::from_secs(5));
        assert_eq!(s.audit.max_lines, 500);
        assert_eq!(s.scan_options(), ScanOptions::default());
        assert_eq!(s.profile_overrides().unwrap(), ProfileOverrides::default());
    }

    #[test]
    fn schema_must_be_one() {
        let err = parse_settings("schema = 2\n").unwrap_err();
        assert!(err.to_string().contains("unsupported config schema: 2"));
    }

    #[test]
    fn overrides_parse_backend_names() {
        let s = parse_settings(
            "schema = 1\n[overrides]\ninit_system = \"OpenRC\"\nfirewall = \"nftables\"\n",
        )
        .unwrap();
        let o = s.profile_overrides().unwrap();
        assert_eq!(o.init_system, Some(InitSystem::Openrc));
        assert_eq!(o.firewall, Some(FirewallBackend::Nftables));
        assert_eq!(o.package_manager, None);

        let s = parse_settings("[overrides]\npackage_manager = \"brew\"\n").unwrap();
        let err = s.profile_overrides().unwrap_err();
        assert!(format!("{err:#}").starts_with("overrides.package_manager"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_settings(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("config file not found"));

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audit]\nlog_paths = [\"/tmp/auth\"]\n").unwrap();
        let s = load_settings(&path).unwrap();
        assert_eq!(s.audit_settings().log_paths, vec![PathBuf::from("/tmp/auth")]);
    }
}
