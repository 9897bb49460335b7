use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::info;

use super::Host;
use crate::dispatch::{validate_name, CommandTemplate, Parsed};
use crate::error::{Error, Result};
use crate::exec::CommandResult;
use crate::profile::{InitSystem, PackageManager, SystemProfile};

const RUNIT_SERVICE_DIR: &str = "/var/service";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServiceUnit {
    pub name: String,
    pub load: String,
    pub active: String,
    pub sub: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub active: bool,
    pub state: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceOp {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
    Status,
    List,
    Logs,
}

impl ServiceOp {
    fn verb(self) -> &'static str {
        match self {
            ServiceOp::Start => "start",
            ServiceOp::Stop => "stop",
            ServiceOp::Restart => "restart",
            ServiceOp::Enable => "enable",
            ServiceOp::Disable => "disable",
            ServiceOp::Status => "status",
            ServiceOp::List => "list services",
            ServiceOp::Logs => "service logs",
        }
    }
}

/// sysvinit enablement depends on the distribution family, so the lookup
/// takes the whole profile.
pub fn template(profile: &SystemProfile, op: ServiceOp) -> Result<CommandTemplate> {
    use InitSystem::*;
    use ServiceOp::*;

    let init = profile.init_system;
    let pm = profile.package_manager;
    let t = match (init, op) {
        (Systemd, Start) => CommandTemplate::new("systemctl", &["start", "{name}"]),
        (Systemd, Stop) => CommandTemplate::new("systemctl", &["stop", "{name}"]),
        (Systemd, Restart) => CommandTemplate::new("systemctl", &["restart", "{name}"]),
        (Systemd, Enable) => CommandTemplate::new("systemctl", &["enable", "{name}"]),
        (Systemd, Disable) => CommandTemplate::new("systemctl", &["disable", "{name}"]),
        (Systemd, Status) => CommandTemplate::new("systemctl", &["is-active", "{name}"]),
        (Systemd, List) => CommandTemplate::new(
            "systemctl",
            &["list-units", "--type=service", "--all", "--no-legend", "--no-pager", "--plain"],
        ),
        (Systemd, Logs) => {
            CommandTemplate::new("journalctl", &["-u", "{name}", "-n", "{lines}", "--no-pager"])
        }

        (Sysvinit, Start) => CommandTemplate::new("service", &["{name}", "start"]),
        (Sysvinit, Stop) => CommandTemplate::new("service", &["{name}", "stop"]),
        (Sysvinit, Restart) => CommandTemplate::new("service", &["{name}", "restart"]),
        (Sysvinit, Enable | Disable) if pm == PackageManager::Unknown => {
            return Err(Error::unsupported_backend("package manager", pm))
        }
        (Sysvinit, Enable) if pm == PackageManager::Apt => {
            CommandTemplate::new("update-rc.d", &["{name}", "enable"])
        }
        (Sysvinit, Enable) => CommandTemplate::new("chkconfig", &["{name}", "on"]),
        (Sysvinit, Disable) if pm == PackageManager::Apt => {
            CommandTemplate::new("update-rc.d", &["{name}", "disable"])
        }
        (Sysvinit, Disable) => CommandTemplate::new("chkconfig", &["{name}", "off"]),
        (Sysvinit, Status) => CommandTemplate::new("service", &["{name}", "status"]),
        // exits non-zero whenever any script lacks a status action
        (Sysvinit, List) => CommandTemplate::new("service", &["--status-all"]).tolerating(&[1, 3, 4]),

        (Openrc, Start) => CommandTemplate::new("rc-service", &["{name}", "start"]),
        (Openrc, Stop) => CommandTemplate::new("rc-service", &["{name}", "stop"]),
        (Openrc, Restart) => CommandTemplate::new("rc-service", &["{name}", "restart"]),
        (Openrc, Enable) => CommandTemplate::new("rc-update", &["add", "{name}", "default"]),
        (Openrc, Disable) => CommandTemplate::new("rc-update", &["del", "{name}", "default"]),
        (Openrc, Status) => CommandTemplate::new("rc-service", &["{name}", "status"]),
        (Openrc, List) => CommandTemplate::new("rc-status", &["--all"]),

        (Runit, Start) => CommandTemplate::new("sv", &["start", "{name}"]),
        (Runit, Stop) => CommandTemplate::new("sv", &["stop", "{name}"]),
        (Runit, Restart) => CommandTemplate::new("sv", &["restart", "{name}"]),
        (Runit, Enable) => {
            CommandTemplate::new("ln", &["-s", "/etc/sv/{name}", "/var/service/{name}"])
        }
        (Runit, Disable) => CommandTemplate::new("rm", &["/var/service/{name}"]),
        (Runit, Status) => CommandTemplate::new("sv", &["status", "{name}"]),
        // service directories are appended at call time
        (Runit, List) => CommandTemplate::new("sv", &["status"]),

        (Sysvinit | Openrc | Runit, Logs) => {
            return Err(Error::unsupported_operation("service logs", init))
        }
        (Unknown, _) => return Err(Error::unsupported_backend("init system", init)),
    };
    Ok(t)
}

/// Service lifecycle across systemd, sysvinit, OpenRC and runit.
pub struct Services {
    host: Host,
}

impl Services {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    fn init(&self) -> InitSystem {
        self.host.profile().init_system
    }

    pub async fn start(&self, name: &str) -> Result<CommandResult> {
        self.lifecycle(ServiceOp::Start, name).await
    }

    pub async fn stop(&self, name: &str) -> Result<CommandResult> {
        self.lifecycle(ServiceOp::Stop, name).await
    }

    pub async fn restart(&self, name: &str) -> Result<CommandResult> {
        self.lifecycle(ServiceOp::Restart, name).await
    }

    pub async fn enable(&self, name: &str) -> Result<CommandResult> {
        self.lifecycle(ServiceOp::Enable, name).await
    }

    pub async fn disable(&self, name: &str) -> Result<CommandResult> {
        self.lifecycle(ServiceOp::Disable, name).await
    }

    /// Enables at boot, then starts.
    pub async fn enable_now(&self, name: &str) -> Result<()> {
        self.enable(name).await?;
        self.start(name).await?;
        Ok(())
    }

    /// Stops, then disables at boot.
    pub async fn disable_now(&self, name: &str) -> Result<()> {
        self.stop(name).await?;
        self.disable(name).await?;
        Ok(())
    }

    /// A stopped service is a state, not an error.
    pub async fn status(&self, name: &str) -> Result<ServiceStatus> {
        validate_name("service", name)?;
        let inv = template(self.host.profile(), ServiceOp::Status)?.render(&[("name", name)]);
        let out = self.host.run_any_exit(&format!("status {name}"), &inv).await?;
        Ok(parse_status(self.init(), name, &out))
    }

    pub async fn list(&self) -> Result<Vec<ServiceUnit>> {
        let init = self.init();
        let mut inv = template(self.host.profile(), ServiceOp::List)?.render(&[]);
        if init == InitSystem::Runit {
            let dirs = runit_service_dirs().await?;
            if dirs.is_empty() {
                return Ok(Vec::new());
            }
            inv.args.extend(dirs);
            let out = self.host.run_any_exit(ServiceOp::List.verb(), &inv).await?;
            return Ok(parse_runit_status(&out.stdout).into_records("sv"));
        }
        let out = self.host.run(ServiceOp::List.verb(), &inv).await?;
        let parsed = match init {
            InitSystem::Systemd => parse_systemd_units(&out.stdout),
            InitSystem::Sysvinit => parse_sysv_status_all(&out.stdout),
            InitSystem::Openrc => parse_rc_status(&out.stdout),
            InitSystem::Runit | InitSystem::Unknown => Parsed::default(),
        };
        Ok(parsed.into_records(&inv.program))
    }

    pub async fn logs(&self, name: &str, lines: usize) -> Result<Vec<String>> {
        validate_name("service", name)?;
        let lines = lines.to_string();
        let inv = template(self.host.profile(), ServiceOp::Logs)?
            .render(&[("name", name), ("lines", lines.as_str())]);
        let out = self.host.run(&format!("logs for {name}"), &inv).await?;
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    async fn lifecycle(&self, op: ServiceOp, name: &str) -> Result<CommandResult> {
        validate_name("service", name)?;
        let inv = template(self.host.profile(), op)?.render(&[("name", name)]);
        info!(init = %self.init(), service = name, "{} service", op.verb());
        self.host.run(&format!("{} {name}", op.verb()), &inv).await
    }
}

async fn runit_service_dirs() -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(RUNIT_SERVICE_DIR)
        .await
        .map_err(Error::io(RUNIT_SERVICE_DIR))?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(Error::io(RUNIT_SERVICE_DIR))?
    {
        dirs.push(entry.path().to_string_lossy().to_string());
    }
    dirs.sort();
    Ok(dirs)
}

pub fn parse_status(init: InitSystem, name: &str, out: &CommandResult) -> ServiceStatus {
    let first = out.stdout.lines().next().unwrap_or_default().trim();
    let (active, state) = match init {
        InitSystem::Systemd => {
            let state = if first.is_empty() { "unknown" } else { first };
            (state == "active", state.to_string())
        }
        InitSystem::Openrc => {
            let state = out
                .stdout
                .lines()
                .find_map(|l| l.split_once("status:").map(|(_, s)| s.trim().to_string()))
                .unwrap_or_else(|| exit_state(out).to_string());
            (state == "started", state)
        }
        InitSystem::Runit => {
            let state = first
                .split_once(':')
                .map(|(s, _)| s.trim().to_string())
                .unwrap_or_else(|| exit_state(out).to_string());
            (state == "run", state)
        }
        InitSystem::Sysvinit | InitSystem::Unknown => {
            (out.success(), exit_state(out).to_string())
        }
    };
    ServiceStatus {
        name: name.to_string(),
        active,
        state,
    }
}

fn exit_state(out: &CommandResult) -> &'static str {
    if out.success() {
        "running"
    } else {
        "stopped"
    }
}

/// `systemctl list-units --plain --no-legend`:
/// `UNIT LOAD ACTIVE SUB DESCRIPTION...`
pub fn parse_systemd_units(raw: &str) -> Parsed<ServiceUnit> {
    let mut parsed = Parsed::default();
    for line in raw.lines() {
        let line = line.trim().trim_start_matches('●').trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 || !tokens[0].contains('.') {
            parsed.skip();
            continue;
        }
        parsed.push(ServiceUnit {
            name: tokens[0].trim_end_matches(".service").to_string(),
            load: tokens[1].to_string(),
            active: tokens[2].to_string(),
            sub: tokens[3].to_string(),
            description: tokens[4..].join(" "),
        });
    }
    parsed
}

static SYSV_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[\s*([+?-])\s*\]\s+(\S+)").unwrap());

/// `service --status-all`: ` [ + ]  cron`.
pub fn parse_sysv_status_all(raw: &str) -> Parsed<ServiceUnit> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let Some(caps) = SYSV_LINE.captures(line) else {
            parsed.skip();
            continue;
        };
        let (active, sub) = match &caps[1] {
            "+" => ("active", "running"),
            "-" => ("inactive", "stopped"),
            _ => ("unknown", "unknown"),
        };
        parsed.push(ServiceUnit {
            name: caps[2].to_string(),
            active: active.to_string(),
            sub: sub.to_string(),
            ..ServiceUnit::default()
        });
    }
    parsed
}

static RC_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\S+)\s+\[\s*([\w ]+?)\s*\]").unwrap());

/// `rc-status --all`: `Runlevel:` headers, then ` sshd  [  started  ]`.
pub fn parse_rc_status(raw: &str) -> Parsed<ServiceUnit> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        if line.trim_start().starts_with("Runlevel:") || line.trim_start().starts_with("Dynamic Runlevel:") {
            continue;
        }
        let Some(caps) = RC_LINE.captures(line) else {
            parsed.skip();
            continue;
        };
        let sub = caps[2].to_string();
        let active = if sub == "started" { "active" } else { "inactive" };
        parsed.push(ServiceUnit {
            name: caps[1].to_string(),
            active: active.to_string(),
            sub,
            ..ServiceUnit::default()
        });
    }
    parsed
}

static RUNIT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+):\s+([^:]+):").unwrap());

/// `sv status <dirs>`: `run: /var/service/sshd: (pid 812) 3600s`.
pub fn parse_runit_status(raw: &str) -> Parsed<ServiceUnit> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let Some(caps) = RUNIT_LINE.captures(line.trim()) else {
            parsed.skip();
            continue;
        };
        let state = caps[1].to_string();
        let path = caps[2].trim();
        let name = path.rsplit('/').next().unwrap_or(path);
        let active = if state == "run" { "active" } else { "inactive" };
        parsed.push(ServiceUnit {
            name: name.to_string(),
            active: active.to_string(),
            sub: state,
            ..ServiceUnit::default()
        });
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;
    use crate::dispatch::Invocation;
    use crate::managers::testing::host;

    fn invocation(profile: &SystemProfile, op: ServiceOp, name: &str) -> Result<Invocation> {
        validate_name("service", name)?;
        Ok(template(profile, op)?.render(&[("name", name)]))
    }

    fn profile(init: InitSystem, pm: PackageManager) -> SystemProfile {
        SystemProfile {
            init_system: init,
            package_manager: pm,
            ..SystemProfile::default()
        }
    }

    #[tokio::test]
    async fn lifecycle_dispatch_per_init_system() {
        let cases: &[(InitSystem, &[&str], &[&str], &[&str])] = &[
            (
                InitSystem::Systemd,
                &["systemctl", "start", "sshd"],
                &["systemctl", "stop", "sshd"],
                &["systemctl", "restart", "sshd"],
            ),
            (
                InitSystem::Sysvinit,
                &["service", "sshd", "start"],
                &["service", "sshd", "stop"],
                &["service", "sshd", "restart"],
            ),
            (
                InitSystem::Openrc,
                &["rc-service", "sshd", "start"],
                &["rc-service", "sshd", "stop"],
                &["rc-service", "sshd", "restart"],
            ),
            (
                InitSystem::Runit,
                &["sv", "start", "sshd"],
                &["sv", "stop", "sshd"],
                &["sv", "restart", "sshd"],
            ),
        ];
        for (init, start, stop, restart) in cases {
            let (host, exec) = host(profile(*init, PackageManager::Apt), FakeExecutor::new());
            let svc = Services::new(host);
            svc.start("sshd").await.unwrap();
            assert_eq!(exec.last_call().argv(), start.to_vec(), "{init} start");
            svc.stop("sshd").await.unwrap();
            assert_eq!(exec.last_call().argv(), stop.to_vec(), "{init} stop");
            svc.restart("sshd").await.unwrap();
            assert_eq!(exec.last_call().argv(), restart.to_vec(), "{init} restart");
        }
    }

    #[test]
    fn enablement_templates() {
        let argv = |init, pm, op| {
            invocation(&profile(init, pm), op, "cron")
                .unwrap()
                .argv()
                .join(" ")
        };
        assert_eq!(argv(InitSystem::Systemd, PackageManager::Dnf, ServiceOp::Enable), "systemctl enable cron");
        assert_eq!(argv(InitSystem::Sysvinit, PackageManager::Apt, ServiceOp::Enable), "update-rc.d cron enable");
        assert_eq!(argv(InitSystem::Sysvinit, PackageManager::Yum, ServiceOp::Disable), "chkconfig cron off");
        assert_eq!(argv(InitSystem::Openrc, PackageManager::Apk, ServiceOp::Enable), "rc-update add cron default");
        assert_eq!(
            argv(InitSystem::Runit, PackageManager::Unknown, ServiceOp::Enable),
            "ln -s /etc/sv/cron /var/service/cron"
        );
        assert_eq!(argv(InitSystem::Runit, PackageManager::Unknown, ServiceOp::Disable), "rm /var/service/cron");
    }

    #[tokio::test]
    async fn unknown_init_is_unsupported() {
        let (host, exec) = host(profile(InitSystem::Unknown, PackageManager::Apt), FakeExecutor::new());
        let err = Services::new(host).start("sshd").await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported init system backend: unknown");
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn sysvinit_enablement_needs_a_known_distribution() {
        let (h, exec) = host(profile(InitSystem::Sysvinit, PackageManager::Unknown), FakeExecutor::new());
        let services = Services::new(h);
        for result in [services.enable("ntpd").await, services.disable("ntpd").await] {
            assert_eq!(
                result.unwrap_err().to_string(),
                "unsupported package manager backend: unknown"
            );
        }
        assert!(exec.calls().is_empty());
        // start/stop do not depend on the distribution
        services.start("ntpd").await.unwrap();
        assert_eq!(exec.last_call().argv(), vec!["service", "ntpd", "start"]);
    }

    #[tokio::test]
    async fn logs_need_journald() {
        let (h, _) = host(profile(InitSystem::Openrc, PackageManager::Apk), FakeExecutor::new());
        let err = Services::new(h).logs("sshd", 20).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));

        let exec = FakeExecutor::new().respond("journalctl", "line one\nline two");
        let (h, exec) = host(profile(InitSystem::Systemd, PackageManager::Apt), exec);
        let lines = Services::new(h).logs("sshd", 20).await.unwrap();
        assert_eq!(lines, vec!["line one", "line two"]);
        assert_eq!(
            exec.last_call().argv(),
            vec!["journalctl", "-u", "sshd", "-n", "20", "--no-pager"]
        );
    }

    #[tokio::test]
    async fn inactive_unit_is_a_status_not_an_error() {
        let exec = FakeExecutor::new().script_with("systemctl", "inactive", "", 3);
        let (host, _) = host(profile(InitSystem::Systemd, PackageManager::Apt), exec);
        let status = Services::new(host).status("nginx").await.unwrap();
        assert!(!status.active);
        assert_eq!(status.state, "inactive");
    }

    #[test]
    fn status_parsing_per_backend() {
        let out = |stdout: &str, code| CommandResult {
            stdout: stdout.into(),
            exit_code: Some(code),
            ..CommandResult::default()
        };
        let s = parse_status(InitSystem::Openrc, "sshd", &out(" * status: started", 0));
        assert!(s.active);
        assert_eq!(s.state, "started");
        let s = parse_status(InitSystem::Runit, "sshd", &out("down: sshd: 12s, normally up", 0));
        assert!(!s.active);
        assert_eq!(s.state, "down");
        let s = parse_status(InitSystem::Sysvinit, "cron", &out("cron is not running", 3));
        assert!(!s.active);
        assert_eq!(s.state, "stopped");
    }

    #[test]
    fn systemd_units() {
        let raw = "ssh.service loaded active running OpenBSD Secure Shell server\n\
● nginx.service loaded failed failed A high performance web server\n\
garbage\n";
        let parsed = parse_systemd_units(raw);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.records[0].name, "ssh");
        assert_eq!(parsed.records[0].sub, "running");
        assert_eq!(parsed.records[0].description, "OpenBSD Secure Shell server");
        assert_eq!(parsed.records[1].name, "nginx");
        assert_eq!(parsed.records[1].active, "failed");
    }

    #[test]
    fn sysv_and_openrc_and_runit_listings() {
        let sysv = parse_sysv_status_all(" [ + ]  cron\n [ - ]  nginx\n [ ? ]  hwclock.sh\n");
        assert_eq!(sysv.records.len(), 3);
        assert_eq!(sysv.records[1].active, "inactive");

        let rc = parse_rc_status(
            "Runlevel: default\n sshd        [  started  ]\n crond       [  stopped  ]\nDynamic Runlevel: hotplugged\n",
        );
        assert_eq!(rc.records.len(), 2);
        assert_eq!(rc.records[0].name, "sshd");
        assert_eq!(rc.records[1].sub, "stopped");

        let runit = parse_runit_status(
            "run: /var/service/sshd: (pid 812) 3600s\ndown: /var/service/dhcpcd: 5s, normally up\n",
        );
        assert_eq!(runit.records.len(), 2);
        assert_eq!(runit.records[0].name, "sshd");
        assert_eq!(runit.records[0].active, "active");
        assert_eq!(runit.records[1].sub, "down");
    }
}
