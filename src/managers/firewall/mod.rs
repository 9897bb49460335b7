use serde::Serialize;
use tracing::{debug, info};

use super::{Host, Services};
use crate::dispatch::{CommandTemplate, ParseFn, Parsed};
use crate::error::{Error, Result};
use crate::profile::FirewallBackend;

pub mod firewalld;
pub mod iptables;
pub mod nftables;
pub mod ufw;

/// One rule as shown to callers, whatever backend produced it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FirewallRule {
    pub id: String,
    pub port: String,
    pub protocol: String,
    pub action: String,
    pub source: String,
    pub raw: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirewallOp {
    Allow,
    Deny,
    List,
    Enable,
    Disable,
    Reload,
}

pub fn template(backend: FirewallBackend, op: FirewallOp) -> Result<CommandTemplate> {
    use FirewallBackend::*;
    use FirewallOp::*;

    let t = match (backend, op) {
        (Ufw, Allow) => CommandTemplate::new("ufw", &["allow", "{port}/{proto}"]),
        (Ufw, Deny) => CommandTemplate::new("ufw", &["deny", "{port}/{proto}"]),
        (Ufw, List) => CommandTemplate::new("ufw", &["status", "numbered"]),
        (Ufw, Enable) => CommandTemplate::new("ufw", &["--force", "enable"]),
        (Ufw, Disable) => CommandTemplate::new("ufw", &["disable"]),

        (Firewalld, Allow) => {
            CommandTemplate::new("firewall-cmd", &["--permanent", "--add-port={port}/{proto}"])
        }
        (Firewalld, Deny) => CommandTemplate::new(
            "firewall-cmd",
            &[
                "--permanent",
                r#"--add-rich-rule=rule port port="{port}" protocol="{proto}" reject"#,
            ],
        ),
        (Firewalld, List) => CommandTemplate::new("firewall-cmd", &["--list-all"]),
        (Firewalld, Reload) => CommandTemplate::new("firewall-cmd", &["--reload"]),

        (Nftables, Allow) => CommandTemplate::new(
            "nft",
            &["add", "rule", "inet", "filter", "input", "{proto}", "dport", "{port}", "accept"],
        ),
        (Nftables, Deny) => CommandTemplate::new(
            "nft",
            &["add", "rule", "inet", "filter", "input", "{proto}", "dport", "{port}", "drop"],
        ),
        (Nftables, List) => CommandTemplate::new("nft", &["-a", "list", "ruleset"]),

        (Iptables, Allow) => CommandTemplate::new(
            "iptables",
            &["-A", "INPUT", "-p", "{proto}", "--dport", "{port}", "-j", "ACCEPT"],
        ),
        (Iptables, Deny) => CommandTemplate::new(
            "iptables",
            &["-A", "INPUT", "-p", "{proto}", "--dport", "{port}", "-j", "DROP"],
        ),
        (Iptables, List) => {
            CommandTemplate::new("iptables", &["-L", "INPUT", "-n", "--line-numbers"])
        }

        // firewalld and nftables are toggled as services, see Firewall::enable.
        // Only firewalld stages rules that need a reload.
        (Firewalld | Nftables | Iptables, Enable | Disable) | (Ufw | Nftables | Iptables, Reload) => {
            return Err(Error::unsupported_operation(op_name(op), backend))
        }
        (Unknown, _) => return Err(Error::unsupported_backend("firewall", backend)),
    };
    Ok(t)
}

fn op_name(op: FirewallOp) -> &'static str {
    match op {
        FirewallOp::Allow => "allow",
        FirewallOp::Deny => "deny",
        FirewallOp::List => "list rules",
        FirewallOp::Enable => "enable firewall",
        FirewallOp::Disable => "disable firewall",
        FirewallOp::Reload => "reload",
    }
}

pub fn rule_parser(backend: FirewallBackend) -> Result<ParseFn<FirewallRule>> {
    match backend {
        FirewallBackend::Ufw => Ok(ufw::parse_rules),
        FirewallBackend::Firewalld => Ok(firewalld::parse_rules),
        FirewallBackend::Nftables => Ok(nftables::parse_rules),
        FirewallBackend::Iptables => Ok(iptables::parse_rules),
        FirewallBackend::Unknown => Err(Error::unsupported_backend("firewall", backend)),
    }
}

/// Fallback for output no backend parser understood: one INFO record per
/// non-empty line.
pub fn parse_raw(raw: &str) -> Parsed<FirewallRule> {
    let mut parsed = Parsed::default();
    for (i, line) in raw.lines().map(str::trim).filter(|l| !l.is_empty()).enumerate() {
        parsed.push(FirewallRule {
            id: (i + 1).to_string(),
            action: "INFO".to_string(),
            raw: line.to_string(),
            ..FirewallRule::default()
        });
    }
    parsed
}

/// Maps backend verdicts onto the ufw vocabulary.
pub(crate) fn normalize_action(action: &str) -> String {
    match action.to_ascii_uppercase().as_str() {
        "ACCEPT" | "ALLOW" => "ALLOW".to_string(),
        "DROP" | "DENY" => "DENY".to_string(),
        other => other.to_string(),
    }
}

/// Port rules across ufw, firewalld, nftables and iptables.
pub struct Firewall {
    host: Host,
}

impl Firewall {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    fn backend(&self) -> FirewallBackend {
        self.host.profile().firewall
    }

    pub async fn list_rules(&self) -> Result<Vec<FirewallRule>> {
        let backend = self.backend();
        let inv = template(backend, FirewallOp::List)?.render(&[]);
        let parse = rule_parser(backend)?;
        let out = self.host.run("list firewall rules", &inv).await?;
        let parsed = parse(&out.stdout);
        if parsed.records.is_empty() && parsed.skipped > 0 {
            debug!(%backend, "rule listing not understood; returning raw lines");
            return Ok(parse_raw(&out.stdout).records);
        }
        Ok(parsed.into_records(backend.as_str()))
    }

    pub async fn allow(&self, port: u16, proto: Protocol) -> Result<()> {
        self.port_rule(FirewallOp::Allow, port, proto).await
    }

    pub async fn deny(&self, port: u16, proto: Protocol) -> Result<()> {
        self.port_rule(FirewallOp::Deny, port, proto).await
    }

    pub async fn enable(&self) -> Result<()> {
        match self.backend() {
            FirewallBackend::Firewalld => self.services().enable_now("firewalld").await,
            FirewallBackend::Nftables => self.services().enable_now("nftables").await,
            backend => {
                let inv = template(backend, FirewallOp::Enable)?.render(&[]);
                info!(%backend, "enabling firewall");
                self.host.run("enable firewall", &inv).await.map(|_| ())
            }
        }
    }

    pub async fn disable(&self) -> Result<()> {
        match self.backend() {
            FirewallBackend::Firewalld => self.services().disable_now("firewalld").await,
            FirewallBackend::Nftables => self.services().disable_now("nftables").await,
            backend => {
                let inv = template(backend, FirewallOp::Disable)?.render(&[]);
                info!(%backend, "disabling firewall");
                self.host.run("disable firewall", &inv).await.map(|_| ())
            }
        }
    }

    fn services(&self) -> Services {
        Services::new(self.host.clone())
    }

    async fn port_rule(&self, op: FirewallOp, port: u16, proto: Protocol) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidArgument("port 0 is not a valid rule target".into()));
        }
        let backend = self.backend();
        let port_str = port.to_string();
        let inv = template(backend, op)?
            .render(&[("port", port_str.as_str()), ("proto", proto.as_str())]);
        let operation = format!("{} {port}/{}", op_name(op), proto.as_str());
        info!(%backend, port, proto = proto.as_str(), "{}", op_name(op));
        self.host.run(&operation, &inv).await?;

        // firewalld only applies --permanent changes after a reload
        if backend == FirewallBackend::Firewalld {
            let reload = template(backend, FirewallOp::Reload)?.render(&[]);
            self.host.run("reload firewalld", &reload).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeExecutor;
    use crate::managers::testing::host;
    use crate::profile::{InitSystem, SystemProfile};

    fn firewall(backend: FirewallBackend, exec: FakeExecutor) -> (Firewall, std::sync::Arc<FakeExecutor>) {
        let profile = SystemProfile {
            firewall: backend,
            init_system: InitSystem::Systemd,
            ..SystemProfile::default()
        };
        let (host, exec) = host(profile, exec);
        (Firewall::new(host), exec)
    }

    #[tokio::test]
    async fn ufw_numbered_status_scenario() {
        let exec = FakeExecutor::new().respond(
            "ufw",
            "Status: active\n\n     To                         Action      From\n     --                         ------      ----\n[ 1] 22/tcp                     ALLOW IN    Anywhere\n",
        );
        let (fw, exec) = firewall(FirewallBackend::Ufw, exec);
        let rules = fw.list_rules().await.unwrap();
        assert_eq!(exec.last_call().argv(), vec!["ufw", "status", "numbered"]);
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.id, "1");
        assert_eq!(rule.port, "22");
        assert_eq!(rule.protocol, "tcp");
        assert_eq!(rule.action, "ALLOW");
        assert_eq!(rule.source, "Anywhere");
    }

    #[tokio::test]
    async fn unrecognized_listing_degrades_to_raw_lines() {
        let exec = FakeExecutor::new().respond("ufw", "Status: inactive\n\nsomething else\n");
        let (fw, _) = firewall(FirewallBackend::Ufw, exec);
        let rules = fw.list_rules().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.action == "INFO"));
        assert_eq!(rules[0].raw, "Status: inactive");
        assert_eq!(rules[1].id, "2");
    }

    #[tokio::test]
    async fn firewalld_allow_reloads() {
        let (fw, exec) = firewall(FirewallBackend::Firewalld, FakeExecutor::new());
        fw.allow(8080, Protocol::Tcp).await.unwrap();
        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].argv(), vec!["firewall-cmd", "--permanent", "--add-port=8080/tcp"]);
        assert_eq!(calls[1].argv(), vec!["firewall-cmd", "--reload"]);
    }

    #[tokio::test]
    async fn other_backends_do_not_reload() {
        for (backend, expected) in [
            (FirewallBackend::Ufw, vec!["ufw", "deny", "53/udp"]),
            (
                FirewallBackend::Iptables,
                vec!["iptables", "-A", "INPUT", "-p", "udp", "--dport", "53", "-j", "DROP"],
            ),
            (
                FirewallBackend::Nftables,
                vec!["nft", "add", "rule", "inet", "filter", "input", "udp", "dport", "53", "drop"],
            ),
        ] {
            let (fw, exec) = firewall(backend, FakeExecutor::new());
            fw.deny(53, Protocol::Udp).await.unwrap();
            let calls = exec.calls();
            assert_eq!(calls.len(), 1, "{backend}");
            assert_eq!(calls[0].argv(), expected);
        }
    }

    #[test]
    fn only_firewalld_has_a_reload() {
        assert!(template(FirewallBackend::Firewalld, FirewallOp::Reload).is_ok());
        for backend in [FirewallBackend::Ufw, FirewallBackend::Nftables, FirewallBackend::Iptables] {
            assert!(matches!(
                template(backend, FirewallOp::Reload),
                Err(Error::UnsupportedOperation { .. })
            ));
        }
    }

    #[tokio::test]
    async fn firewalld_enable_goes_through_service_manager() {
        let (fw, exec) = firewall(FirewallBackend::Firewalld, FakeExecutor::new());
        fw.enable().await.unwrap();
        let argv: Vec<Vec<String>> = exec
            .calls()
            .iter()
            .map(|c| c.argv().iter().map(|s| s.to_string()).collect())
            .collect();
        assert_eq!(
            argv,
            vec![
                vec!["systemctl", "enable", "firewalld"],
                vec!["systemctl", "start", "firewalld"],
            ]
        );
    }

    #[tokio::test]
    async fn iptables_cannot_be_toggled() {
        let (fw, exec) = firewall(FirewallBackend::Iptables, FakeExecutor::new());
        assert!(matches!(
            fw.disable().await,
            Err(Error::UnsupportedOperation { .. })
        ));
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_firewall_fails_fast() {
        let (fw, exec) = firewall(FirewallBackend::Unknown, FakeExecutor::new());
        let err = fw.allow(22, Protocol::Tcp).await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported firewall backend: unknown");
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn raw_parser_skips_blank_lines() {
        let parsed = parse_raw("a\n\n  \nb\n");
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[1].raw, "b");
    }
}
