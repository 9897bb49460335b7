use once_cell::sync::Lazy;
use regex::Regex;

use super::{normalize_action, FirewallRule};
use crate::dispatch::Parsed;

static RICH_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"port\s+port="?([\d-]+)"?\s+protocol="?(\w+)"?.*\b(accept|reject|drop)\b"#).unwrap()
});
static RICH_SOURCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"source\s+address="?([^"\s]+)"?"#).unwrap());

/// Parses `firewall-cmd --list-all` for the default zone.
///
/// `ports:` and `services:` become ALLOW rules; indented lines under
/// `rich rules:` become rules when they name a port. The zone header
/// (`public (active)`) is used as the source.
pub fn parse_rules(raw: &str) -> Parsed<FirewallRule> {
    let mut parsed = Parsed::default();
    let mut zone = String::new();
    let mut in_rich = false;

    for line in raw.lines() {
        let indented = line.starts_with(char::is_whitespace);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !indented {
            zone = trimmed
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
            in_rich = false;
            continue;
        }

        let Some((key, rest)) = trimmed.split_once(':').filter(|_| !trimmed.starts_with("rule ")) else {
            if in_rich {
                push_rich_rule(&mut parsed, trimmed, &zone);
            } else {
                parsed.skip();
            }
            continue;
        };
        in_rich = key == "rich rules";

        match key {
            "ports" => {
                for entry in rest.split_whitespace() {
                    let (port, proto) = entry.split_once('/').unwrap_or((entry, "any"));
                    push(&mut parsed, port, proto, "ALLOW", &zone, entry);
                }
            }
            "services" => {
                for svc in rest.split_whitespace() {
                    push(&mut parsed, svc, "service", "ALLOW", &zone, svc);
                }
            }
            _ => {}
        }
    }

    parsed
}

fn push_rich_rule(parsed: &mut Parsed<FirewallRule>, rule: &str, zone: &str) {
    let Some(caps) = RICH_PORT.captures(rule) else {
        parsed.skip();
        return;
    };
    let source = RICH_SOURCE
        .captures(rule)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| zone.to_string());
    let action = match &caps[3] {
        "reject" => "REJECT".to_string(),
        other => normalize_action(other),
    };
    push(parsed, &caps[1], &caps[2], &action, &source, rule);
}

fn push(parsed: &mut Parsed<FirewallRule>, port: &str, proto: &str, action: &str, source: &str, raw: &str) {
    let id = (parsed.records.len() + 1).to_string();
    parsed.push(FirewallRule {
        id,
        port: port.to_string(),
        protocol: proto.to_string(),
        action: action.to_string(),
        source: source.to_string(),
        raw: raw.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_ALL: &str = "public (active)
  target: default
  icmp-block-inversion: no
  interfaces: eth0
  sources:
  services: dhcpv6-client ssh
  ports: 8080/tcp 53/udp
  protocols:
  forward: yes
  masquerade: no
  forward-ports:
  source-ports:
  icmp-blocks:
  rich rules:
\trule family=\"ipv4\" source address=\"10.0.0.5\" port port=\"5432\" protocol=\"tcp\" reject
\trule family=\"ipv4\" service name=\"http\" accept
";

    #[test]
    fn zone_listing_becomes_rules() {
        let parsed = parse_rules(LIST_ALL);
        let summary: Vec<(&str, &str, &str, &str)> = parsed
            .records
            .iter()
            .map(|r| (r.port.as_str(), r.protocol.as_str(), r.action.as_str(), r.source.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("dhcpv6-client", "service", "ALLOW", "public"),
                ("ssh", "service", "ALLOW", "public"),
                ("8080", "tcp", "ALLOW", "public"),
                ("53", "udp", "ALLOW", "public"),
                ("5432", "tcp", "REJECT", "10.0.0.5"),
            ]
        );
        assert_eq!(parsed.records[4].id, "5");
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn not_running_output_yields_nothing() {
        let parsed = parse_rules("FirewallD is not running");
        assert!(parsed.records.is_empty());
    }
}
