use super::{normalize_action, FirewallRule};
use crate::dispatch::Parsed;

/// Parses `iptables -L <chain> -n --line-numbers`.
///
/// Columns are `num target prot opt source destination [match...]`. Newer
/// iptables prints numeric protocols and may leave `opt` empty.
pub fn parse_rules(raw: &str) -> Parsed<FirewallRule> {
    let mut parsed = Parsed::default();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 || tokens[0].parse::<u32>().is_err() {
            parsed.skip();
            continue;
        }
        let mut rest = &tokens[3..];
        if rest[0] == "--" || (rest[0].starts_with('-') && !rest[0].contains('/')) {
            rest = &rest[1..];
        }
        if rest.len() < 2 {
            parsed.skip();
            continue;
        }
        let matches = rest[2..].join(" ");
        parsed.push(FirewallRule {
            id: tokens[0].to_string(),
            port: destination_port(&matches).unwrap_or_else(|| "any".to_string()),
            protocol: protocol_name(tokens[2]).to_string(),
            action: normalize_action(tokens[1]),
            source: rest[0].to_string(),
            raw: line.to_string(),
        });
    }
    parsed
}

fn protocol_name(prot: &str) -> &str {
    match prot {
        "6" => "tcp",
        "17" => "udp",
        "0" => "all",
        other => other,
    }
}

fn destination_port(matches: &str) -> Option<String> {
    matches.split_whitespace().find_map(|m| {
        m.strip_prefix("dpt:")
            .or_else(|| m.strip_prefix("dpts:"))
            .map(str::to_string)
    })
}
