use once_cell::sync::Lazy;
use regex::Regex;

use super::{normalize_action, FirewallRule};
use crate::dispatch::Parsed;

static PORT_RULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(tcp|udp)\s+dport\s+(\{[^}]*\}|\S+).*?\b(accept|drop|reject)\b").unwrap()
});
static SADDR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bip6?\s+saddr\s+(\S+)").unwrap());
static HANDLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#\s*handle\s+(\d+)\s*$").unwrap());

/// Parses `nft -a list ruleset`, keeping rules that match on a destination
/// port. Table and chain scaffolding is skipped.
pub fn parse_rules(raw: &str) -> Parsed<FirewallRule> {
    let mut parsed = Parsed::default();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(caps) = PORT_RULE.captures(line) else {
            parsed.skip();
            continue;
        };
        let id = HANDLE
            .captures(line)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| (parsed.records.len() + 1).to_string());
        let source = SADDR
            .captures(line)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| "any".to_string());
        let port = caps[2]
            .trim_matches(|c| c == '{' || c == '}')
            .split(',')
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(",");
        let raw_rule = line.split(" # handle").next().unwrap_or(line);
        parsed.push(FirewallRule {
            id,
            port,
            protocol: caps[1].to_string(),
            action: normalize_action(&caps[3]),
            source,
            raw: raw_rule.to_string(),
        });
    }
    parsed
}
