use once_cell::sync::Lazy;
use regex::Regex;

use super::{normalize_action, FirewallRule};
use crate::dispatch::Parsed;

static NUMBERED_RULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[\s*(\d+)\]\s+(.+?)\s+(ALLOW|DENY|REJECT|LIMIT)(?:\s+(?:IN|OUT|FWD))?\s+(.+?)\s*$")
        .unwrap()
});

/// Parses `ufw status numbered`.
///
/// `To` may be `22/tcp`, a bare port, an application profile name, and may
/// carry a ` (v6)` suffix.
pub fn parse_rules(raw: &str) -> Parsed<FirewallRule> {
    let mut parsed = Parsed::default();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(caps) = NUMBERED_RULE.captures(line) else {
            parsed.skip();
            continue;
        };
        let to = caps[2].trim_end_matches("(v6)").trim();
        let (port, protocol) = match to.split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (to, "any"),
        };
        parsed.push(FirewallRule {
            id: caps[1].to_string(),
            port: port.to_string(),
            protocol: protocol.to_string(),
            action: normalize_action(&caps[3]),
            source: caps[4].to_string(),
            raw: line.to_string(),
        });
    }
    parsed
}
