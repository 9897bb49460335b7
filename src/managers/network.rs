use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::scan::{scan_ports, PortProbe, ScanOptions};
use super::Host;
use crate::dispatch::{CommandTemplate, Parsed};
use crate::error::{Error, Result};
use crate::profile::NetworkStack;

const NETPLAN_DIR: &str = "/etc/netplan";
const IFCFG_DIR: &str = "/etc/sysconfig/network-scripts";
const INTERFACES_FILE: &str = "/etc/network/interfaces";

const IP_ADDR: CommandTemplate = CommandTemplate::new("ip", &["-j", "addr", "show"]);
const SS_LISTEN: CommandTemplate = CommandTemplate::new("ss", &["-tulnH"]);
const NMCLI_CONNECTIONS: CommandTemplate =
    CommandTemplate::new("nmcli", &["-t", "-f", "NAME,TYPE,DEVICE", "connection", "show"]);
const NETWORKCTL_LIST: CommandTemplate =
    CommandTemplate::new("networkctl", &["list", "--no-legend", "--no-pager"]);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Interface {
    pub name: String,
    pub state: String,
    pub mac: String,
    pub mtu: Option<u32>,
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ListeningSocket {
    pub protocol: String,
    pub state: String,
    pub address: String,
    pub port: u16,
}

/// A configured connection as the host's network stack sees it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetConnection {
    pub name: String,
    pub kind: String,
    pub device: String,
    pub state: String,
}

pub struct Network {
    host: Host,
}

impl Network {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    pub async fn interfaces(&self) -> Result<Vec<Interface>> {
        let out = self.host.run("list interfaces", &IP_ADDR.render(&[])).await?;
        Ok(parse_ip_addr(&out.stdout)?.into_records("ip"))
    }

    pub async fn listening(&self) -> Result<Vec<ListeningSocket>> {
        let out = self.host.run("list listening sockets", &SS_LISTEN.render(&[])).await?;
        Ok(parse_ss_listening(&out.stdout).into_records("ss"))
    }

    /// Configured connections, read through whichever stack manages them.
    pub async fn connections(&self) -> Result<Vec<NetConnection>> {
        let stack = self.host.profile().network_stack;
        let parsed = match stack {
            NetworkStack::Netplan => {
                let mut parsed = Parsed::default();
                for (file, content) in read_config_dir(NETPLAN_DIR, |n| {
                    n.ends_with(".yaml") || n.ends_with(".yml")
                })
                .await?
                {
                    let one = parse_netplan(&file, &content);
                    parsed.records.extend(one.records);
                    parsed.skipped += one.skipped;
                }
                parsed
            }
            NetworkStack::NetworkManager => {
                let out = self
                    .host
                    .run("list connections", &NMCLI_CONNECTIONS.render(&[]))
                    .await?;
                parse_nmcli_connections(&out.stdout)
            }
            NetworkStack::SystemdNetworkd => {
                let out = self
                    .host
                    .run("list links", &NETWORKCTL_LIST.render(&[]))
                    .await?;
                parse_networkctl(&out.stdout)
            }
            NetworkStack::Ifcfg => {
                let mut parsed = Parsed::default();
                for (file, content) in
                    read_config_dir(IFCFG_DIR, |n| n.starts_with("ifcfg-") && n != "ifcfg-lo").await?
                {
                    parsed.push(parse_ifcfg(&file, &content));
                }
                parsed
            }
            NetworkStack::Interfaces => {
                let content = tokio::fs::read_to_string(INTERFACES_FILE)
                    .await
                    .map_err(Error::io(INTERFACES_FILE))?;
                parse_interfaces(&content)
            }
            NetworkStack::Unknown => return Err(Error::unsupported_backend("network stack", stack)),
        };
        Ok(parsed.into_records(stack.as_str()))
    }

    pub async fn scan(&self, target: &str, ports: &[u16], opts: ScanOptions) -> Vec<PortProbe> {
        scan_ports(target, ports, opts).await
    }
}

async fn read_config_dir(dir: &str, keep: impl Fn(&str) -> bool) -> Result<Vec<(String, String)>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(Error::io(dir))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(Error::io(dir))? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !keep(&name) {
            continue;
        }
        match tokio::fs::read_to_string(entry.path()).await {
            Ok(content) => files.push((name, content)),
            Err(err) => debug!(file = %entry.path().display(), error = %err, "unreadable network config"),
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    operstate: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    mtu: Option<u32>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    local: String,
    #[serde(default)]
    prefixlen: Option<u8>,
}

/// `ip -j addr show`. Entries missing `ifname` are skipped.
pub fn parse_ip_addr(raw: &str) -> Result<Parsed<Interface>> {
    let entries: Vec<serde_json::Value> =
        serde_json::from_str(raw).map_err(|err| Error::Parse {
            tool: "ip",
            reason: err.to_string(),
        })?;
    let mut parsed = Parsed::default();
    for entry in entries {
        let Ok(link) = serde_json::from_value::<IpLink>(entry) else {
            parsed.skip();
            continue;
        };
        parsed.push(Interface {
            name: link.ifname,
            state: link.operstate,
            mac: link.address,
            mtu: link.mtu,
            addresses: link
                .addr_info
                .into_iter()
                .filter(|a| !a.local.is_empty())
                .map(|a| match a.prefixlen {
                    Some(len) => format!("{}/{len}", a.local),
                    None => a.local,
                })
                .collect(),
        });
    }
    Ok(parsed)
}

/// `ss -tulnH`: `netid state recv-q send-q local peer`.
pub fn parse_ss_listening(raw: &str) -> Parsed<ListeningSocket> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 {
            parsed.skip();
            continue;
        }
        let Some((address, port)) = tokens[4].rsplit_once(':') else {
            parsed.skip();
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            parsed.skip();
            continue;
        };
        parsed.push(ListeningSocket {
            protocol: tokens[0].to_string(),
            state: tokens[1].to_string(),
            address: address.to_string(),
            port,
        });
    }
    parsed
}

/// `nmcli -t -f NAME,TYPE,DEVICE connection show`; `\:` escapes a colon.
pub fn parse_nmcli_connections(raw: &str) -> Parsed<NetConnection> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let fields = split_terse(line);
        if fields.len() != 3 || fields[0].is_empty() {
            parsed.skip();
            continue;
        }
        let state = if fields[2].is_empty() { "inactive" } else { "active" };
        parsed.push(NetConnection {
            name: fields[0].clone(),
            kind: fields[1].clone(),
            device: fields[2].clone(),
            state: state.to_string(),
        });
    }
    parsed
}

fn split_terse(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let (Some(next), Some(field)) = (chars.next(), fields.last_mut()) {
                    field.push(next);
                }
            }
            ':' => fields.push(String::new()),
            other => {
                if let Some(field) = fields.last_mut() {
                    field.push(other);
                }
            }
        }
    }
    fields
}

/// `networkctl list --no-legend`: `idx link type operational setup`.
pub fn parse_networkctl(raw: &str) -> Parsed<NetConnection> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 || tokens[0].parse::<u32>().is_err() {
            parsed.skip();
            continue;
        }
        parsed.push(NetConnection {
            name: tokens[1].to_string(),
            kind: tokens[2].to_string(),
            device: tokens[1].to_string(),
            state: format!("{}/{}", tokens[3], tokens[4]),
        });
    }
    parsed
}

const NETPLAN_SECTIONS: &[&str] = &["ethernets", "wifis", "bonds", "bridges", "vlans"];

/// One netplan YAML file; every device under a known section is one
/// connection named after the file.
pub fn parse_netplan(file: &str, content: &str) -> Parsed<NetConnection> {
    let mut parsed = Parsed::default();
    let doc: serde_yaml::Value = match serde_yaml::from_str(content) {
        Ok(doc) => doc,
        Err(err) => {
            debug!(file, error = %err, "invalid netplan yaml");
            parsed.skip();
            return parsed;
        }
    };
    let name = Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file.to_string());
    let Some(network) = doc.get("network") else {
        parsed.skip();
        return parsed;
    };
    for section in NETPLAN_SECTIONS {
        let Some(devices) = network.get(*section).and_then(|d| d.as_mapping()) else {
            continue;
        };
        for device in devices.keys().filter_map(|k| k.as_str()) {
            parsed.push(NetConnection {
                name: name.clone(),
                kind: section.trim_end_matches('s').to_string(),
                device: device.to_string(),
                state: "configured".to_string(),
            });
        }
    }
    parsed
}

/// One `ifcfg-<name>` file of `KEY=value` lines.
pub fn parse_ifcfg(file: &str, content: &str) -> NetConnection {
    let suffix = file.trim_start_matches("ifcfg-");
    let value = |key: &str| {
        content
            .lines()
            .filter_map(|l| l.trim().split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.trim().trim_matches('"').to_string())
    };
    let onboot = value("ONBOOT").is_some_and(|v| v.eq_ignore_ascii_case("yes"));
    NetConnection {
        name: value("NAME").unwrap_or_else(|| suffix.to_string()),
        kind: value("TYPE").unwrap_or_else(|| "Ethernet".to_string()),
        device: value("DEVICE").unwrap_or_else(|| suffix.to_string()),
        state: if onboot { "onboot" } else { "manual" }.to_string(),
    }
}

/// Debian `/etc/network/interfaces` stanzas.
pub fn parse_interfaces(content: &str) -> Parsed<NetConnection> {
    let mut parsed = Parsed::default();
    let mut auto: Vec<String> = Vec::new();
    let mut stanzas: Vec<(String, String)> = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("auto") | Some("allow-hotplug") => auto.extend(tokens.map(str::to_string)),
            Some("iface") => match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(dev), Some(family), Some(method)) => {
                    stanzas.push((dev.to_string(), format!("{family} {method}")));
                }
                _ => parsed.skip(),
            },
            _ => {}
        }
    }
    for (device, kind) in stanzas {
        let state = if auto.contains(&device) { "auto" } else { "manual" };
        parsed.push(NetConnection {
            name: device.clone(),
            kind,
            device,
            state: state.to_string(),
        });
    }
    parsed
}
