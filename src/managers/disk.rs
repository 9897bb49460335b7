use serde::Serialize;
use serde_json::Value;

use super::Host;
use crate::dispatch::{CommandTemplate, Parsed};
use crate::error::{Error, Result};

const PROC_MOUNTS: &str = "/proc/mounts";

const LSBLK: CommandTemplate = CommandTemplate::new(
    "lsblk",
    &["-J", "-b", "-o", "NAME,TYPE,SIZE,FSTYPE,MOUNTPOINT,MODEL"],
);
const DF: CommandTemplate = CommandTemplate::new("df", &["-P", "-B1"]);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size_bytes: Option<u64>,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub model: Option<String>,
    /// Name of the enclosing device for partitions and holders.
    pub parent: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub filesystem: String,
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub use_percent: u8,
    pub mountpoint: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub options: Vec<String>,
}

pub struct Disks {
    host: Host,
}

impl Disks {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    pub async fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        let out = self.host.run("list block devices", &LSBLK.render(&[])).await?;
        Ok(parse_lsblk(&out.stdout)?.into_records("lsblk"))
    }

    pub async fn usage(&self) -> Result<Vec<DiskUsage>> {
        let out = self.host.run("report disk usage", &DF.render(&[])).await?;
        Ok(parse_df(&out.stdout).into_records("df"))
    }

    pub async fn mounts(&self) -> Result<Vec<Mount>> {
        let content = tokio::fs::read_to_string(PROC_MOUNTS)
            .await
            .map_err(Error::io(PROC_MOUNTS))?;
        Ok(parse_mounts(&content).into_records("mounts"))
    }
}

/// `lsblk -J -b`. Nested `children` are flattened depth first after their
/// parent. Sizes may be numbers or strings depending on the util-linux
/// version.
pub fn parse_lsblk(raw: &str) -> Result<Parsed<BlockDevice>> {
    let doc: Value = serde_json::from_str(raw).map_err(|err| Error::Parse {
        tool: "lsblk",
        reason: err.to_string(),
    })?;
    let devices = doc
        .get("blockdevices")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Parse {
            tool: "lsblk",
            reason: "missing blockdevices array".to_string(),
        })?;

    let mut parsed = Parsed::default();
    for device in devices {
        flatten(device, None, &mut parsed);
    }
    Ok(parsed)
}

fn flatten(node: &Value, parent: Option<&str>, parsed: &mut Parsed<BlockDevice>) {
    let Some(name) = node.get("name").and_then(Value::as_str) else {
        parsed.skip();
        return;
    };
    let text = |key: &str| {
        node.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let size_bytes = match node.get("size") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.push(BlockDevice {
        name: name.to_string(),
        kind: text("type").unwrap_or_default(),
        size_bytes,
        fstype: text("fstype"),
        mountpoint: text("mountpoint"),
        model: text("model"),
        parent: parent.map(str::to_string),
    });
    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            flatten(child, Some(name), parsed);
        }
    }
}

/// `df -P -B1`; the mount point may contain spaces.
pub fn parse_df(raw: &str) -> Parsed<DiskUsage> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        if line.starts_with("Filesystem") {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 6 {
            parsed.skip();
            continue;
        }
        let numbers = (
            tokens[1].parse::<u64>(),
            tokens[2].parse::<u64>(),
            tokens[3].parse::<u64>(),
            tokens[4].trim_end_matches('%').parse::<u8>(),
        );
        let (Ok(size), Ok(used), Ok(available), Ok(percent)) = numbers else {
            parsed.skip();
            continue;
        };
        parsed.push(DiskUsage {
            filesystem: tokens[0].to_string(),
            size_bytes: size,
            used_bytes: used,
            available_bytes: available,
            use_percent: percent,
            mountpoint: tokens[5..].join(" "),
        });
    }
    parsed
}

/// `/proc/mounts` with octal escapes (`\040` for space) decoded.
pub fn parse_mounts(content: &str) -> Parsed<Mount> {
    let mut parsed = Parsed::default();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            parsed.skip();
            continue;
        }
        parsed.push(Mount {
            device: unescape_octal(fields[0]),
            mountpoint: unescape_octal(fields[1]),
            fstype: fields[2].to_string(),
            options: fields[3].split(',').map(str::to_string).collect(),
        });
    }
    parsed
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or_default();
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
