use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::info;

use super::Host;
use crate::dispatch::{CommandTemplate, Parsed};
use crate::error::{Error, Result};
use crate::exec::CommandResult;
use crate::profile::PackageManager;

static USERNAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}\$?$").unwrap());

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserAccount {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserOp {
    Add,
    Remove,
}

/// Alpine ships busybox `adduser`/`deluser` instead of shadow-utils.
pub fn template(pm: PackageManager, op: UserOp) -> Result<CommandTemplate> {
    use PackageManager::*;
    let t = match (pm, op) {
        (Apk, UserOp::Add) => CommandTemplate::new("adduser", &["-D", "{name}"]),
        (Apk, UserOp::Remove) => CommandTemplate::new("deluser", &["--remove-home", "{name}"]),
        (Apt | Dnf | Yum | Pacman | Zypper, UserOp::Add) => {
            CommandTemplate::new("useradd", &["-m", "{name}"])
        }
        (Apt | Dnf | Yum | Pacman | Zypper, UserOp::Remove) => {
            CommandTemplate::new("userdel", &["-r", "{name}"])
        }
        (Unknown, _) => return Err(Error::unsupported_backend("package manager", pm)),
    };
    Ok(t)
}

pub struct Users {
    host: Host,
    passwd: PathBuf,
    group: PathBuf,
}

impl Users {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            passwd: PathBuf::from("/etc/passwd"),
            group: PathBuf::from("/etc/group"),
        }
    }

    #[cfg(test)]
    fn with_files(mut self, passwd: PathBuf, group: PathBuf) -> Self {
        self.passwd = passwd;
        self.group = group;
        self
    }

    pub async fn list(&self) -> Result<Vec<UserAccount>> {
        let content = tokio::fs::read_to_string(&self.passwd)
            .await
            .map_err(Error::io(&self.passwd))?;
        Ok(parse_passwd(&content).into_records("passwd"))
    }

    pub async fn groups(&self) -> Result<Vec<GroupEntry>> {
        let content = tokio::fs::read_to_string(&self.group)
            .await
            .map_err(Error::io(&self.group))?;
        Ok(parse_group(&content).into_records("group"))
    }

    pub async fn add(&self, name: &str) -> Result<CommandResult> {
        self.change(UserOp::Add, name, "add user").await
    }

    pub async fn remove(&self, name: &str) -> Result<CommandResult> {
        self.change(UserOp::Remove, name, "remove user").await
    }

    async fn change(&self, op: UserOp, name: &str, operation: &str) -> Result<CommandResult> {
        validate_username(name)?;
        let inv = template(self.host.profile().package_manager, op)?.render(&[("name", name)]);
        info!(user = name, command = %inv, "{operation}");
        self.host.run(operation, &inv).await
    }
}

pub fn validate_username(name: &str) -> Result<()> {
    if USERNAME.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid user name: {name:?}")))
    }
}

/// `name:x:uid:gid:gecos:home:shell`
pub fn parse_passwd(content: &str) -> Parsed<UserAccount> {
    let mut parsed = Parsed::default();
    for line in content.lines().filter(|l| !l.trim().is_empty() && !l.starts_with('#')) {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 7 {
            parsed.skip();
            continue;
        }
        let (Ok(uid), Ok(gid)) = (fields[2].parse(), fields[3].parse()) else {
            parsed.skip();
            continue;
        };
        parsed.push(UserAccount {
            name: fields[0].to_string(),
            uid,
            gid,
            gecos: fields[4].to_string(),
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
        });
    }
    parsed
}

/// `name:x:gid:member,member`
pub fn parse_group(content: &str) -> Parsed<GroupEntry> {
    let mut parsed = Parsed::default();
    for line in content.lines().filter(|l| !l.trim().is_empty() && !l.starts_with('#')) {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 4 {
            parsed.skip();
            continue;
        }
        let Ok(gid) = fields[2].parse() else {
            parsed.skip();
            continue;
        };
        parsed.push(GroupEntry {
            name: fields[0].to_string(),
            gid,
            members: fields[3]
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect(),
        });
    }
    parsed
}
