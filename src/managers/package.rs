use serde::Serialize;
use tracing::info;

use super::Host;
use crate::dispatch::{validate_name, CommandTemplate, ParseFn, Parsed};
use crate::error::{Error, Result};
use crate::exec::CommandResult;
use crate::profile::PackageManager;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub repository: String,
    pub description: String,
    pub installed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageOp {
    Install,
    Remove,
    Search,
    Update,
    Upgrade,
    ListInstalled,
}

const DPKG_LIST: CommandTemplate =
    CommandTemplate::new("dpkg-query", &["-W", r"-f=${Package}\t${Version}\n"]);
const RPM_LIST: CommandTemplate =
    CommandTemplate::new("rpm", &["-qa", "--qf", r"%{NAME}\t%{VERSION}-%{RELEASE}\n"]);

pub fn template(pm: PackageManager, op: PackageOp) -> Result<CommandTemplate> {
    use PackageManager::*;
    use PackageOp::*;

    let t = match (pm, op) {
        (Apt, Install) => CommandTemplate::new("apt", &["install", "-y", "{name}"]),
        (Apt, Remove) => CommandTemplate::new("apt", &["remove", "-y", "{name}"]),
        (Apt, Search) => CommandTemplate::new("apt", &["search", "{name}"]),
        (Apt, Update) => CommandTemplate::new("apt", &["update"]),
        (Apt, Upgrade) => CommandTemplate::new("apt", &["upgrade", "-y"]),
        (Apt, ListInstalled) => DPKG_LIST,

        // dnf and yum exit 1 when a search finds nothing
        (Dnf, Install) => CommandTemplate::new("dnf", &["install", "-y", "{name}"]),
        (Dnf, Remove) => CommandTemplate::new("dnf", &["remove", "-y", "{name}"]),
        (Dnf, Search) => CommandTemplate::new("dnf", &["search", "-q", "{name}"]).tolerating(&[1]),
        (Dnf, Update) => CommandTemplate::new("dnf", &["makecache"]),
        (Dnf, Upgrade) => CommandTemplate::new("dnf", &["upgrade", "-y"]),
        (Dnf, ListInstalled) => RPM_LIST,

        (Yum, Install) => CommandTemplate::new("yum", &["install", "-y", "{name}"]),
        (Yum, Remove) => CommandTemplate::new("yum", &["remove", "-y", "{name}"]),
        (Yum, Search) => CommandTemplate::new("yum", &["search", "-q", "{name}"]).tolerating(&[1]),
        (Yum, Update) => CommandTemplate::new("yum", &["makecache"]),
        (Yum, Upgrade) => CommandTemplate::new("yum", &["update", "-y"]),
        (Yum, ListInstalled) => RPM_LIST,

        (Pacman, Install) => CommandTemplate::new("pacman", &["-S", "--noconfirm", "{name}"]),
        (Pacman, Remove) => CommandTemplate::new("pacman", &["-R", "--noconfirm", "{name}"]),
        (Pacman, Search) => CommandTemplate::new("pacman", &["-Ss", "{name}"]).tolerating(&[1]),
        (Pacman, Update) => CommandTemplate::new("pacman", &["-Sy"]),
        (Pacman, Upgrade) => CommandTemplate::new("pacman", &["-Syu", "--noconfirm"]),
        (Pacman, ListInstalled) => CommandTemplate::new("pacman", &["-Q"]),

        (Zypper, Install) => {
            CommandTemplate::new("zypper", &["--non-interactive", "install", "{name}"])
        }
        (Zypper, Remove) => {
            CommandTemplate::new("zypper", &["--non-interactive", "remove", "{name}"])
        }
        // 104: no matching packages
        (Zypper, Search) => {
            CommandTemplate::new("zypper", &["--non-interactive", "search", "{name}"])
                .tolerating(&[104])
        }
        (Zypper, Update) => CommandTemplate::new("zypper", &["--non-interactive", "refresh"]),
        (Zypper, Upgrade) => CommandTemplate::new("zypper", &["--non-interactive", "update"]),
        (Zypper, ListInstalled) => RPM_LIST,

        (Apk, Install) => CommandTemplate::new("apk", &["add", "{name}"]),
        (Apk, Remove) => CommandTemplate::new("apk", &["del", "{name}"]),
        (Apk, Search) => CommandTemplate::new("apk", &["search", "-v", "{name}"]),
        (Apk, Update) => CommandTemplate::new("apk", &["update"]),
        (Apk, Upgrade) => CommandTemplate::new("apk", &["upgrade"]),
        (Apk, ListInstalled) => CommandTemplate::new("apk", &["info", "-v"]),

        (Unknown, _) => return Err(Error::unsupported_backend("package manager", pm)),
    };
    Ok(t)
}

pub fn search_parser(pm: PackageManager) -> Result<ParseFn<PackageInfo>> {
    use PackageManager::*;
    match pm {
        Apt => Ok(parse_apt_search),
        Dnf | Yum => Ok(parse_dnf_search),
        Pacman => Ok(parse_pacman_search),
        Zypper => Ok(parse_zypper_search),
        Apk => Ok(parse_apk_list),
        Unknown => Err(Error::unsupported_backend("package manager", pm)),
    }
}

pub fn installed_parser(pm: PackageManager) -> Result<ParseFn<PackageInfo>> {
    use PackageManager::*;
    match pm {
        Apt | Dnf | Yum | Pacman | Zypper => Ok(parse_name_version),
        Apk => Ok(parse_apk_list),
        Unknown => Err(Error::unsupported_backend("package manager", pm)),
    }
}

/// Package operations against whichever package manager the profile names.
pub struct Packages {
    host: Host,
}

impl Packages {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    fn backend(&self) -> PackageManager {
        self.host.profile().package_manager
    }

    pub async fn install(&self, name: &str) -> Result<CommandResult> {
        self.mutate(PackageOp::Install, "install", name).await
    }

    pub async fn remove(&self, name: &str) -> Result<CommandResult> {
        self.mutate(PackageOp::Remove, "remove", name).await
    }

    /// Refreshes the package index.
    pub async fn update(&self) -> Result<CommandResult> {
        let inv = template(self.backend(), PackageOp::Update)?.render(&[]);
        info!(backend = %self.backend(), "refreshing package index");
        self.host.run("update package index", &inv).await
    }

    pub async fn upgrade(&self) -> Result<CommandResult> {
        let inv = template(self.backend(), PackageOp::Upgrade)?.render(&[]);
        info!(backend = %self.backend(), "upgrading packages");
        self.host.run("upgrade packages", &inv).await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<PackageInfo>> {
        validate_name("search", query)?;
        let pm = self.backend();
        let inv = template(pm, PackageOp::Search)?.render(&[("name", query)]);
        let parse = search_parser(pm)?;
        let out = self.host.run(&format!("search {query}"), &inv).await?;
        Ok(parse(&out.stdout).into_records(pm.as_str()))
    }

    pub async fn list_installed(&self) -> Result<Vec<PackageInfo>> {
        let pm = self.backend();
        let inv = template(pm, PackageOp::ListInstalled)?.render(&[]);
        let parse = installed_parser(pm)?;
        let out = self.host.run("list installed packages", &inv).await?;
        let mut records = parse(&out.stdout).into_records(&inv.program);
        for r in &mut records {
            r.installed = true;
        }
        Ok(records)
    }

    async fn mutate(&self, op: PackageOp, verb: &str, name: &str) -> Result<CommandResult> {
        validate_name("package", name)?;
        let inv = template(self.backend(), op)?.render(&[("name", name)]);
        info!(backend = %self.backend(), package = name, "{verb} package");
        self.host.run(&format!("{verb} {name}"), &inv).await
    }
}

/// `apt search`: `name/suite version arch [installed]` followed by an
/// indented description line.
pub fn parse_apt_search(raw: &str) -> Parsed<PackageInfo> {
    parse_slash_listing(raw, false)
}

/// `pacman -Ss`: `repo/name version [installed]` followed by an indented
/// description line.
pub fn parse_pacman_search(raw: &str) -> Parsed<PackageInfo> {
    parse_slash_listing(raw, true)
}

fn parse_slash_listing(raw: &str, repo_first: bool) -> Parsed<PackageInfo> {
    let mut parsed: Parsed<PackageInfo> = Parsed::default();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            match parsed.records.last_mut() {
                Some(last) if last.description.is_empty() => {
                    last.description = line.trim().to_string();
                }
                _ => parsed.skip(),
            }
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some((left, right)) = tokens.next().and_then(|t| t.split_once('/')) else {
            parsed.skip();
            continue;
        };
        if left.is_empty() || right.is_empty() {
            parsed.skip();
            continue;
        }
        let (name, repository) = if repo_first { (right, left) } else { (left, right) };
        parsed.push(PackageInfo {
            name: name.to_string(),
            repository: repository.to_string(),
            version: tokens.next().unwrap_or_default().to_string(),
            installed: line.contains("[installed"),
            description: String::new(),
        });
    }
    parsed
}

/// `dnf search` / `yum search`: `name.arch : summary`, with `===` section
/// headers and `:`-led continuation lines.
pub fn parse_dnf_search(raw: &str) -> Parsed<PackageInfo> {
    let mut parsed: Parsed<PackageInfo> = Parsed::default();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((left, right)) = trimmed.split_once(':') else {
            parsed.skip();
            continue;
        };
        let left = left.trim();
        if left.is_empty() {
            match parsed.records.last_mut() {
                Some(last) => {
                    last.description.push(' ');
                    last.description.push_str(right.trim());
                }
                None => parsed.skip(),
            }
            continue;
        }
        if left.starts_with('=') || left.contains(' ') {
            parsed.skip();
            continue;
        }
        let name = match left.rsplit_once('.') {
            Some((name, _arch)) if !name.is_empty() => name,
            _ => left,
        };
        parsed.push(PackageInfo {
            name: name.to_string(),
            description: right.trim().to_string(),
            ..PackageInfo::default()
        });
    }
    parsed
}

/// `zypper search`: a `|`-separated table with `S | Name | Summary | Type`.
pub fn parse_zypper_search(raw: &str) -> Parsed<PackageInfo> {
    let mut parsed = Parsed::default();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('|').map(str::trim).collect();
        if cols.len() < 3 || cols[1].is_empty() || cols[1] == "Name" || cols[1].starts_with('-') {
            parsed.skip();
            continue;
        }
        parsed.push(PackageInfo {
            name: cols[1].to_string(),
            description: cols[2].to_string(),
            installed: cols[0].starts_with('i'),
            ..PackageInfo::default()
        });
    }
    parsed
}

/// `apk search -v` and `apk info -v`: `name-version-rN [- description]`.
pub fn parse_apk_list(raw: &str) -> Parsed<PackageInfo> {
    let mut parsed = Parsed::default();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (pkgver, description) = match line.split_once(" - ") {
            Some((p, d)) => (p.trim(), d.trim()),
            None => (line, ""),
        };
        match split_apk_pkgver(pkgver) {
            Some((name, version)) => parsed.push(PackageInfo {
                name: name.to_string(),
                version: version.to_string(),
                description: description.to_string(),
                ..PackageInfo::default()
            }),
            None => parsed.skip(),
        }
    }
    parsed
}

fn split_apk_pkgver(pkgver: &str) -> Option<(&str, &str)> {
    if pkgver.contains(char::is_whitespace) {
        return None;
    }
    let mut parts = pkgver.rsplitn(3, '-');
    let release = parts.next()?;
    let version = parts.next()?;
    let name = parts.next()?;
    let release_ok = release.len() > 1
        && release.starts_with('r')
        && release[1..].chars().all(|c| c.is_ascii_digit());
    let version_ok = version.starts_with(|c: char| c.is_ascii_digit());
    if !release_ok || !version_ok || name.is_empty() {
        return None;
    }
    let version_start = name.len() + 1;
    Some((name, &pkgver[version_start..]))
}

/// Two whitespace-separated columns: name, then version.
pub fn parse_name_version(raw: &str) -> Parsed<PackageInfo> {
    let mut parsed = Parsed::default();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some(name), Some(version)) => parsed.push(PackageInfo {
                name: name.to_string(),
                version: version.to_string(),
                ..PackageInfo::default()
            }),
            _ => parsed.skip(),
        }
    }
    parsed
}
