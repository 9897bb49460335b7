use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    ContainerRuntime, Environment, FirewallBackend, InitSystem, NetworkStack, PackageManager,
    SystemProfile,
};
use crate::exec::Executor;

/// One read-only check against the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Executable present on the search path.
    Tool(&'static str),
    /// Tool present and one line of its stdout equals `expect`.
    Reports {
        program: &'static str,
        args: &'static [&'static str],
        expect: &'static str,
    },
    Dir(&'static str),
    File(&'static str),
    Exists(&'static str),
    /// File contents contain `needle`, case-insensitively.
    Contains {
        path: &'static str,
        needle: &'static str,
    },
    /// Symlink target contains `needle`.
    LinkContains {
        path: &'static str,
        needle: &'static str,
    },
    /// Symlink can be resolved at all.
    Link(&'static str),
}

// Probe tables are evaluated top to bottom; the first positive probe wins.

pub const INIT_SYSTEM_PROBES: &[(Probe, InitSystem)] = &[
    (
        Probe::LinkContains {
            path: "/proc/1/exe",
            needle: "systemd",
        },
        InitSystem::Systemd,
    ),
    (Probe::Dir("/run/openrc"), InitSystem::Openrc),
    (Probe::Dir("/etc/runlevels"), InitSystem::Openrc),
    (
        Probe::LinkContains {
            path: "/proc/1/exe",
            needle: "runit",
        },
        InitSystem::Runit,
    ),
    (Probe::Dir("/etc/runit"), InitSystem::Runit),
    (Probe::Dir("/run/runit"), InitSystem::Runit),
    (Probe::Link("/proc/1/exe"), InitSystem::Sysvinit),
];

pub const PACKAGE_MANAGER_PROBES: &[(Probe, PackageManager)] = &[
    (Probe::Tool("apt"), PackageManager::Apt),
    (Probe::Tool("dnf"), PackageManager::Dnf),
    (Probe::Tool("yum"), PackageManager::Yum),
    (Probe::Tool("pacman"), PackageManager::Pacman),
    (Probe::Tool("zypper"), PackageManager::Zypper),
    (Probe::Tool("apk"), PackageManager::Apk),
];

// ufw and firewalld must be active, not merely installed, so an idle
// frontend never hides the tool that actually owns the rules.
pub const FIREWALL_PROBES: &[(Probe, FirewallBackend)] = &[
    (
        Probe::Reports {
            program: "ufw",
            args: &["status"],
            expect: "Status: active",
        },
        FirewallBackend::Ufw,
    ),
    (
        Probe::Reports {
            program: "firewall-cmd",
            args: &["--state"],
            expect: "running",
        },
        FirewallBackend::Firewalld,
    ),
    (Probe::Tool("nft"), FirewallBackend::Nftables),
    (Probe::Tool("iptables"), FirewallBackend::Iptables),
];

pub const NETWORK_STACK_PROBES: &[(Probe, NetworkStack)] = &[
    (Probe::Dir("/etc/netplan"), NetworkStack::Netplan),
    (Probe::Tool("nmcli"), NetworkStack::NetworkManager),
    (Probe::Dir("/etc/sysconfig/network-scripts"), NetworkStack::Ifcfg),
    (Probe::File("/etc/network/interfaces"), NetworkStack::Interfaces),
    (Probe::Tool("networkctl"), NetworkStack::SystemdNetworkd),
];

// Kubernetes pods also carry container markers, so kubepods is checked
// before the generic Docker marker.
pub const ENVIRONMENT_PROBES: &[(Probe, Environment)] = &[
    (
        Probe::Contains {
            path: "/proc/version",
            needle: "microsoft",
        },
        Environment::Wsl,
    ),
    (
        Probe::Contains {
            path: "/proc/1/cgroup",
            needle: "kubepods",
        },
        Environment::Kubernetes,
    ),
    (Probe::Exists("/.dockerenv"), Environment::Docker),
];

pub const CONTAINER_RUNTIME_PROBES: &[(Probe, ContainerRuntime)] = &[
    (Probe::Tool("docker"), ContainerRuntime::Docker),
    (Probe::Tool("podman"), ContainerRuntime::Podman),
];

/// Runs the probe battery and builds a [`SystemProfile`].
///
/// Every probe is read-only. A probe that errors or runs past the shared
/// deadline counts as negative; detection itself never fails.
pub struct Detector {
    exec: Arc<dyn Executor>,
    root: PathBuf,
    search_path: Option<OsString>,
    timeout: Duration,
}

impl Detector {
    pub fn new(exec: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self {
            exec,
            root: PathBuf::from("/"),
            search_path: std::env::var_os("PATH"),
            timeout,
        }
    }

    /// Resolve host paths below `root` instead of `/`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_search_path(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_path = std::env::join_paths(dirs).ok();
        self
    }

    pub async fn detect(&self) -> SystemProfile {
        let deadline = Instant::now() + self.timeout;

        let (distro, version) = match fs::read_to_string(self.host_path("/etc/os-release")).await {
            Ok(content) => parse_os_release(&content),
            Err(err) => {
                debug!(error = %err, "os-release unavailable");
                (String::new(), String::new())
            }
        };
        let kernel = fs::read_to_string(self.host_path("/proc/sys/kernel/osrelease"))
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let profile = SystemProfile {
            distro,
            version,
            kernel,
            init_system: self
                .first_match(INIT_SYSTEM_PROBES, deadline)
                .await
                .unwrap_or_default(),
            package_manager: self
                .first_match(PACKAGE_MANAGER_PROBES, deadline)
                .await
                .unwrap_or_default(),
            firewall: self
                .first_match(FIREWALL_PROBES, deadline)
                .await
                .unwrap_or_default(),
            network_stack: self
                .first_match(NETWORK_STACK_PROBES, deadline)
                .await
                .unwrap_or_default(),
            environment: self.environment(deadline).await,
            container_runtime: self
                .first_match(CONTAINER_RUNTIME_PROBES, deadline)
                .await
                .unwrap_or_default(),
        };

        info!(
            distro = %profile.distro,
            version = %profile.version,
            init = %profile.init_system,
            packages = %profile.package_manager,
            firewall = %profile.firewall,
            network = %profile.network_stack,
            environment = %profile.environment,
            "host profile detected"
        );
        profile
    }

    async fn environment(&self, deadline: Instant) -> Environment {
        if let Some(env) = self.first_match(ENVIRONMENT_PROBES, deadline).await {
            return env;
        }
        if self.on_path("systemd-detect-virt") {
            let args = vec!["--vm".to_string()];
            // exits non-zero and prints "none" on bare metal
            match self.exec.exec(deadline, "systemd-detect-virt", &args).await {
                Ok(out) if !out.stdout.is_empty() && out.stdout != "none" => {
                    return Environment::Vm(out.stdout);
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "systemd-detect-virt gave no answer"),
            }
        }
        Environment::BareMetal
    }

    async fn first_match<T: Clone>(&self, probes: &[(Probe, T)], deadline: Instant) -> Option<T> {
        for (probe, value) in probes {
            if self.probe(probe, deadline).await {
                debug!(?probe, "probe matched");
                return Some(value.clone());
            }
        }
        None
    }

    pub async fn probe(&self, probe: &Probe, deadline: Instant) -> bool {
        match *probe {
            Probe::Tool(name) => self.on_path(name),
            Probe::Reports {
                program,
                args,
                expect,
            } => {
                if !self.on_path(program) {
                    return false;
                }
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                match self.exec.exec(deadline, program, &args).await {
                    Ok(out) => out.stdout.lines().any(|l| l.trim() == expect),
                    Err(err) => {
                        debug!(program, error = %err, "state probe failed");
                        false
                    }
                }
            }
            Probe::Dir(path) => fs::metadata(self.host_path(path))
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            Probe::File(path) => fs::metadata(self.host_path(path))
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Probe::Exists(path) => fs::metadata(self.host_path(path)).await.is_ok(),
            Probe::Contains { path, needle } => fs::read_to_string(self.host_path(path))
                .await
                .map(|c| c.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
            Probe::LinkContains { path, needle } => fs::read_link(self.host_path(path))
                .await
                .map(|target| target.to_string_lossy().contains(needle))
                .unwrap_or(false),
            Probe::Link(path) => fs::read_link(self.host_path(path)).await.is_ok(),
        }
    }

    fn on_path(&self, tool: &str) -> bool {
        self.search_path
            .as_ref()
            .is_some_and(|paths| which::which_in(tool, Some(paths), &self.root).is_ok())
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

/// Extracts `ID` and `VERSION_ID` from os-release content. Values may be quoted.
pub fn parse_os_release(content: &str) -> (String, String) {
    let field = |name: &str| {
        content
            .lines()
            .filter_map(|line| line.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.trim().trim_matches('"').trim_matches('\'').to_string())
            .unwrap_or_default()
    };
    (field("ID"), field("VERSION_ID"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;
    use crate::exec::fake::FakeExecutor;

    struct Host {
        root: TempDir,
        bin: TempDir,
    }

    impl Host {
        fn new() -> Self {
            Self {
                root: TempDir::new().unwrap(),
                bin: TempDir::new().unwrap(),
            }
        }

        fn tool(&self, name: &str) -> &Self {
            let path = self.bin.path().join(name);
            fs::write(&path, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            self
        }

        fn file(&self, rel: &str, content: &str) -> &Self {
            let path = self.root.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
            self
        }

        fn dir(&self, rel: &str) -> &Self {
            fs::create_dir_all(self.root.path().join(rel)).unwrap();
            self
        }

        fn pid1(&self, target: &str) -> &Self {
            let dir = self.root.path().join("proc/1");
            fs::create_dir_all(&dir).unwrap();
            std::os::unix::fs::symlink(target, dir.join("exe")).unwrap();
            self
        }

        fn detector(&self, exec: FakeExecutor) -> Detector {
            Detector::new(Arc::new(exec), Duration::from_secs(5))
                .with_root(self.root.path())
                .with_search_path(vec![self.bin.path().to_path_buf()])
        }
    }

    #[test]
    fn os_release_handles_quotes_and_missing_keys() {
        let content = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\nID_LIKE=debian\n";
        assert_eq!(parse_os_release(content), ("ubuntu".into(), "22.04".into()));
        assert_eq!(parse_os_release("ID=arch\n"), ("arch".into(), String::new()));
    }

    #[tokio::test]
    async fn empty_host_yields_unknowns() {
        let host = Host::new();
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.distro, "");
        assert_eq!(profile.init_system, InitSystem::Unknown);
        assert_eq!(profile.package_manager, PackageManager::Unknown);
        assert_eq!(profile.firewall, FirewallBackend::Unknown);
        assert_eq!(profile.network_stack, NetworkStack::Unknown);
        assert_eq!(profile.environment, Environment::BareMetal);
        assert_eq!(profile.container_runtime, ContainerRuntime::Unknown);
    }

    #[tokio::test]
    async fn package_manager_follows_priority_not_alphabet() {
        let host = Host::new();
        host.tool("zypper").tool("dnf").tool("yum");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.package_manager, PackageManager::Dnf);

        let host = Host::new();
        host.tool("apk").tool("apt");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.package_manager, PackageManager::Apt);
    }

    #[tokio::test]
    async fn non_executable_file_is_not_a_tool() {
        let host = Host::new();
        fs::write(host.bin.path().join("apt"), "").unwrap();
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.package_manager, PackageManager::Unknown);
    }

    #[tokio::test]
    async fn inactive_ufw_does_not_mask_nftables() {
        let host = Host::new();
        host.tool("ufw").tool("nft");
        let exec = FakeExecutor::new().respond("ufw", "Status: inactive");
        let profile = host.detector(exec).detect().await;
        assert_eq!(profile.firewall, FirewallBackend::Nftables);
    }

    #[tokio::test]
    async fn slow_probe_fails_alone_under_the_shared_deadline() {
        let host = Host::new();
        host.pid1("/lib/systemd/systemd")
            .dir("etc/netplan")
            .tool("apt")
            .tool("ufw")
            .tool("nft")
            .tool("systemd-detect-virt");
        let exec = FakeExecutor::new()
            .stall("ufw", Duration::from_secs(30))
            .respond("systemd-detect-virt", "kvm");
        let started = std::time::Instant::now();
        let profile = Detector::new(Arc::new(exec), Duration::from_millis(200))
            .with_root(host.root.path())
            .with_search_path(vec![host.bin.path().to_path_buf()])
            .detect()
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(profile.firewall, FirewallBackend::Nftables);
        assert_eq!(profile.init_system, InitSystem::Systemd);
        assert_eq!(profile.package_manager, PackageManager::Apt);
        assert_eq!(profile.network_stack, NetworkStack::Netplan);
        // the deadline is already spent when the VM check runs
        assert_eq!(profile.environment, Environment::BareMetal);
    }

    #[tokio::test]
    async fn active_ufw_wins() {
        let host = Host::new();
        host.tool("ufw").tool("firewall-cmd").tool("iptables");
        let exec = FakeExecutor::new()
            .respond("ufw", "Status: active\n\nTo Action From")
            .respond("firewall-cmd", "running");
        let profile = host.detector(exec).detect().await;
        assert_eq!(profile.firewall, FirewallBackend::Ufw);
    }

    #[tokio::test]
    async fn firewalld_must_be_running() {
        let host = Host::new();
        host.tool("firewall-cmd").tool("iptables");
        let exec = FakeExecutor::new().fail("firewall-cmd", 252, "not running");
        let profile = host.detector(exec).detect().await;
        assert_eq!(profile.firewall, FirewallBackend::Iptables);
    }

    #[tokio::test]
    async fn init_system_classification() {
        let host = Host::new();
        host.pid1("/usr/lib/systemd/systemd").dir("run/openrc");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.init_system, InitSystem::Systemd);

        let host = Host::new();
        host.pid1("/sbin/init").dir("run/openrc");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.init_system, InitSystem::Openrc);

        let host = Host::new();
        host.pid1("/sbin/init").dir("etc/runit");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.init_system, InitSystem::Runit);

        let host = Host::new();
        host.pid1("/sbin/init");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.init_system, InitSystem::Sysvinit);
    }

    #[tokio::test]
    async fn network_stack_first_marker_wins() {
        let host = Host::new();
        host.file("etc/network/interfaces", "auto lo\n").tool("networkctl");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.network_stack, NetworkStack::Interfaces);

        host.dir("etc/netplan");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.network_stack, NetworkStack::Netplan);
    }

    #[tokio::test]
    async fn kubernetes_pod_is_not_reported_as_docker() {
        let host = Host::new();
        host.file(".dockerenv", "")
            .file("proc/1/cgroup", "0::/kubepods/besteffort/pod1234/abcd\n");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.environment, Environment::Kubernetes);

        let host = Host::new();
        host.file(".dockerenv", "").file("proc/1/cgroup", "0::/\n");
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.environment, Environment::Docker);
    }

    #[tokio::test]
    async fn wsl_and_vm_detection() {
        let host = Host::new();
        host.file(
            "proc/version",
            "Linux version 5.15.90.1-microsoft-standard-WSL2 (gcc version 11.2.0)",
        );
        let profile = host.detector(FakeExecutor::new()).detect().await;
        assert_eq!(profile.environment, Environment::Wsl);

        let host = Host::new();
        host.tool("systemd-detect-virt");
        let exec = FakeExecutor::new().respond("systemd-detect-virt", "kvm\n");
        let profile = host.detector(exec).detect().await;
        assert_eq!(profile.environment, Environment::Vm("kvm".into()));

        let host = Host::new();
        host.tool("systemd-detect-virt");
        let exec = FakeExecutor::new().script_with("systemd-detect-virt", "none", "", 1);
        let profile = host.detector(exec).detect().await;
        assert_eq!(profile.environment, Environment::BareMetal);
    }

    #[tokio::test]
    async fn detection_is_idempotent() {
        let host = Host::new();
        host.file("etc/os-release", "ID=debian\nVERSION_ID=\"12\"\n")
            .pid1("/lib/systemd/systemd")
            .tool("apt")
            .tool("iptables")
            .tool("docker");
        let exec = Arc::new(FakeExecutor::new());
        let detector = Detector::new(exec.clone(), Duration::from_secs(5))
            .with_root(host.root.path())
            .with_search_path(vec![host.bin.path().to_path_buf()]);
        let first = detector.detect().await;
        let second = detector.detect().await;
        assert_eq!(first, second);
        assert_eq!(first.distro, "debian");
        assert_eq!(first.version, "12");
        assert_eq!(first.container_runtime, ContainerRuntime::Docker);
        assert!(exec.calls().is_empty());
    }
}
