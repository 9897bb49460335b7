use clap::{Parser, Subcommand, ValueEnum};

use crate::managers::firewall::Protocol;
use crate::profile::FirewallBackend;

#[derive(Parser, Debug)]
#[command(
    name = "hostctl",
    version,
    about = "hostctl: one command set for packages, services, firewall and more on any Linux host"
)]
pub struct Cli {
    /// Path to config file (default: XDG config hostctl/config.toml)
    #[arg(long, global = true)]
    pub config: Option<std::path::PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Override firewall backend selection (default: config, then auto)
    #[arg(long, value_enum, global = true, default_value_t = BackendChoice::Auto)]
    pub firewall_backend: BackendChoice,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the detected host profile
    Profile,

    /// Package management
    Pkg {
        #[command(subcommand)]
        cmd: PkgCmd,
    },

    /// Service lifecycle
    Service {
        #[command(subcommand)]
        cmd: ServiceCmd,
    },

    /// Firewall rules
    Firewall {
        #[command(subcommand)]
        cmd: FirewallCmd,
    },

    /// Interfaces, sockets, connections and port probes
    Net {
        #[command(subcommand)]
        cmd: NetCmd,
    },

    /// Block devices, usage and mounts
    Disk {
        #[command(subcommand)]
        cmd: DiskCmd,
    },

    /// Processes
    Proc {
        #[command(subcommand)]
        cmd: ProcCmd,
    },

    /// Recent security events (SSH failures, sudo, journal)
    Audit {
        /// Only events from the last N minutes
        #[arg(long, default_value_t = 60)]
        minutes: u64,
    },

    /// Cron jobs and systemd timers
    Cron {
        #[command(subcommand)]
        cmd: CronCmd,
    },

    /// Docker / podman containers
    Container {
        #[command(subcommand)]
        cmd: ContainerCmd,
    },

    /// Local accounts
    User {
        #[command(subcommand)]
        cmd: UserCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum PkgCmd {
    Install { name: String },
    Remove { name: String },
    Search { query: String },
    /// Refresh package indexes
    Update,
    /// Upgrade all installed packages
    Upgrade,
    List,
}

#[derive(Subcommand, Debug)]
pub enum ServiceCmd {
    List,
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Enable { name: String },
    Disable { name: String },
    Status { name: String },
    Logs {
        name: String,
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum FirewallCmd {
    List,
    Allow {
        port: u16,
        #[arg(long, value_enum, default_value_t = ProtoArg::Tcp)]
        proto: ProtoArg,
    },
    Deny {
        port: u16,
        #[arg(long, value_enum, default_value_t = ProtoArg::Tcp)]
        proto: ProtoArg,
    },
    Enable,
    Disable,
}

#[derive(Subcommand, Debug)]
pub enum NetCmd {
    Interfaces,
    Listening,
    Connections,
    /// Probe TCP ports, e.g. `scan 10.0.0.5 22,80,8000-8010`
    Scan { host: String, ports: String },
}

#[derive(Subcommand, Debug)]
pub enum DiskCmd {
    Devices,
    Usage,
    Mounts,
}

#[derive(Subcommand, Debug)]
pub enum ProcCmd {
    List,
    Top {
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
    Kill {
        pid: u32,
        /// Signal name or number
        #[arg(short, long, default_value = "TERM")]
        signal: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CronCmd {
    List,
    Add { schedule: String, command: String },
    Remove { index: usize },
    Timers,
}

#[derive(Subcommand, Debug)]
pub enum ContainerCmd {
    List,
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Logs {
        name: String,
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum UserCmd {
    List,
    Groups,
    Add { name: String },
    Remove { name: String },
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum BackendChoice {
    Auto,
    Ufw,
    Firewalld,
    Nftables,
    Iptables,
}

impl BackendChoice {
    pub fn forced(self) -> Option<FirewallBackend> {
        match self {
            BackendChoice::Auto => None,
            BackendChoice::Ufw => Some(FirewallBackend::Ufw),
            BackendChoice::Firewalld => Some(FirewallBackend::Firewalld),
            BackendChoice::Nftables => Some(FirewallBackend::Nftables),
            BackendChoice::Iptables => Some(FirewallBackend::Iptables),
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum ProtoArg {
    Tcp,
    Udp,
}

impl From<ProtoArg> for Protocol {
    fn from(p: ProtoArg) -> Self {
        match p {
            ProtoArg::Tcp => Protocol::Tcp,
            ProtoArg::Udp => Protocol::Udp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["hostctl", "firewall", "allow", "443", "--json", "--proto", "udp"]).unwrap();
        assert!(cli.json);
        match cli.cmd {
            Command::Firewall {
                cmd: FirewallCmd::Allow { port, proto },
            } => {
                assert_eq!(port, 443);
                assert_eq!(Protocol::from(proto), Protocol::Udp);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn backend_override() {
        let cli = Cli::try_parse_from(["hostctl", "--firewall-backend", "nftables", "firewall", "list"]).unwrap();
        assert_eq!(cli.firewall_backend.forced(), Some(FirewallBackend::Nftables));
        assert!(Cli::try_parse_from(["hostctl", "firewall", "allow", "70000"]).is_err());
    }

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
