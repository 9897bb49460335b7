//! Host profile: which concrete tools drive this machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

mod detect;

pub use detect::{
    parse_os_release, Detector, Probe, CONTAINER_RUNTIME_PROBES, ENVIRONMENT_PROBES,
    FIREWALL_PROBES, INIT_SYSTEM_PROBES, NETWORK_STACK_PROBES, PACKAGE_MANAGER_PROBES,
};

macro_rules! backend_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "unknown {}: {s}",
                            stringify!($name)
                        ))
                    })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

backend_enum! {
    InitSystem {
        Systemd => "systemd",
        Sysvinit => "sysvinit",
        Openrc => "openrc",
        Runit => "runit",
        #[default]
        Unknown => "unknown",
    }
}

backend_enum! {
    PackageManager {
        Apt => "apt",
        Dnf => "dnf",
        Yum => "yum",
        Pacman => "pacman",
        Zypper => "zypper",
        Apk => "apk",
        #[default]
        Unknown => "unknown",
    }
}

backend_enum! {
    FirewallBackend {
        Ufw => "ufw",
        Firewalld => "firewalld",
        Nftables => "nftables",
        Iptables => "iptables",
        #[default]
        Unknown => "unknown",
    }
}

backend_enum! {
    NetworkStack {
        Netplan => "netplan",
        NetworkManager => "NetworkManager",
        SystemdNetworkd => "systemd-networkd",
        Ifcfg => "ifcfg",
        Interfaces => "interfaces",
        #[default]
        Unknown => "unknown",
    }
}

backend_enum! {
    ContainerRuntime {
        Docker => "docker",
        Podman => "podman",
        #[default]
        Unknown => "unknown",
    }
}

/// Where this process runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    Wsl,
    Docker,
    Kubernetes,
    Vm(String),
    #[default]
    BareMetal,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Wsl => f.write_str("WSL"),
            Environment::Docker => f.write_str("Docker"),
            Environment::Kubernetes => f.write_str("Kubernetes"),
            Environment::Vm(kind) => write!(f, "VM({kind})"),
            Environment::BareMetal => f.write_str("BareMetal"),
        }
    }
}

/// Snapshot of detected host characteristics. Built once per run and only
/// ever read afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProfile {
    pub distro: String,
    pub version: String,
    pub kernel: String,
    pub init_system: InitSystem,
    pub package_manager: PackageManager,
    pub firewall: FirewallBackend,
    pub network_stack: NetworkStack,
    pub environment: Environment,
    pub container_runtime: ContainerRuntime,
}

/// Backend choices forced by configuration. `None` keeps the detected value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileOverrides {
    pub init_system: Option<InitSystem>,
    pub package_manager: Option<PackageManager>,
    pub firewall: Option<FirewallBackend>,
}

impl SystemProfile {
    /// Returns a new profile with forced backends applied.
    pub fn with_overrides(&self, overrides: &ProfileOverrides) -> SystemProfile {
        SystemProfile {
            init_system: overrides.init_system.unwrap_or(self.init_system),
            package_manager: overrides.package_manager.unwrap_or(self.package_manager),
            firewall: overrides.firewall.unwrap_or(self.firewall),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_case_insensitively() {
        assert_eq!("NetworkManager".parse::<NetworkStack>().unwrap(), NetworkStack::NetworkManager);
        assert_eq!("networkmanager".parse::<NetworkStack>().unwrap(), NetworkStack::NetworkManager);
        assert_eq!("systemd-networkd".parse::<NetworkStack>().unwrap(), NetworkStack::SystemdNetworkd);
        assert!("brew".parse::<PackageManager>().is_err());
    }

    #[test]
    fn profile_serializes_backend_names() {
        let profile = SystemProfile {
            distro: "ubuntu".into(),
            package_manager: PackageManager::Apt,
            environment: Environment::Vm("kvm".into()),
            ..SystemProfile::default()
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["package_manager"], "apt");
        assert_eq!(json["init_system"], "unknown");
        assert_eq!(json["environment"]["vm"], "kvm");
    }

    #[test]
    fn overrides_produce_new_profile() {
        let detected = SystemProfile {
            package_manager: PackageManager::Apt,
            firewall: FirewallBackend::Iptables,
            ..SystemProfile::default()
        };
        let forced = detected.with_overrides(&ProfileOverrides {
            firewall: Some(FirewallBackend::Nftables),
            ..ProfileOverrides::default()
        });
        assert_eq!(forced.firewall, FirewallBackend::Nftables);
        assert_eq!(forced.package_manager, PackageManager::Apt);
        assert_eq!(detected.firewall, FirewallBackend::Iptables);
    }
}
