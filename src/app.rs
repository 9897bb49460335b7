use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::{
    cli::{
        Cli, Command, ContainerCmd, CronCmd, DiskCmd, FirewallCmd, NetCmd, PkgCmd, ProcCmd,
        ServiceCmd, UserCmd,
    },
    config::{default_config_path, load_settings, Settings},
    exec::{CommandResult, Executor, SystemExecutor},
    managers::{audit::Audit, process::ProcessInfo, scan::parse_port_list, Host},
    profile::{Detector, SystemProfile},
};

pub async fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };
    let settings = load_settings(&config_path)?;

    let exec: Arc<dyn Executor> = Arc::new(SystemExecutor);
    let profile = build_profile(&cli, &settings, exec.clone()).await?;
    let host = Host::new(profile, exec, settings.command_timeout());

    dispatch(cli.cmd, cli.json, &host, &settings).await
}

async fn build_profile(cli: &Cli, settings: &Settings, exec: Arc<dyn Executor>) -> Result<SystemProfile> {
    let detected = Detector::new(exec, settings.detect_timeout()).detect().await;
    let mut overrides = settings.profile_overrides()?;
    if let Some(backend) = cli.firewall_backend.forced() {
        overrides.firewall = Some(backend);
    }
    Ok(detected.with_overrides(&overrides))
}

async fn dispatch(cmd: Command, json: bool, host: &Host, settings: &Settings) -> Result<()> {
    match cmd {
        Command::Profile => emit(json, host.profile(), print_profile),

        Command::Pkg { cmd } => {
            let pkgs = host.packages();
            match cmd {
                PkgCmd::Install { name } => done(json, pkgs.install(&name).await?),
                PkgCmd::Remove { name } => done(json, pkgs.remove(&name).await?),
                PkgCmd::Update => done(json, pkgs.update().await?),
                PkgCmd::Upgrade => done(json, pkgs.upgrade().await?),
                PkgCmd::Search { query } => emit(json, &pkgs.search(&query).await?, |found| {
                    for p in found {
                        println!("{:<32} {:<20} {}", p.name, p.version, p.description);
                    }
                }),
                PkgCmd::List => emit(json, &pkgs.list_installed().await?, |installed| {
                    for p in installed {
                        println!("{:<40} {}", p.name, p.version);
                    }
                }),
            }
        }

        Command::Service { cmd } => {
            let svc = host.services();
            match cmd {
                ServiceCmd::List => emit(json, &svc.list().await?, |units| {
                    for u in units {
                        println!("{:<40} {:<10} {:<10} {}", u.name, u.active, u.sub, u.description);
                    }
                }),
                ServiceCmd::Start { name } => done(json, svc.start(&name).await?),
                ServiceCmd::Stop { name } => done(json, svc.stop(&name).await?),
                ServiceCmd::Restart { name } => done(json, svc.restart(&name).await?),
                ServiceCmd::Enable { name } => done(json, svc.enable(&name).await?),
                ServiceCmd::Disable { name } => done(json, svc.disable(&name).await?),
                ServiceCmd::Status { name } => emit(json, &svc.status(&name).await?, |s| {
                    println!("{}: {}", s.name, s.state);
                }),
                ServiceCmd::Logs { name, lines } => emit(json, &svc.logs(&name, lines).await?, |lines| {
                    for line in lines {
                        println!("{line}");
                    }
                }),
            }
        }

        Command::Firewall { cmd } => {
            let fw = host.firewall();
            match cmd {
                FirewallCmd::List => emit(json, &fw.list_rules().await?, |rules| {
                    for r in rules {
                        println!(
                            "[{:>3}] {:<12} {:<8} {:<7} {}",
                            r.id, r.port, r.protocol, r.action, r.source
                        );
                    }
                }),
                FirewallCmd::Allow { port, proto } => {
                    fw.allow(port, proto.into()).await?;
                    ok(json)
                }
                FirewallCmd::Deny { port, proto } => {
                    fw.deny(port, proto.into()).await?;
                    ok(json)
                }
                FirewallCmd::Enable => {
                    fw.enable().await?;
                    ok(json)
                }
                FirewallCmd::Disable => {
                    fw.disable().await?;
                    ok(json)
                }
            }
        }

        Command::Net { cmd } => {
            let net = host.network();
            match cmd {
                NetCmd::Interfaces => emit(json, &net.interfaces().await?, |ifaces| {
                    for i in ifaces {
                        println!("{:<16} {:<8} {:<18} {}", i.name, i.state, i.mac, i.addresses.join(" "));
                    }
                }),
                NetCmd::Listening => emit(json, &net.listening().await?, |socks| {
                    for s in socks {
                        println!("{:<4} {:<8} {}:{}", s.protocol, s.state, s.address, s.port);
                    }
                }),
                NetCmd::Connections => emit(json, &net.connections().await?, |conns| {
                    for c in conns {
                        println!("{:<24} {:<16} {:<12} {}", c.name, c.kind, c.device, c.state);
                    }
                }),
                NetCmd::Scan { host: target, ports } => {
                    let ports = parse_port_list(&ports)?;
                    let probes = net.scan(&target, &ports, settings.scan_options()).await;
                    emit(json, &probes, |probes| {
                        for p in probes.iter().filter(|p| p.open) {
                            println!("{}/tcp open {}ms", p.port, p.latency_ms.unwrap_or_default());
                        }
                    })
                }
            }
        }

        Command::Disk { cmd } => {
            let disks = host.disks();
            match cmd {
                DiskCmd::Devices => emit(json, &disks.block_devices().await?, |devs| {
                    for d in devs {
                        println!(
                            "{:<16} {:<6} {:>16} {:<10} {}",
                            d.name,
                            d.kind,
                            d.size_bytes.map(|s| s.to_string()).unwrap_or_default(),
                            d.fstype.as_deref().unwrap_or("-"),
                            d.mountpoint.as_deref().unwrap_or("-")
                        );
                    }
                }),
                DiskCmd::Usage => emit(json, &disks.usage().await?, |usage| {
                    for u in usage {
                        println!("{:<24} {:>3}% {}", u.filesystem, u.use_percent, u.mountpoint);
                    }
                }),
                DiskCmd::Mounts => emit(json, &disks.mounts().await?, |mounts| {
                    for m in mounts {
                        println!("{} on {} type {} ({})", m.device, m.mountpoint, m.fstype, m.options.join(","));
                    }
                }),
            }
        }

        Command::Proc { cmd } => {
            let procs = host.processes();
            match cmd {
                ProcCmd::List => emit(json, procs.list().await?.as_slice(), print_processes),
                ProcCmd::Top { count } => emit(json, procs.top(count).await?.as_slice(), print_processes),
                ProcCmd::Kill { pid, signal } => {
                    let signal = signal.parse()?;
                    done(json, procs.kill(pid, signal).await?)
                }
            }
        }

        Command::Audit { minutes } => {
            let audit = Audit::new(host.clone(), settings.audit_settings());
            let events = audit
                .events(Duration::from_secs(minutes.saturating_mul(60)))
                .await
                .context("audit log correlation failed")?;
            emit(json, &events, |events| {
                for e in events {
                    println!(
                        "{} {:<8} {:<12} {}",
                        e.timestamp.to_rfc3339(),
                        e.severity.as_str(),
                        e.kind.as_str(),
                        e.message
                    );
                }
            })
        }

        Command::Cron { cmd } => {
            let cron = host.scheduler();
            match cmd {
                CronCmd::List => emit(json, &cron.list().await?, |jobs| {
                    for j in jobs {
                        println!("{:>3}  {:<20} {}", j.index, j.schedule, j.command);
                    }
                }),
                CronCmd::Add { schedule, command } => done(json, cron.add(&schedule, &command).await?),
                CronCmd::Remove { index } => done(json, cron.remove(index).await?),
                CronCmd::Timers => emit(json, &cron.timers().await?, |timers| {
                    for t in timers {
                        println!(
                            "{:<36} {:<36} {}",
                            t.unit,
                            t.activates,
                            t.next.as_deref().unwrap_or("n/a")
                        );
                    }
                }),
            }
        }

        Command::Container { cmd } => {
            let ctr = host.containers();
            match cmd {
                ContainerCmd::List => emit(json, &ctr.list().await?, |list| {
                    for c in list {
                        println!("{:<14} {:<24} {:<32} {}", c.id, c.name, c.image, c.status);
                    }
                }),
                ContainerCmd::Start { name } => done(json, ctr.start(&name).await?),
                ContainerCmd::Stop { name } => done(json, ctr.stop(&name).await?),
                ContainerCmd::Restart { name } => done(json, ctr.restart(&name).await?),
                ContainerCmd::Logs { name, lines } => emit(json, &ctr.logs(&name, lines).await?, |logs| {
                    println!("{logs}");
                }),
            }
        }

        Command::User { cmd } => {
            let users = host.users();
            match cmd {
                UserCmd::List => emit(json, &users.list().await?, |accounts| {
                    for a in accounts {
                        println!("{:<20} {:>6} {:>6} {:<24} {}", a.name, a.uid, a.gid, a.home, a.shell);
                    }
                }),
                UserCmd::Groups => emit(json, &users.groups().await?, |groups| {
                    for g in groups {
                        println!("{:<20} {:>6} {}", g.name, g.gid, g.members.join(","));
                    }
                }),
                UserCmd::Add { name } => done(json, users.add(&name).await?),
                UserCmd::Remove { name } => done(json, users.remove(&name).await?),
            }
        }
    }
}

fn emit<T: Serialize + ?Sized>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

/// Output of a mutating command.
fn done(json: bool, result: CommandResult) -> Result<()> {
    emit(json, &result, |r| {
        if !r.stdout.is_empty() {
            println!("{}", r.stdout);
        }
        println!("ok");
    })
}

fn ok(json: bool) -> Result<()> {
    emit(json, &serde_json::json!({ "ok": true }), |_| println!("ok"))
}

fn print_profile(p: &SystemProfile) {
    println!("distro: {} {}", p.distro, p.version);
    println!("kernel: {}", p.kernel);
    println!("init: {}", p.init_system);
    println!("packages: {}", p.package_manager);
    println!("firewall: {}", p.firewall);
    println!("network: {}", p.network_stack);
    println!("environment: {}", p.environment);
    println!("containers: {}", p.container_runtime);
}

fn print_processes(procs: &[ProcessInfo]) {
    for p in procs {
        println!(
            "{:>7} {:>7} {:<12} {:>5.1} {:>5.1} {}",
            p.pid, p.ppid, p.user, p.cpu_percent, p.mem_percent, p.command
        );
    }
}
