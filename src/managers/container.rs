use serde::Serialize;
use tracing::info;

use super::Host;
use crate::dispatch::{validate_name, CommandTemplate, Parsed};
use crate::error::{Error, Result};
use crate::exec::CommandResult;
use crate::profile::ContainerRuntime;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub running: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerOp {
    List,
    Start,
    Stop,
    Restart,
    Logs,
}

impl ContainerOp {
    fn verb(self) -> &'static str {
        match self {
            ContainerOp::List => "list containers",
            ContainerOp::Start => "start container",
            ContainerOp::Stop => "stop container",
            ContainerOp::Restart => "restart container",
            ContainerOp::Logs => "container logs",
        }
    }
}

/// docker and podman share a CLI; only the program differs.
pub fn template(runtime: ContainerRuntime, op: ContainerOp) -> Result<CommandTemplate> {
    let program = match runtime {
        ContainerRuntime::Docker => "docker",
        ContainerRuntime::Podman => "podman",
        ContainerRuntime::Unknown => {
            return Err(Error::unsupported_backend("container runtime", runtime))
        }
    };
    let args: &'static [&'static str] = match op {
        ContainerOp::List => &[
            "ps",
            "-a",
            "--format",
            "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}",
        ],
        ContainerOp::Start => &["start", "{name}"],
        ContainerOp::Stop => &["stop", "{name}"],
        ContainerOp::Restart => &["restart", "{name}"],
        ContainerOp::Logs => &["logs", "--tail", "{lines}", "{name}"],
    };
    Ok(CommandTemplate::new(program, args))
}

pub struct Containers {
    host: Host,
}

impl Containers {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    fn template(&self, op: ContainerOp) -> Result<CommandTemplate> {
        template(self.host.profile().container_runtime, op)
    }

    pub async fn list(&self) -> Result<Vec<Container>> {
        let op = ContainerOp::List;
        let out = self.host.run(op.verb(), &self.template(op)?.render(&[])).await?;
        Ok(parse_ps(&out.stdout).into_records("container ps"))
    }

    pub async fn start(&self, name: &str) -> Result<CommandResult> {
        self.lifecycle(ContainerOp::Start, name).await
    }

    pub async fn stop(&self, name: &str) -> Result<CommandResult> {
        self.lifecycle(ContainerOp::Stop, name).await
    }

    pub async fn restart(&self, name: &str) -> Result<CommandResult> {
        self.lifecycle(ContainerOp::Restart, name).await
    }

    /// Last `lines` lines of container output. docker writes the
    /// container's stderr to its own stderr, so both are returned.
    pub async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        validate_name("container", name)?;
        let op = ContainerOp::Logs;
        let lines = lines.to_string();
        let inv = self.template(op)?.render(&[("name", name), ("lines", &lines)]);
        let out = self.host.run(op.verb(), &inv).await?;
        Ok(match (out.stdout.is_empty(), out.stderr.is_empty()) {
            (_, true) => out.stdout,
            (true, false) => out.stderr,
            (false, false) => format!("{}\n{}", out.stdout, out.stderr),
        })
    }

    async fn lifecycle(&self, op: ContainerOp, name: &str) -> Result<CommandResult> {
        validate_name("container", name)?;
        let inv = self.template(op)?.render(&[("name", name)]);
        info!(container = name, command = %inv, "{}", op.verb());
        self.host.run(op.verb(), &inv).await
    }
}

/// Tab separated `ID NAMES IMAGE STATUS`.
pub fn parse_ps(raw: &str) -> Parsed<Container> {
    let mut parsed = Parsed::default();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let [id, name, image, status] = fields.as_slice() else {
            parsed.skip();
            continue;
        };
        if id.is_empty() {
            parsed.skip();
            continue;
        }
        parsed.push(Container {
            id: id.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            status: status.to_string(),
            running: status.starts_with("Up"),
        });
    }
    parsed
}
