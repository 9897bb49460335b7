//! Capability managers. Each one picks a backend from the profile, renders
//! its command template, runs it and parses the output.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::dispatch::Invocation;
use crate::error::{Error, ExecError, Result};
use crate::exec::{deadline_after, CommandResult, Executor};
use crate::profile::SystemProfile;

pub mod audit;
pub mod container;
pub mod disk;
pub mod firewall;
pub mod network;
pub mod package;
pub mod process;
pub mod scan;
pub mod scheduler;
pub mod service;
pub mod user;

pub use audit::Audit;
pub use container::Containers;
pub use disk::Disks;
pub use firewall::Firewall;
pub use network::Network;
pub use package::Packages;
pub use process::Processes;
pub use scheduler::Scheduler;
pub use service::Services;
pub use user::Users;

/// Shared state handed to every manager: the read-only profile, the
/// executor, and the per-command deadline.
#[derive(Clone)]
pub struct Host {
    profile: Arc<SystemProfile>,
    exec: Arc<dyn Executor>,
    timeout: Duration,
}

impl Host {
    pub fn new(profile: SystemProfile, exec: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self {
            profile: Arc::new(profile),
            exec,
            timeout,
        }
    }

    pub fn profile(&self) -> &SystemProfile {
        &self.profile
    }

    pub fn packages(&self) -> Packages {
        Packages::new(self.clone())
    }

    pub fn services(&self) -> Services {
        Services::new(self.clone())
    }

    pub fn firewall(&self) -> Firewall {
        Firewall::new(self.clone())
    }

    pub fn network(&self) -> Network {
        Network::new(self.clone())
    }

    pub fn disks(&self) -> Disks {
        Disks::new(self.clone())
    }

    pub fn processes(&self) -> Processes {
        Processes::new(self.clone())
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.clone())
    }

    pub fn containers(&self) -> Containers {
        Containers::new(self.clone())
    }

    pub fn users(&self) -> Users {
        Users::new(self.clone())
    }

    /// Runs `inv`; non-zero exits outside the template's ok codes are errors
    /// wrapped with `operation`.
    pub(crate) async fn run(&self, operation: &str, inv: &Invocation) -> Result<CommandResult> {
        self.run_inner(operation, inv, None).await
    }

    pub(crate) async fn run_with_input(
        &self,
        operation: &str,
        inv: &Invocation,
        stdin: &[u8],
    ) -> Result<CommandResult> {
        self.run_inner(operation, inv, Some(stdin)).await
    }

    /// Like [`Host::run`] but any exit code is returned as a result; used
    /// where the exit code encodes a state rather than a failure.
    pub(crate) async fn run_any_exit(&self, operation: &str, inv: &Invocation) -> Result<CommandResult> {
        match self.spawn(inv, None).await {
            Ok(result) => Ok(result),
            Err(ExecError::Exit { result, .. }) => Ok(result),
            Err(source) => Err(Error::Exec {
                operation: operation.to_string(),
                source,
            }),
        }
    }

    async fn run_inner(
        &self,
        operation: &str,
        inv: &Invocation,
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult> {
        match self.spawn(inv, stdin).await {
            Ok(result) => Ok(result),
            Err(ExecError::Exit { result, .. })
                if result.exit_code.is_some_and(|c| inv.ok_codes.contains(&c)) =>
            {
                Ok(result)
            }
            Err(source) => Err(Error::Exec {
                operation: operation.to_string(),
                source,
            }),
        }
    }

    async fn spawn(
        &self,
        inv: &Invocation,
        stdin: Option<&[u8]>,
    ) -> std::result::Result<CommandResult, ExecError> {
        debug!(command = %inv, "dispatching");
        self.exec
            .exec_with_input(deadline_after(self.timeout), stdin, &inv.program, &inv.args)
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::exec::fake::FakeExecutor;

    pub fn host(profile: SystemProfile, exec: FakeExecutor) -> (Host, Arc<FakeExecutor>) {
        let exec = Arc::new(exec);
        let host = Host::new(profile, exec.clone(), Duration::from_secs(5));
        (host, exec)
    }
}
