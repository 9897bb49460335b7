use std::path::PathBuf;

use thiserror::Error;

use crate::exec::CommandResult;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of a single external program invocation.
///
/// Every variant that got as far as running the child keeps the partial
/// [`CommandResult`] so callers can inspect stderr.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to collect output of {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {:?}", .result.duration)]
    Timeout {
        program: String,
        result: CommandResult,
    },

    #[error("{program} {}", exit_summary(.result))]
    Exit {
        program: String,
        result: CommandResult,
    },
}

impl ExecError {
    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            ExecError::Timeout { result, .. } | ExecError::Exit { result, .. } => Some(result),
            ExecError::Spawn { .. } | ExecError::Wait { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

fn exit_summary(result: &CommandResult) -> String {
    let status = match result.exit_code {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    };
    if result.stderr.is_empty() {
        status
    } else {
        format!("{status}: {}", result.stderr)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported {capability} backend: {detected}")]
    UnsupportedBackend {
        capability: &'static str,
        detected: String,
    },

    #[error("{operation} is not supported with {backend}")]
    UnsupportedOperation {
        operation: &'static str,
        backend: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} failed")]
    Exec {
        operation: String,
        #[source]
        source: ExecError,
    },

    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected {tool} output: {reason}")]
    Parse { tool: &'static str, reason: String },
}

impl Error {
    pub fn unsupported_backend(capability: &'static str, detected: impl ToString) -> Self {
        Error::UnsupportedBackend {
            capability,
            detected: detected.to_string(),
        }
    }

    pub fn unsupported_operation(operation: &'static str, backend: impl ToString) -> Self {
        Error::UnsupportedOperation {
            operation,
            backend: backend.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Error::Io { path, source }
    }

    /// Stderr of the failed command, when the failure got that far.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::Exec { source, .. } => source.result().map(|r| r.stderr.as_str()),
            _ => None,
        }
    }
}
