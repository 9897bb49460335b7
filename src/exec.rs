use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::Mutex,
    task::JoinHandle,
    time,
    time::Instant,
};
use tracing::{debug, trace};

use crate::error::ExecError;

/// Captured outcome of one external program run. Output is trimmed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external programs. Arguments are always passed as a flat vector,
/// never through a shell.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn exec_with_input(
        &self,
        deadline: Instant,
        stdin: Option<&[u8]>,
        program: &str,
        args: &[String],
    ) -> Result<CommandResult, ExecError>;

    async fn exec(
        &self,
        deadline: Instant,
        program: &str,
        args: &[String],
    ) -> Result<CommandResult, ExecError> {
        self.exec_with_input(deadline, None, program, args).await
    }
}

pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

/// Executor backed by real child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn exec_with_input(
        &self,
        deadline: Instant,
        stdin: Option<&[u8]>,
        program: &str,
        args: &[String],
    ) -> Result<CommandResult, ExecError> {
        let started = std::time::Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let input = input.to_vec();
            let name = program.to_string();
            tokio::spawn(async move {
                if let Err(err) = pipe.write_all(&input).await {
                    debug!(program = %name, error = %err, "failed to write child stdin");
                }
            });
        }

        let stdout = Capture::spawn(child.stdout.take());
        let stderr = Capture::spawn(child.stderr.take());

        match time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                let result = CommandResult {
                    stdout: stdout.finish(deadline).await,
                    stderr: stderr.finish(deadline).await,
                    exit_code: status.code(),
                    duration: started.elapsed(),
                };
                trace!(program, code = ?result.exit_code, elapsed = ?result.duration, "command finished");
                if status.success() {
                    Ok(result)
                } else {
                    Err(ExecError::Exit {
                        program: program.to_string(),
                        result,
                    })
                }
            }
            Ok(Err(source)) => Err(ExecError::Wait {
                program: program.to_string(),
                source,
            }),
            Err(_) => {
                if let Err(err) = child.kill().await {
                    debug!(program, error = %err, "failed to kill child");
                }
                debug!(program, ?args, "command deadline expired; child killed");
                let drain = Instant::now() + DRAIN_AFTER_KILL;
                Err(ExecError::Timeout {
                    program: program.to_string(),
                    result: CommandResult {
                        stdout: stdout.finish(drain).await,
                        stderr: stderr.finish(drain).await,
                        exit_code: None,
                        duration: started.elapsed(),
                    },
                })
            }
        }
    }
}

/// How long a killed child's pipes may keep draining. Grandchildren can hold
/// them open indefinitely.
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(100);

/// Output pipe read in the background so that whatever arrived before a
/// timeout is still available.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().await.extend_from_slice(&chunk[..n]),
                    Err(err) => {
                        debug!(error = %err, "pipe read failed");
                        break;
                    }
                }
            }
        });
        Self { buf, task }
    }

    /// Waits for the pipe to close, but no later than `until`.
    async fn finish(mut self, until: Instant) -> String {
        if time::timeout_at(until, &mut self.task).await.is_err() {
            self.task.abort();
        }
        let bytes = self.buf.lock().await;
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::{async_trait, time, CommandResult, Duration, ExecError, Executor, Instant};

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Call {
        pub program: String,
        pub args: Vec<String>,
        pub stdin: Option<String>,
    }

    impl Call {
        pub fn argv(&self) -> Vec<&str> {
            std::iter::once(self.program.as_str())
                .chain(self.args.iter().map(String::as_str))
                .collect()
        }
    }

    #[derive(Clone, Debug)]
    enum Scripted {
        Output { stdout: String, stderr: String, code: i32 },
        Missing,
    }

    /// Records every invocation and answers from a per-program script.
    /// Unscripted programs succeed with empty output. Calls made after the
    /// deadline, or stalled past it, time out.
    #[derive(Debug, Default)]
    pub struct FakeExecutor {
        script: Mutex<HashMap<String, Scripted>>,
        stalls: Mutex<HashMap<String, Duration>>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(self, program: &str, stdout: &str) -> Self {
            self.script_with(program, stdout, "", 0)
        }

        pub fn fail(self, program: &str, code: i32, stderr: &str) -> Self {
            self.script_with(program, "", stderr, code)
        }

        pub fn script_with(self, program: &str, stdout: &str, stderr: &str, code: i32) -> Self {
            self.script.lock().unwrap().insert(
                program.to_string(),
                Scripted::Output {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    code,
                },
            );
            self
        }

        pub fn missing(self, program: &str) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(program.to_string(), Scripted::Missing);
            self
        }

        /// Delays every answer from `program` by `delay`.
        pub fn stall(self, program: &str, delay: Duration) -> Self {
            self.stalls
                .lock()
                .unwrap()
                .insert(program.to_string(), delay);
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn last_call(&self) -> Call {
            self.calls().pop().expect("no command was executed")
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn exec_with_input(
            &self,
            deadline: Instant,
            stdin: Option<&[u8]>,
            program: &str,
            args: &[String],
        ) -> Result<CommandResult, ExecError> {
            self.calls.lock().unwrap().push(Call {
                program: program.to_string(),
                args: args.to_vec(),
                stdin: stdin.map(|s| String::from_utf8_lossy(s).to_string()),
            });
            let stall = self.stalls.lock().unwrap().get(program).copied();
            let ready = Instant::now() + stall.unwrap_or_default();
            if ready >= deadline {
                time::sleep_until(deadline).await;
                return Err(ExecError::Timeout {
                    program: program.to_string(),
                    result: CommandResult::default(),
                });
            }
            time::sleep_until(ready).await;
            let scripted = self.script.lock().unwrap().get(program).cloned();
            match scripted {
                None => Ok(CommandResult {
                    exit_code: Some(0),
                    ..CommandResult::default()
                }),
                Some(Scripted::Missing) => Err(ExecError::Spawn {
                    program: program.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                }),
                Some(Scripted::Output {
                    stdout,
                    stderr,
                    code,
                }) => {
                    let result = CommandResult {
                        stdout: stdout.trim().to_string(),
                        stderr: stderr.trim().to_string(),
                        exit_code: Some(code),
                        duration: Duration::ZERO,
                    };
                    if code == 0 {
                        Ok(result)
                    } else {
                        Err(ExecError::Exit {
                            program: program.to_string(),
                            result,
                        })
                    }
                }
            }
        }
    }
}
