use backoff::ExponentialBackoffBuilder;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::container::{Container, ContainerState};
use super::engine::{EngineClient, ExecSpec, ExecStatus};
use super::hijack::{hold_hijacked_connection, RelayEnd, StreamBinding};
use super::streams::{InputStream, OutputStream, SharedBuffer};
use super::tty::{self, ResizeTarget, TtyMonitor};
use crate::error::{ExitError, HarnessError, Result};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Caller's end of `Execution::stdin_pipe`. Shut it down or drop it to close
/// the process's stdin.
pub type PipeWriter = WriteHalf<DuplexStream>;

/// Caller's end of `Execution::stdout_pipe` and `Execution::stderr_pipe`.
pub type PipeReader = ReadHalf<DuplexStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Unstarted,
    Started,
    Completed,
    Failed,
}

/// A command run inside a `Container`, modelled on `std::process::Command`.
/// Unset streams and environment fall back to the container's.
pub struct Execution {
    container: Container,
    cancel: CancellationToken,
    path: String,
    args: Vec<String>,
    env: Option<Vec<String>>,
    dir: Option<String>,
    stdin: Option<InputStream>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    state: ExecutionState,
    exec_id: Option<String>,
    relay: Option<oneshot::Receiver<Result<RelayEnd>>>,
    exit_code: Option<i64>,
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("container", &self.container.id())
            .field("path", &self.path)
            .field("args", &self.args)
            .field("state", &self.state)
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

impl Execution {
    /// `argv[0]` is the program, the rest are its arguments.
    pub fn new<I, S>(container: &Container, argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let path = argv
            .next()
            .ok_or_else(|| HarnessError::InvalidCommand("empty command".to_string()))?;

        Ok(Self {
            container: container.clone(),
            cancel: container.scope().child_token(),
            path,
            args: argv.collect(),
            env: None,
            dir: None,
            stdin: None,
            stdout: None,
            stderr: None,
            state: ExecutionState::Unstarted,
            exec_id: None,
            relay: None,
            exit_code: None,
        })
    }

    /// Splits `command` the way a POSIX shell would, without running a shell.
    pub fn from_shell_string(container: &Container, command: &str) -> Result<Self> {
        let argv = shlex::split(command)
            .ok_or_else(|| HarnessError::InvalidCommand(format!("cannot parse {command:?}")))?;
        Self::new(container, argv)
    }

    pub fn env<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let env = self.env.get_or_insert_with(Vec::new);
        env.extend(
            vars.into_iter()
                .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref())),
        );
        self
    }

    pub fn current_dir(&mut self, dir: impl Into<String>) -> &mut Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn stdin(&mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> &mut Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn stdout(&mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) -> &mut Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn stderr(&mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) -> &mut Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.path.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn exec_id(&self) -> Option<&str> {
        self.exec_id.as_deref()
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Creates the exec on the engine and begins relaying its streams. Fails
    /// without retrying if either engine call fails.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ExecutionState::Unstarted {
            return Err(HarnessError::InvalidState(format!(
                "execution {:?} already started",
                self.command_line()
            )));
        }
        if self.container.state() != ContainerState::Running {
            return Err(HarnessError::InvalidState(format!(
                "container {} is not running",
                self.container.id()
            )));
        }

        let container = self.container.clone();
        let engine = container.engine();
        let tty = container.tty();
        let spec = container.options();

        let attach_stdin = self.stdin.is_some() || container.has_stdin();

        let exec = ExecSpec {
            cmd: self.command_line(),
            env: self.env.clone().unwrap_or_else(|| spec.env.clone()),
            working_dir: self
                .dir
                .clone()
                .or_else(|| Some(spec.working_dir.clone()).filter(|d| !d.is_empty())),
            user: spec.user.clone(),
            privileged: spec.host.privileged,
            tty,
            attach_stdin,
        };

        let exec_id = engine.create_exec(container.id(), &exec).await.map_err(|e| {
            error!("Failed to create exec {:?} in {}: {}", exec.cmd, container.id(), e);
            e
        })?;
        let conn = engine.start_exec(&exec_id, tty).await.map_err(|e| {
            error!("Failed to start exec {}: {}", exec_id, e);
            e
        })?;
        debug!("Started exec {} running {:?}", exec_id, exec.cmd);

        // Streams are claimed only once the engine accepted the exec, so a
        // failed start leaves them for the next attempt.
        let stdin = if attach_stdin {
            self.stdin.take().or_else(|| container.take_stdin())
        } else {
            None
        };
        let stdout = self.stdout.take().or_else(|| container.stdout());
        let stderr = self.stderr.take().or_else(|| container.stderr());

        let binding = StreamBinding {
            stdin,
            stdout,
            stderr,
            tty,
        };
        let terminal = container.terminal();
        let cancel = self.cancel.clone();
        let (relay_tx, relay_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = hold_hijacked_connection(conn, binding, terminal, cancel).await;
            let _ = relay_tx.send(result);
        });

        self.exec_id = Some(exec_id);
        self.relay = Some(relay_rx);
        self.state = ExecutionState::Started;
        Ok(())
    }

    /// Waits for the relay to finish and then for the engine to report the
    /// process as exited. A non-zero status becomes `HarnessError::Exit`.
    /// Waiting on an unstarted execution returns immediately; waiting again
    /// returns the first outcome.
    pub async fn wait(&mut self) -> Result<()> {
        match self.state {
            ExecutionState::Unstarted | ExecutionState::Completed => return Ok(()),
            ExecutionState::Failed => {
                return Err(match self.exit_code {
                    Some(code) => ExitError::new(code).into(),
                    None => HarnessError::InvalidState(format!(
                        "execution {:?} already failed",
                        self.command_line()
                    )),
                })
            }
            ExecutionState::Started => {}
        }

        let relayed = match self.relay.take() {
            Some(relay) => relay.await.unwrap_or_else(|_| {
                Err(HarnessError::Hijack {
                    context: "failed to wait for hijacked connection",
                    source: io::Error::new(io::ErrorKind::Other, "relay task ended unexpectedly"),
                })
            }),
            None => Ok(RelayEnd::Drained),
        };
        match relayed {
            Ok(RelayEnd::Drained) => {}
            Ok(RelayEnd::Cancelled) => {
                self.state = ExecutionState::Failed;
                return Err(self.cancellation_error());
            }
            Err(e) => {
                self.state = ExecutionState::Failed;
                return Err(e);
            }
        }

        let Some(exec_id) = self.exec_id.clone() else {
            return Err(HarnessError::InvalidState("execution has no exec id".to_string()));
        };
        let status = self.exit_status(&exec_id).await;

        match status {
            Ok(ExecStatus {
                exit_code: Some(code),
                ..
            }) if code != 0 => {
                debug!("Exec {} exited with status {}", exec_id, code);
                self.state = ExecutionState::Failed;
                self.exit_code = Some(code);
                Err(ExitError::new(code).into())
            }
            Ok(_) => {
                self.state = ExecutionState::Completed;
                Ok(())
            }
            Err(e) => {
                self.state = ExecutionState::Failed;
                Err(e)
            }
        }
    }

    /// The output has ended, so the process has usually exited already. The
    /// first inspect reports that outcome even if the container was stopped
    /// since; further polls race against cancellation.
    async fn exit_status(&self, exec_id: &str) -> Result<ExecStatus> {
        let engine = self.container.engine();
        match engine.inspect_exec(exec_id).await {
            Ok(status) if !status.running => return Ok(status),
            Ok(_) => {}
            Err(_) if self.cancel.is_cancelled() => return Err(self.cancellation_error()),
            Err(e) => return Err(e),
        }

        tokio::select! {
            biased;
            status = poll_until_exited(engine, exec_id) => status,
            _ = self.cancel.cancelled() => Err(self.cancellation_error()),
        }
    }

    fn cancellation_error(&self) -> HarnessError {
        if self.container.deadline_exceeded() {
            HarnessError::DeadlineExceeded
        } else {
            HarnessError::Cancelled
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    /// Runs to completion and returns stdout. On a non-zero exit the returned
    /// `ExitError` carries stderr, unless stderr was already redirected.
    pub async fn output(&mut self) -> Result<Vec<u8>> {
        if self.stdout.is_some() {
            return Err(HarnessError::StreamAlreadySet("stdout"));
        }
        let stdout = SharedBuffer::new();
        self.stdout = Some(Box::new(stdout.clone()));

        let stderr = if self.stderr.is_none() {
            let buffer = SharedBuffer::new();
            self.stderr = Some(Box::new(buffer.clone()));
            Some(buffer)
        } else {
            None
        };

        match self.run().await {
            Ok(()) => Ok(stdout.take()),
            Err(HarnessError::Exit(mut exit)) => {
                if let Some(stderr) = stderr {
                    exit.stderr = stderr.take();
                }
                Err(HarnessError::Exit(exit))
            }
            Err(e) => Err(e),
        }
    }

    /// Runs to completion and returns stdout and stderr interleaved.
    pub async fn combined_output(&mut self) -> Result<Vec<u8>> {
        if self.stdout.is_some() {
            return Err(HarnessError::StreamAlreadySet("stdout"));
        }
        if self.stderr.is_some() {
            return Err(HarnessError::StreamAlreadySet("stderr"));
        }
        let combined = SharedBuffer::new();
        self.stdout = Some(Box::new(combined.clone()));
        self.stderr = Some(Box::new(combined.clone()));

        self.run().await?;
        Ok(combined.take())
    }

    pub fn stdin_pipe(&mut self) -> Result<PipeWriter> {
        if self.stdin.is_some() {
            return Err(HarnessError::StreamAlreadySet("stdin"));
        }
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdin = Some(Box::new(ours));
        let (_, writer) = tokio::io::split(theirs);
        Ok(writer)
    }

    pub fn stdout_pipe(&mut self) -> Result<PipeReader> {
        if self.stdout.is_some() {
            return Err(HarnessError::StreamAlreadySet("stdout"));
        }
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        self.stdout = Some(Box::new(ours));
        let (reader, _) = tokio::io::split(theirs);
        Ok(reader)
    }

    pub fn stderr_pipe(&mut self) -> Result<PipeReader> {
        if self.stderr.is_some() {
            return Err(HarnessError::StreamAlreadySet("stderr"));
        }
        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        self.stderr = Some(Box::new(ours));
        let (reader, _) = tokio::io::split(theirs);
        Ok(reader)
    }

    /// Keeps the exec's terminal the size of the local one. Only valid after
    /// `start`.
    pub async fn monitor_tty_size(&self) -> Result<TtyMonitor> {
        let Some(exec_id) = self.exec_id.clone() else {
            return Err(HarnessError::InvalidState(
                "execution must be started before monitoring its tty".to_string(),
            ));
        };
        tty::monitor_tty_size(
            self.container.engine().clone(),
            ResizeTarget::Exec(exec_id),
            self.container.terminal(),
            &self.cancel,
        )
        .await
    }
}

/// Polls the exec until the engine reports it stopped. Inspect failures end
/// the wait immediately.
async fn poll_until_exited(engine: &Arc<dyn EngineClient>, exec_id: &str) -> Result<ExecStatus> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_interval(Duration::from_secs(2))
        .with_max_elapsed_time(None)
        .build();

    backoff::future::retry(policy, || async move {
        let status = engine
            .inspect_exec(exec_id)
            .await
            .map_err(backoff::Error::permanent)?;
        if status.running {
            return Err(backoff::Error::transient(HarnessError::InvalidState(format!(
                "exec {exec_id} still running"
            ))));
        }
        Ok(status)
    })
    .await
}
