use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::HijackedConnection;
use super::stdcopy;
use super::streams::{InputStream, OutputStream};
use super::terminal::{RestoreOnce, Terminal};
use crate::error::{HarnessError, Result};

/// The local ends of one hijack session.
#[derive(Default)]
pub struct StreamBinding {
    pub stdin: Option<InputStream>,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
    pub tty: bool,
}

impl std::fmt::Debug for StreamBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBinding")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("tty", &self.tty)
            .finish()
    }
}

struct RestoreOnExit(Arc<RestoreOnce>);

impl Drop for RestoreOnExit {
    fn drop(&mut self) {
        self.0.restore();
    }
}

/// How a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The remote side closed its output.
    Drained,
    /// Cancellation arrived while the remote side was still producing output.
    Cancelled,
}

// Scheduler turns an output relay gets to finish once cancellation fires.
const CANCEL_GRACE_YIELDS: usize = 8;

/// Relays bytes between `conn` and the local streams until the output side
/// finishes, the input side finishes (followed by the output side when one was
/// requested), or `cancel` fires. Output that is already complete is preferred
/// over a simultaneous cancellation.
pub async fn hold_hijacked_connection(
    conn: HijackedConnection,
    binding: StreamBinding,
    terminal: Arc<dyn Terminal>,
    cancel: CancellationToken,
) -> Result<RelayEnd> {
    let HijackedConnection { mut output, mut input } = conn;
    let StreamBinding {
        stdin,
        stdout,
        stderr,
        tty,
    } = binding;

    let has_input = stdin.is_some();
    let wants_output = stdout.is_some() || stderr.is_some();

    let raw = has_input && tty;
    if raw {
        terminal.set_raw()?;
    }
    let restorer = Arc::new(RestoreOnce::new(terminal, raw));
    let _restore_on_exit = RestoreOnExit(restorer.clone());

    let (stdout_tx, mut receive_stdout) = oneshot::channel::<io::Result<()>>();
    let output_task = if wants_output {
        let restorer = restorer.clone();
        Some(tokio::spawn(async move {
            let result = redirect_output(tty, &mut output, stdout, stderr).await;
            // Leave raw mode as soon as the remote side is done so that
            // anything printed afterwards looks normal.
            if tty && has_input {
                restorer.restore();
            }
            debug!("[hijack] End of stdout");
            let _ = stdout_tx.send(result);
        }))
    } else {
        None
    };

    let (stdin_tx, mut stdin_done) = oneshot::channel::<()>();
    let input_task = {
        let restorer = restorer.clone();
        tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = tokio::io::copy(&mut stdin, &mut input).await {
                    debug!("Error forwarding stdin: {}", e);
                }
                if tty {
                    restorer.restore();
                }
                debug!("[hijack] End of stdin");
            }
            if let Err(e) = input.shutdown().await {
                debug!("Couldn't send EOF: {}", e);
            }
            let _ = stdin_tx.send(());
        })
    };

    let result = tokio::select! {
        biased;
        res = &mut receive_stdout, if wants_output => stdout_result(res).map(|()| RelayEnd::Drained),
        _ = &mut stdin_done => {
            if wants_output {
                tokio::select! {
                    biased;
                    res = &mut receive_stdout => stdout_result(res).map(|()| RelayEnd::Drained),
                    _ = cancel.cancelled() => {
                        debug!("[hijack] Cancelled while draining stdout");
                        cancelled(&mut receive_stdout).await
                    }
                }
            } else {
                Ok(RelayEnd::Drained)
            }
        }
        _ = cancel.cancelled() => {
            debug!("[hijack] Cancelled");
            if wants_output {
                cancelled(&mut receive_stdout).await
            } else {
                Ok(RelayEnd::Cancelled)
            }
        }
    };

    input_task.abort();
    if let Some(task) = output_task {
        task.abort();
    }

    result
}

/// Lets an output relay that can finish without waiting on the wire do so
/// before the session counts as cancelled.
async fn cancelled(receive_stdout: &mut oneshot::Receiver<io::Result<()>>) -> Result<RelayEnd> {
    match finish_pending_output(receive_stdout).await {
        Some(res) => stdout_result(Ok(res)).map(|()| RelayEnd::Drained),
        None => Ok(RelayEnd::Cancelled),
    }
}

async fn finish_pending_output(
    receive_stdout: &mut oneshot::Receiver<io::Result<()>>,
) -> Option<io::Result<()>> {
    for _ in 0..CANCEL_GRACE_YIELDS {
        match receive_stdout.try_recv() {
            Ok(res) => return Some(res),
            Err(oneshot::error::TryRecvError::Closed) => return None,
            Err(oneshot::error::TryRecvError::Empty) => tokio::task::yield_now().await,
        }
    }
    receive_stdout.try_recv().ok()
}

fn stdout_result(res: std::result::Result<io::Result<()>, oneshot::error::RecvError>) -> Result<()> {
    let res = res.unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "output relay ended unexpectedly",
        ))
    });
    res.map_err(|e| {
        debug!("Error receiveStdout: {}", e);
        HarnessError::Hijack {
            context: "while hijacking stdout",
            source: e,
        }
    })
}

/// With a TTY the engine does not frame the stream, so everything goes to one
/// sink. Otherwise the frames are split into stdout and stderr.
async fn redirect_output(
    tty: bool,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
) -> io::Result<()> {
    let has_stdout = stdout.is_some();
    let mut stdout: OutputStream = stdout.unwrap_or_else(|| Box::new(tokio::io::sink()));
    let mut stderr: OutputStream = stderr.unwrap_or_else(|| Box::new(tokio::io::sink()));

    if tty {
        let target = if has_stdout { &mut stdout } else { &mut stderr };
        tokio::io::copy(reader, target).await?;
    } else {
        stdcopy::demux(reader, &mut stdout, &mut stderr).await?;
    }

    stdout.flush().await?;
    stderr.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::stdcopy::{encode_frame, StdStream};
    use crate::docker::streams::SharedBuffer;
    use crate::docker::terminal::testing::FakeTerminal;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn connection() -> (HijackedConnection, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (output, input) = tokio::io::split(client);
        (
            HijackedConnection {
                output: Box::new(output),
                input: Box::new(input),
            },
            server,
        )
    }

    fn terminal() -> Arc<FakeTerminal> {
        Arc::new(FakeTerminal::default())
    }

    #[tokio::test]
    async fn demultiplexes_stdout_and_stderr() {
        let (conn, mut server) = connection();
        tokio::spawn(async move {
            server.write_all(&encode_frame(StdStream::Stdout, b"hi\n")).await.unwrap();
            server.write_all(&encode_frame(StdStream::Stderr, b"warn\n")).await.unwrap();
        });

        let (out, err) = (SharedBuffer::new(), SharedBuffer::new());
        let binding = StreamBinding {
            stdout: Some(Box::new(out.clone())),
            stderr: Some(Box::new(err.clone())),
            ..Default::default()
        };

        hold_hijacked_connection(conn, binding, terminal(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.contents(), b"hi\n");
        assert_eq!(err.contents(), b"warn\n");
    }

    #[tokio::test]
    async fn tty_output_is_copied_raw() {
        let (conn, mut server) = connection();
        tokio::spawn(async move {
            server.write_all(b"\x1b[1mbold\x1b[0m\r\n").await.unwrap();
        });

        let out = SharedBuffer::new();
        let binding = StreamBinding {
            stdout: Some(Box::new(out.clone())),
            tty: true,
            ..Default::default()
        };

        hold_hijacked_connection(conn, binding, terminal(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.contents(), b"\x1b[1mbold\x1b[0m\r\n");
    }

    #[tokio::test]
    async fn terminal_is_restored_exactly_once() {
        let (conn, mut server) = connection();
        let echoed = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            server.write_all(&received).await.unwrap();
            received
        });

        let term = terminal();
        let out = SharedBuffer::new();
        let binding = StreamBinding {
            stdin: Some(Box::new(&b"ls\n"[..])),
            stdout: Some(Box::new(out.clone())),
            tty: true,
            ..Default::default()
        };

        hold_hijacked_connection(conn, binding, term.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(echoed.await.unwrap(), b"ls\n");
        assert_eq!(out.contents(), b"ls\n");
        assert_eq!(term.raw_calls.load(Ordering::SeqCst), 1);
        assert_eq!(term.restore_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn raw_mode_requires_input_and_tty() {
        let (conn, server) = connection();
        drop(server);

        let term = terminal();
        let binding = StreamBinding {
            stdout: Some(Box::new(SharedBuffer::new())),
            tty: true,
            ..Default::default()
        };

        hold_hijacked_connection(conn, binding, term.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(term.raw_calls.load(Ordering::SeqCst), 0);
        assert_eq!(term.restore_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_ends_a_silent_session() {
        let (conn, _server) = connection();
        let cancel = CancellationToken::new();

        let binding = StreamBinding {
            stdout: Some(Box::new(SharedBuffer::new())),
            ..Default::default()
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let end = tokio::time::timeout(
            Duration::from_secs(2),
            hold_hijacked_connection(conn, binding, terminal(), cancel),
        )
        .await
        .expect("relay should observe cancellation")
        .unwrap();
        assert_eq!(end, RelayEnd::Cancelled);
    }

    #[tokio::test]
    async fn complete_output_wins_over_cancellation() {
        let (conn, mut server) = connection();
        server.write_all(&encode_frame(StdStream::Stdout, b"done\n")).await.unwrap();
        drop(server);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = SharedBuffer::new();
        let binding = StreamBinding {
            stdout: Some(Box::new(out.clone())),
            ..Default::default()
        };

        let end = hold_hijacked_connection(conn, binding, terminal(), cancel)
            .await
            .unwrap();

        assert_eq!(end, RelayEnd::Drained);
        assert_eq!(out.contents(), b"done\n");
    }

    #[tokio::test]
    async fn daemon_error_frame_fails_the_session() {
        let (conn, mut server) = connection();
        tokio::spawn(async move {
            server
                .write_all(&encode_frame(StdStream::Systemerr, b"no such exec"))
                .await
                .unwrap();
        });

        let binding = StreamBinding {
            stdout: Some(Box::new(SharedBuffer::new())),
            ..Default::default()
        };

        let err = hold_hijacked_connection(conn, binding, terminal(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Hijack { .. }));
        assert!(err.to_string().contains("no such exec"));
    }

    #[tokio::test]
    async fn session_without_outputs_ends_when_input_is_exhausted() {
        let (conn, _server) = connection();

        let end = tokio::time::timeout(
            Duration::from_secs(2),
            hold_hijacked_connection(
                conn,
                StreamBinding::default(),
                terminal(),
                CancellationToken::new(),
            ),
        )
        .await
        .expect("nothing to relay")
        .unwrap();
        assert_eq!(end, RelayEnd::Drained);
    }

    #[tokio::test]
    async fn discard_sinks_keep_the_connection_until_output_ends() {
        let (conn, mut server) = connection();
        let remote = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            server
                .write_all(&encode_frame(StdStream::Stdout, b"late\n"))
                .await
                .is_ok()
        });

        let binding = StreamBinding {
            stdout: Some(Box::new(tokio::io::sink())),
            stderr: Some(Box::new(tokio::io::sink())),
            ..Default::default()
        };
        let end = tokio::time::timeout(
            Duration::from_secs(2),
            hold_hijacked_connection(conn, binding, terminal(), CancellationToken::new()),
        )
        .await
        .expect("relay should end with the output")
        .unwrap();

        assert_eq!(end, RelayEnd::Drained);
        assert!(remote.await.unwrap());
    }
}
