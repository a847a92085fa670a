use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::EngineClient;
use super::terminal::{Terminal, TerminalSize};
use crate::error::{HarnessError, Result};

/// Which remote pseudo-terminal a resize applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeTarget {
    Container(String),
    Exec(String),
}

/// How size changes are noticed. Signals are only available on unix; other
/// platforms poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Signal,
    Poll(Duration),
}

impl Default for WatchMode {
    fn default() -> Self {
        if cfg!(unix) {
            WatchMode::Signal
        } else {
            WatchMode::Poll(Duration::from_millis(250))
        }
    }
}

#[derive(Clone)]
struct Resizer {
    engine: Arc<dyn EngineClient>,
    target: ResizeTarget,
    terminal: Arc<dyn Terminal>,
}

impl Resizer {
    /// Pushes the current local size and returns the size it observed.
    async fn resize(&self) -> Option<TerminalSize> {
        let observed = self.terminal.size();
        let size = observed.filter(|s| !s.is_zero())?;

        let result = match &self.target {
            ResizeTarget::Container(id) => {
                self.engine.resize_container(id, size.height, size.width).await
            }
            ResizeTarget::Exec(id) => self.engine.resize_exec(id, size.height, size.width).await,
        };
        if let Err(e) = result {
            debug!("resize error: {}", e);
        }
        observed
    }
}

/// Keeps the remote terminal the same size as the local one until dropped or
/// until the owning scope is cancelled.
pub struct TtyMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for TtyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyMonitor")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

impl TtyMonitor {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TtyMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn monitor_tty_size(
    engine: Arc<dyn EngineClient>,
    target: ResizeTarget,
    terminal: Arc<dyn Terminal>,
    scope: &CancellationToken,
) -> Result<TtyMonitor> {
    monitor_tty_size_with(engine, target, terminal, scope, WatchMode::default()).await
}

pub async fn monitor_tty_size_with(
    engine: Arc<dyn EngineClient>,
    target: ResizeTarget,
    terminal: Arc<dyn Terminal>,
    scope: &CancellationToken,
    mode: WatchMode,
) -> Result<TtyMonitor> {
    if !terminal.is_terminal() {
        debug!("Unable to monitor tty size, stdout is not a terminal");
        return Err(HarnessError::NotATerminal);
    }

    let resizer = Resizer {
        engine,
        target,
        terminal,
    };
    let baseline = resizer.resize().await;

    let cancel = scope.child_token();
    let handle = match mode {
        #[cfg(unix)]
        WatchMode::Signal => watch_signals(resizer, cancel.clone())?,
        #[cfg(not(unix))]
        WatchMode::Signal => {
            watch_polling(resizer, cancel.clone(), Duration::from_millis(250), baseline)
        }
        WatchMode::Poll(interval) => watch_polling(resizer, cancel.clone(), interval, baseline),
    };

    Ok(TtyMonitor { cancel, handle })
}

#[cfg(unix)]
fn watch_signals(resizer: Resizer, cancel: CancellationToken) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigwinch = signal(SignalKind::window_change())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = sigwinch.recv() => {
                    if received.is_none() {
                        break;
                    }
                    resizer.resize().await;
                }
            }
        }
    }))
}

/// Compares against the size seen by the last resize, starting from the
/// initial one, so a change made before the first tick is still pushed.
fn watch_polling(
    resizer: Resizer,
    cancel: CancellationToken,
    interval: Duration,
    baseline: Option<TerminalSize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut previous = baseline;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if resizer.terminal.size() != previous {
                        previous = resizer.resize().await;
                    }
                }
            }
        }
    })
}
