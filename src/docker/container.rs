use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::{AttachSpec, ContainerInfo, ContainerSpec, EngineClient};
use super::gpu::{GpuAllocator, GpuLease};
use super::hijack::{hold_hijacked_connection, StreamBinding};
use super::options::ContainerOptions;
use super::streams::{InputStream, OutputStream, SharedSink};
use super::terminal::Terminal;
use super::tty::{self, ResizeTarget, TtyMonitor};
use crate::error::{HarnessError, Result};

// Stand-in deadline for limits too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(limit: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(limit).unwrap_or_else(|| now + FAR_FUTURE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    id: String,
    engine: Arc<dyn EngineClient>,
    spec: ContainerSpec,
    env: BTreeMap<String, String>,
    state: Mutex<ContainerState>,
    // Held across start and stop so the two never interleave.
    transition: tokio::sync::Mutex<()>,
    scope: CancellationToken,
    deadline: watch::Sender<Instant>,
    deadline_exceeded: AtomicBool,
    allocator: Option<Arc<GpuAllocator>>,
    leases: Mutex<Vec<GpuLease>>,
    stdin: Mutex<Option<InputStream>>,
    stdout: Option<SharedSink>,
    stderr: Option<SharedSink>,
    terminal: Arc<dyn Terminal>,
}

/// A running sandbox. Cloning yields another handle to the same container.
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("image", &self.inner.spec.image)
            .field("state", &self.state())
            .finish()
    }
}

impl Container {
    /// Pulls the image if needed, reserves any requested GPUs and creates the
    /// container. The time limit starts counting here, not at `start`.
    pub async fn new(engine: Arc<dyn EngineClient>, mut options: ContainerOptions) -> Result<Self> {
        let image = options.image().to_string();
        if !engine.has_image(&image).await? {
            info!("Image {} not found locally, pulling", image);
            engine.pull_image(&image).await?;
        }

        let (allocator, leases) = match options.gpus.take() {
            Some((allocator, count)) => {
                let leases = allocator.allocate(count).await?;
                options.bind_gpus(&leases);
                (Some(allocator), leases)
            }
            None => (None, Vec::new()),
        };

        let spec = options.spec();
        let id = match engine.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to create container from image {}: {}", image, e);
                if let Some(allocator) = &allocator {
                    allocator.release(leases);
                }
                return Err(e);
            }
        };
        info!("Created container {} from image {}", id, image);

        let scope = options.parent.child_token();
        let (deadline, deadline_rx) = watch::channel(deadline_after(options.time_limit));

        let container = Container {
            inner: Arc::new(Inner {
                id,
                engine,
                spec,
                env: options.env,
                state: Mutex::new(ContainerState::Created),
                transition: tokio::sync::Mutex::new(()),
                scope,
                deadline,
                deadline_exceeded: AtomicBool::new(false),
                allocator,
                leases: Mutex::new(leases),
                stdin: Mutex::new(options.stdin),
                stdout: options.stdout,
                stderr: options.stderr,
                terminal: options.terminal,
            }),
        };
        container.spawn_deadline_watcher(deadline_rx);
        Ok(container)
    }

    fn spawn_deadline_watcher(&self, mut deadline: watch::Receiver<Instant>) {
        let container = self.clone();
        let scope = self.inner.scope.clone();
        tokio::spawn(async move {
            loop {
                let at = *deadline.borrow_and_update();
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = tokio::time::sleep_until(at) => break,
                    changed = deadline.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            warn!("Container {} exceeded its time limit, stopping", container.id());
            container.inner.deadline_exceeded.store(true, Ordering::SeqCst);
            if let Err(e) = container.stop().await {
                error!("Failed to stop container {} after deadline: {}", container.id(), e);
            }
        });
    }

    pub async fn start(&self) -> Result<()> {
        let _transition = self.inner.transition.lock().await;
        let state = self.state();
        if state != ContainerState::Created {
            return Err(HarnessError::InvalidState(format!(
                "cannot start container {} while {:?}",
                self.inner.id, state
            )));
        }

        self.inner.engine.start_container(&self.inner.id).await?;
        *self.inner.state.lock() = ContainerState::Running;
        info!("Started container {}", self.inner.id);
        Ok(())
    }

    /// Kills and removes the container and returns its GPU leases. Safe to
    /// call any number of times from any task; only the first call does work.
    /// Outstanding executions observe cancellation.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        inner.scope.cancel();

        let _transition = inner.transition.lock().await;
        let previous = {
            let mut state = inner.state.lock();
            let previous = *state;
            if matches!(previous, ContainerState::Stopping | ContainerState::Stopped) {
                return Ok(());
            }
            *state = ContainerState::Stopping;
            previous
        };

        let result = if previous == ContainerState::Running {
            self.kill_and_remove().await
        } else {
            debug!("Container {} was never started, nothing to kill", inner.id);
            Ok(())
        };

        self.release_leases();
        *inner.state.lock() = ContainerState::Stopped;
        info!("Stopped container {}", inner.id);
        result
    }

    async fn kill_and_remove(&self) -> Result<()> {
        let engine = &self.inner.engine;
        let id = &self.inner.id;

        let killed = engine.kill_container(id, "SIGKILL").await;
        if let Err(e) = &killed {
            warn!("Failed to kill container {}: {}", id, e);
        }
        let removed = engine.remove_container(id, true).await;
        if let Err(e) = &removed {
            warn!("Failed to remove container {}: {}", id, e);
        }

        killed.and(removed)
    }

    fn release_leases(&self) {
        let leases = std::mem::take(&mut *self.inner.leases.lock());
        if let Some(allocator) = &self.inner.allocator {
            allocator.release(leases);
        }
    }

    pub async fn kill_with_signal(&self, signal: &str) -> Result<()> {
        self.inner.engine.kill_container(&self.inner.id, signal).await
    }

    pub async fn info(&self) -> Result<ContainerInfo> {
        self.inner.engine.inspect_container(&self.inner.id).await
    }

    /// Relays the container's main process to the streams it was created
    /// with, returning when the process's output ends or the container stops.
    pub async fn attach(&self) -> Result<()> {
        let stdin = self.take_stdin();
        let stdout = self.stdout();
        let stderr = self.stderr();

        let attach = AttachSpec {
            stdin: stdin.is_some(),
            stdout: stdout.is_some(),
            stderr: stderr.is_some(),
            logs: true,
        };
        let conn = self
            .inner
            .engine
            .attach_container(&self.inner.id, attach, self.tty())
            .await?;

        let binding = StreamBinding {
            stdin,
            stdout,
            stderr,
            tty: self.tty(),
        };
        hold_hijacked_connection(conn, binding, self.terminal(), self.inner.scope.child_token())
            .await
            .map(|_| ())
    }

    pub async fn monitor_tty_size(&self) -> Result<TtyMonitor> {
        tty::monitor_tty_size(
            self.inner.engine.clone(),
            ResizeTarget::Container(self.inner.id.clone()),
            self.terminal(),
            &self.inner.scope,
        )
        .await
    }

    /// Moves the deadline to `limit` from now.
    pub fn set_time_limit(&self, limit: Duration) {
        self.inner.deadline.send_replace(deadline_after(limit));
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.inner.deadline_exceeded.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> ContainerState {
        *self.inner.state.lock()
    }

    /// The settings the container was created from.
    pub fn options(&self) -> &ContainerSpec {
        &self.inner.spec
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.inner.env
    }

    pub fn gpu_devices(&self) -> Vec<usize> {
        self.inner.leases.lock().iter().map(GpuLease::device).collect()
    }

    pub fn tty(&self) -> bool {
        self.inner.spec.tty
    }

    pub(crate) fn engine(&self) -> &Arc<dyn EngineClient> {
        &self.inner.engine
    }

    pub(crate) fn scope(&self) -> &CancellationToken {
        &self.inner.scope
    }

    pub(crate) fn terminal(&self) -> Arc<dyn Terminal> {
        self.inner.terminal.clone()
    }

    pub(crate) fn has_stdin(&self) -> bool {
        self.inner.stdin.lock().is_some()
    }

    /// The container's stdin can only be consumed by one session.
    pub(crate) fn take_stdin(&self) -> Option<InputStream> {
        self.inner.stdin.lock().take()
    }

    pub(crate) fn stdout(&self) -> Option<OutputStream> {
        self.inner
            .stdout
            .clone()
            .map(|s| Box::new(s) as OutputStream)
    }

    pub(crate) fn stderr(&self) -> Option<OutputStream> {
        self.inner
            .stderr
            .clone()
            .map(|s| Box::new(s) as OutputStream)
    }
}

#[cfg(unix)]
impl Container {
    /// Relays the usual termination and user signals received by this process
    /// to the container until the returned handle is dropped.
    pub fn forward_all_signals(&self) -> Result<super::signals::SignalForwarder> {
        super::signals::forward_all_signals(self.clone())
    }
}
