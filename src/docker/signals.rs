use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::container::Container;
use crate::error::Result;

const FORWARDED: &[(&str, fn() -> SignalKind)] = &[
    ("SIGINT", SignalKind::interrupt),
    ("SIGTERM", SignalKind::terminate),
    ("SIGHUP", SignalKind::hangup),
    ("SIGQUIT", SignalKind::quit),
    ("SIGUSR1", SignalKind::user_defined1),
    ("SIGUSR2", SignalKind::user_defined2),
];

/// Stops forwarding when dropped.
#[derive(Debug)]
pub struct SignalForwarder {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub(crate) fn forward_all_signals(container: Container) -> Result<SignalForwarder> {
    let mut listeners: Vec<(&'static str, Signal)> = Vec::with_capacity(FORWARDED.len());
    for &(name, kind) in FORWARDED {
        listeners.push((name, signal(kind())?));
    }

    let tasks = listeners
        .into_iter()
        .map(|(name, mut listener)| {
            let container = container.clone();
            tokio::spawn(async move {
                let scope = container.scope().clone();
                loop {
                    tokio::select! {
                        _ = scope.cancelled() => break,
                        received = listener.recv() => {
                            if received.is_none() {
                                break;
                            }
                            debug!("Forwarding {} to container {}", name, container.id());
                            if let Err(e) = container.kill_with_signal(name).await {
                                warn!("Failed to forward {} to container {}: {}", name, container.id(), e);
                            }
                        }
                    }
                }
            })
        })
        .collect();

    Ok(SignalForwarder { tasks })
}
