//! Local terminal handling: raw mode and size queries.

use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub height: u16,
    pub width: u16,
}

impl TerminalSize {
    pub fn is_zero(&self) -> bool {
        self.height == 0 && self.width == 0
    }
}

pub trait Terminal: Send + Sync {
    fn is_terminal(&self) -> bool;

    fn set_raw(&self) -> Result<()>;

    fn restore(&self);

    fn size(&self) -> Option<TerminalSize>;
}

/// The process's own terminal. Raw mode is skipped when `NORAW` is set or
/// stdout is not a terminal.
#[derive(Debug, Default)]
pub struct HostTerminal {
    raw: AtomicBool,
}

impl HostTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn Terminal> {
        Arc::new(Self::new())
    }
}

impl Terminal for HostTerminal {
    fn is_terminal(&self) -> bool {
        std::io::stdout().is_terminal()
    }

    fn set_raw(&self) -> Result<()> {
        if std::env::var_os("NORAW").is_some() || !self.is_terminal() {
            return Ok(());
        }
        enable_raw_mode()?;
        self.raw.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self) {
        if self.raw.swap(false, Ordering::SeqCst) {
            if let Err(e) = disable_raw_mode() {
                debug!("Failed to restore terminal: {}", e);
            }
        }
    }

    fn size(&self) -> Option<TerminalSize> {
        if !self.is_terminal() {
            return None;
        }
        match terminal::size() {
            Ok((cols, rows)) => Some(TerminalSize {
                height: rows,
                width: cols,
            }),
            Err(e) => {
                debug!("Error getting terminal size: {}", e);
                None
            }
        }
    }
}

/// Restores the terminal at most once, no matter how many of the relay's
/// tasks reach their exit path.
pub(crate) struct RestoreOnce {
    terminal: Arc<dyn Terminal>,
    armed: bool,
    done: AtomicBool,
}

impl RestoreOnce {
    pub(crate) fn new(terminal: Arc<dyn Terminal>, armed: bool) -> Self {
        Self {
            terminal,
            armed,
            done: AtomicBool::new(false),
        }
    }

    pub(crate) fn restore(&self) {
        if self.armed && !self.done.swap(true, Ordering::SeqCst) {
            self.terminal.restore();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTerminal;
    use super::*;

    #[test]
    fn restore_once_fires_a_single_time() {
        let term = Arc::new(FakeTerminal::default());
        let guard = RestoreOnce::new(term.clone(), true);

        guard.restore();
        guard.restore();

        assert_eq!(term.restore_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unarmed_restore_is_a_noop() {
        let term = Arc::new(FakeTerminal::default());
        RestoreOnce::new(term.clone(), false).restore();
        assert_eq!(term.restore_calls.load(Ordering::SeqCst), 0);
    }
}
