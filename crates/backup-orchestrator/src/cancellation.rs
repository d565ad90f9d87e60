//! Operator interrupts and per-task stop requests.
//!

use core::sync::atomic::{AtomicBool, Ordering};
use std::{io, sync::Arc};

use signal_hook::consts::{SIGINT, SIGTERM};

/// A request to stop work early.
///
/// A child created with [`Cancellation::child`] is cancelled when either it or its parent is,
/// which lets the orchestrator stop one timed-out producer without touching its siblings.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl Cancellation {
    /// Create a new cancellation that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a child that also observes this cancellation.
    pub fn child(&self) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.own)),
        }
    }

    /// Request a stop.
    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    /// If a stop has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::SeqCst))
    }

    /// Cancel this instance when the process receives `SIGINT` or `SIGTERM`.
    ///
    /// The signals no longer terminate the process once installed.
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.own))?;
        }

        Ok(())
    }
}
