//! Cooperative run control shared by every stack of one run.

use std::sync::atomic::{AtomicBool, Ordering};

/// Flags consulted by admission control. Nothing is interrupted; layers
/// simply stop starting new work while paused or cancelled.
#[derive(Debug, Default)]
pub struct RunControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True when new work may be admitted.
    pub fn admits(&self) -> bool {
        !self.is_paused() && !self.is_cancelled()
    }
}
