//! Cancellation flags and poll pacing shared by the accept loop, the packet
//! reader and the resume loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Why a wait was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancel {
    /// Drop the current client and go back to accepting.
    Detach,
    /// Stop the server thread.
    Shutdown,
}

/// Detach and shutdown requests raised from outside the server thread.
#[derive(Debug, Default)]
pub struct ControlFlags {
    detach: AtomicBool,
    shutdown: AtomicBool,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_detach(&self) {
        self.detach.store(true, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// The pending request, shutdown taking priority over detach.
    pub fn pending(&self) -> Option<Cancel> {
        if self.shutdown.load(Ordering::SeqCst) {
            Some(Cancel::Shutdown)
        } else if self.detach.load(Ordering::SeqCst) {
            Some(Cancel::Detach)
        } else {
            None
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Called once a detach has been carried out.
    pub fn clear_detach(&self) {
        self.detach.store(false, Ordering::SeqCst);
    }
}

/// Waits between two polls.
pub trait Pacer: Send {
    fn pause(&mut self);
}

/// Sleeps for a fixed interval.
pub struct SleepPacer {
    interval: Duration,
}

impl SleepPacer {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Pacer for SleepPacer {
    fn pause(&mut self) {
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
    }
}

/// Yields the thread without sleeping.
pub struct YieldPacer;

impl Pacer for YieldPacer {
    fn pause(&mut self) {
        std::thread::yield_now();
    }
}

/// The cancellation check and the pacing used at every suspension point.
pub struct Poller {
    control: Arc<ControlFlags>,
    pacer: Box<dyn Pacer>,
}

impl Poller {
    pub fn new(control: Arc<ControlFlags>, pacer: Box<dyn Pacer>) -> Self {
        Self { control, pacer }
    }

    pub fn cancelled(&self) -> Option<Cancel> {
        self.control.pending()
    }

    pub fn pause(&mut self) {
        self.pacer.pause();
    }

    pub fn control(&self) -> &Arc<ControlFlags> {
        &self.control
    }
}
