//! Continue-until-halt loop.
//!
//! `c` is answered only once the target stops, yet the client must be able to
//! break in with `0x03` and the server must honour detach and shutdown while
//! the target runs. The loop therefore polls: client input, then target state,
//! then the active exception, pausing between rounds.

use super::signal::{signal_for, Exception, Signal};
use super::DebugManager;
use crate::board::BoardHandle;
use crate::control::{Cancel, Poller};
use crate::protocol::Framer;
use anyhow::{Context, Result};

/// How a resume ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The target stopped. The signal goes into the stop reply.
    Stopped(Signal),
    /// A detach or shutdown request arrived. No stop reply is sent and the
    /// target keeps running.
    Cancelled(Cancel),
}

/// One continue request in flight.
pub struct ResumeLoop<'a> {
    framer: &'a mut Framer,
    board: &'a BoardHandle,
    poller: &'a mut Poller,
    debug: DebugManager,
}

impl<'a> ResumeLoop<'a> {
    pub fn new(framer: &'a mut Framer, board: &'a BoardHandle, poller: &'a mut Poller) -> Self {
        Self { framer, board, poller, debug: DebugManager::new() }
    }

    /// Resume the target and wait until it stops or the wait is cancelled.
    ///
    /// The transport reads without blocking while polling and is switched back
    /// to blocking before this returns, also on error.
    pub fn run(mut self) -> Result<ResumeOutcome> {
        self.debug.resume(self.board.lock().target())?;

        self.framer.set_blocking(false)?;
        let outcome = self.poll();
        self.framer.set_blocking(true)?;

        if let Ok(ResumeOutcome::Stopped(signal)) = &outcome {
            log::debug!("Target stopped with signal {}", signal.code());
        }
        outcome
    }

    fn poll(&mut self) -> Result<ResumeOutcome> {
        loop {
            if let Some(cancel) = self.poller.cancelled() {
                log::info!("Abandoning continue ({cancel:?}), target left running");
                return Ok(ResumeOutcome::Cancelled(cancel));
            }

            if self.framer.poll_interrupt().context("Failed to poll client for break-in")? {
                log::debug!("Client break-in, halting target");
                self.debug.halt(self.board.lock().target())?;
                return Ok(ResumeOutcome::Stopped(Signal::Trap));
            }

            if let Some(signal) = self.check_target()? {
                return Ok(ResumeOutcome::Stopped(signal));
            }

            self.poller.pause();
        }
    }

    /// One target poll, under the board lock.
    ///
    /// A core that is still running is halted briefly to read its exception
    /// number. Only a hard fault ends the wait. Any other exception, an
    /// interrupt handler that hit a breakpoint included, is resumed.
    fn check_target(&mut self) -> Result<Option<Signal>> {
        let mut slot = self.board.lock();
        let target = slot.target();

        if self.debug.status(target)?.is_halted() {
            return Ok(Some(Signal::Trap));
        }

        self.debug.halt(target)?;
        let exception = self.debug.exception(target)?;
        if exception == Exception::HardFault {
            log::warn!("Target entered HardFault");
            return Ok(Some(signal_for(exception)));
        }
        self.debug.resume(target)?;
        Ok(None)
    }
}
