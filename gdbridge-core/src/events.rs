//! Server events for embedding applications.
//!
//! Events go out over a bounded channel. A full or abandoned channel never
//! stalls the server: the event is dropped and the drop is logged.

use crate::debug::Signal;
use crate::flash::FlashingProgress;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::net::SocketAddr;

const EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Listening(Option<SocketAddr>),
    ClientConnected(String),
    ClientDetached(String),
    /// The target stopped and a stop reply was sent.
    Halted(Signal),
    FlashProgress { written: usize, total: usize },
    FlashDone,
    FlashFailed(String),
    Stopped,
}

/// Sending side of the event channel.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<ServerEvent>,
}

impl EventSink {
    pub fn new() -> (Self, Receiver<ServerEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn send(&self, event: ServerEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => log::debug!("Event channel full, dropping {event:?}"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Map flash progress onto server events.
    pub fn flash_progress(&self, progress: FlashingProgress) {
        match progress {
            FlashingProgress::Progress { written, total } => {
                self.send(ServerEvent::FlashProgress { written, total });
            }
            FlashingProgress::Finished => self.send(ServerEvent::FlashDone),
            FlashingProgress::Failed(reason) => self.send(ServerEvent::FlashFailed(reason)),
            FlashingProgress::Erasing | FlashingProgress::Programming { .. } => {}
        }
    }
}
