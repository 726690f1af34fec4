//! gdbridge core: a GDB remote serial protocol server for microcontrollers.
//!
//! A client (GDB, or anything speaking RSP over TCP or WebSocket) talks to a
//! [`GdbServer`], which drives a [`Board`]: core control and memory through
//! [`Target`], flash programming through [`Flash`]. Boards exist for probe-rs
//! sessions (feature `hardware`) and for an in-memory simulation.

pub mod board;
pub mod config;
pub mod control;
pub mod debug;
pub mod error;
pub mod events;
pub mod flash;
pub mod memory;
#[cfg(feature = "hardware")]
pub mod probe;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sim;
pub mod target;
pub mod transport;
pub mod xfer;

// Re-export commonly used types
pub use board::BoardHandle;
pub use config::{ServerConfig, TransportKind};
pub use control::{Cancel, ControlFlags, Pacer, SleepPacer, YieldPacer};
pub use debug::{BreakpointManager, DebugManager, Signal};
pub use error::{RspError, RspResult};
pub use events::ServerEvent;
pub use flash::{FlashPipeline, FlashingProgress};
pub use memory::MemoryManager;
#[cfg(feature = "hardware")]
pub use probe::{ProbeInfo, ProbeManager, ProbeRsBoard};
pub use server::{GdbServer, ServerState};
pub use session::{Session, SessionEnd};
pub use sim::{RunScript, SimBoard, SimMonitor};
pub use target::{Board, CoreRegister, Flash, Target, TargetState};
pub use transport::{ChannelConnector, ChannelListener, ChannelTransport, Listener, Transport};
