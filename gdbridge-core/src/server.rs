//! Server handle.
//!
//! Runs the accept loop in a background thread. Clients are served one at a
//! time; when a session ends the server goes back to accepting.

use crate::board::BoardHandle;
use crate::config::ServerConfig;
use crate::control::{Cancel, ControlFlags, Pacer, Poller, SleepPacer};
use crate::events::{EventSink, ServerEvent};
use crate::protocol::Framer;
use crate::session::{Session, SessionEnd};
use crate::target::Board;
use crate::transport::{Listener, SocketListener};
use anyhow::{Context as _, Result};
use crossbeam_channel::Receiver;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

/// Lifecycle of the server thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for a client.
    Accepting,
    /// Serving a client.
    Connected,
    /// A detach was requested and the current client is being dropped.
    Detaching,
    /// The server is stopping or has stopped.
    ShuttingDown,
}

#[derive(Clone)]
struct SharedState(Arc<Mutex<ServerState>>);

impl SharedState {
    fn get(&self) -> ServerState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `ShuttingDown` is final and is never overwritten.
    fn set(&self, state: ServerState) {
        let mut current = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != ServerState::ShuttingDown {
            *current = state;
        }
    }

    /// Move to `Detaching`, but only away from `Connected`.
    fn begin_detach(&self) {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ServerState::Connected {
            *state = ServerState::Detaching;
        }
    }
}

/// A handle to the GDB server running in a background thread.
pub struct GdbServer {
    control: Arc<ControlFlags>,
    board: BoardHandle,
    state: SharedState,
    events: Receiver<ServerEvent>,
    local_addr: Option<SocketAddr>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl GdbServer {
    /// Bind the configured socket and start serving `board`.
    pub fn start(config: ServerConfig, board: Box<dyn Board>) -> Result<Self> {
        let listener = SocketListener::bind(&config)
            .with_context(|| format!("Failed to bind {}", config.bind_address()))?;
        let pacer = SleepPacer::new(config.poll_interval());
        Self::with_listener(config, Box::new(listener), board, Box::new(pacer))
    }

    /// Start serving clients from any listener, pausing with `pacer` between
    /// polls.
    pub fn with_listener(
        config: ServerConfig,
        listener: Box<dyn Listener>,
        board: Box<dyn Board>,
        pacer: Box<dyn Pacer>,
    ) -> Result<Self> {
        config.validate()?;
        let control = Arc::new(ControlFlags::new());
        let board = BoardHandle::new(board);
        let state = SharedState(Arc::new(Mutex::new(ServerState::Accepting)));
        let (sink, events) = EventSink::new();
        let local_addr = listener.local_addr();

        let worker = Worker {
            listener,
            board: board.clone(),
            state: state.clone(),
            events: sink,
            poller: Poller::new(Arc::clone(&control), pacer),
            packet_size: config.packet_size,
        };
        let thread_handle = thread::Builder::new()
            .name("gdb-server".into())
            .spawn(move || worker.serve())
            .context("Failed to spawn server thread")?;

        match local_addr {
            Some(addr) => log::info!("GDB server listening on {addr}"),
            None => log::info!("GDB server started"),
        }

        Ok(Self { control, board, state, events, local_addr, thread_handle: Some(thread_handle) })
    }

    /// Subscribe to server events.
    pub fn events(&self) -> Receiver<ServerEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Swap the board for the next command. Returns the previous board.
    ///
    /// A command already running against the old board completes first.
    pub fn set_board(&self, board: Box<dyn Board>) -> Box<dyn Board> {
        self.board.replace(board)
    }

    /// Drop the current client, if any. The server keeps accepting.
    pub fn detach(&self) {
        log::info!("Detach requested");
        self.state.begin_detach();
        self.control.request_detach();
    }

    /// Stop the server. Returns at once; use [`Self::join`] to wait.
    pub fn shutdown(&self) {
        log::info!("Shutdown requested");
        self.state.set(ServerState::ShuttingDown);
        self.control.request_shutdown();
    }

    /// Wait for the server thread to exit. Blocks until [`Self::shutdown`]
    /// has been called.
    pub fn join(mut self) -> Result<()> {
        self.wait()
    }

    fn wait(&mut self) -> Result<()> {
        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| anyhow::anyhow!("Server thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for GdbServer {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.control.request_shutdown();
            if let Err(e) = self.wait() {
                log::error!("{e:#}");
            }
        }
    }
}

/// Everything the server thread owns.
struct Worker {
    listener: Box<dyn Listener>,
    board: BoardHandle,
    state: SharedState,
    events: EventSink,
    poller: Poller,
    packet_size: usize,
}

impl Worker {
    fn serve(mut self) {
        self.events.send(ServerEvent::Listening(self.listener.local_addr()));

        loop {
            if self.poller.control().is_shutdown() {
                break;
            }
            self.state.set(ServerState::Accepting);

            let transport = match self.listener.accept() {
                Ok(Some(transport)) => transport,
                Ok(None) => {
                    self.poller.pause();
                    continue;
                }
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    self.poller.pause();
                    continue;
                }
            };

            // Detach requests only apply to a client that is already connected.
            self.poller.control().clear_detach();
            let peer = transport.peer();
            log::info!("Client connected: {peer}");
            self.state.set(ServerState::Connected);
            self.events.send(ServerEvent::ClientConnected(peer.clone()));

            let framer = Framer::new(transport).with_payload_limit(self.packet_size);
            let end = self.serve_client(framer);
            self.end_session(peer, &end);
        }

        self.state.set(ServerState::ShuttingDown);
        log::info!("GDB server stopped");
        self.events.send(ServerEvent::Stopped);
    }

    /// Log how a session ended and move into `Detaching` when the client
    /// leaves through a detach, whoever asked for it.
    fn end_session(&self, peer: String, end: &Result<SessionEnd>) {
        match end {
            Ok(SessionEnd::Cancelled(Cancel::Shutdown)) => {
                log::info!("Dropping client {peer} for shutdown");
            }
            Ok(end) => log::info!("Client {peer} finished: {end:?}"),
            Err(e) => log::error!("Session with {peer} failed: {e:#}"),
        }
        if matches!(end, Ok(SessionEnd::Detached | SessionEnd::Cancelled(Cancel::Detach))) {
            self.state.set(ServerState::Detaching);
        }
        self.events.send(ServerEvent::ClientDetached(peer));
    }

    fn serve_client(&mut self, framer: Framer) -> Result<SessionEnd> {
        let mut session = Session::new(
            framer,
            self.board.clone(),
            &mut self.poller,
            self.events.clone(),
            self.packet_size,
        );
        let end = session.run();
        session.close();
        end
    }
}
