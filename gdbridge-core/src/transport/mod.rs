//! Client connection transports.
//!
//! A [`Listener`] hands out one [`Transport`] per accepted client. The session
//! only sees the trait, so raw TCP, WebSocket and in-process channels are
//! interchangeable.

pub mod channel;
pub mod websocket;

pub use channel::{ChannelConnector, ChannelListener, ChannelTransport};
pub use websocket::WebSocketTransport;

use crate::config::{ServerConfig, TransportKind};
use crate::error::{RspError, RspResult};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

/// A byte stream to one connected client.
pub trait Transport: Send {
    /// Read available bytes into `buf`.
    ///
    /// Returns `Ok(0)` when nothing is available yet (non-blocking mode) and
    /// [`RspError::ConnectionClosed`] once the client is gone.
    fn read(&mut self, buf: &mut [u8]) -> RspResult<usize>;

    fn write_all(&mut self, data: &[u8]) -> RspResult<()>;

    /// Switch between blocking and non-blocking reads.
    fn set_blocking(&mut self, blocking: bool) -> RspResult<()>;

    fn close(&mut self);

    /// Human-readable peer name for logging.
    fn peer(&self) -> String;
}

/// Source of client connections.
pub trait Listener: Send {
    /// Poll for a new client. Returns `Ok(None)` when no client is waiting.
    fn accept(&mut self) -> RspResult<Option<Box<dyn Transport>>>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// RSP over a plain TCP connection.
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> RspResult<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        Ok(Self { stream, peer })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> RspResult<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(RspError::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) if is_disconnect(e.kind()) => Err(RspError::ConnectionClosed),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> RspResult<()> {
        match self.stream.write_all(data).and_then(|()| self.stream.flush()) {
            Ok(()) => Ok(()),
            Err(e) if is_disconnect(e.kind()) => Err(RspError::ConnectionClosed),
            Err(e) => Err(e.into()),
        }
    }

    fn set_blocking(&mut self, blocking: bool) -> RspResult<()> {
        self.stream.set_nonblocking(!blocking)?;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

pub(crate) fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

/// TCP listener producing either raw or WebSocket transports.
pub struct SocketListener {
    listener: TcpListener,
    kind: TransportKind,
}

impl SocketListener {
    /// Bind to the configured address. The listener polls without blocking so
    /// the accept loop can observe shutdown requests.
    pub fn bind(config: &ServerConfig) -> RspResult<Self> {
        let listener = TcpListener::bind(config.bind_address())?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, kind: config.transport })
    }
}

impl Listener for SocketListener {
    fn accept(&mut self) -> RspResult<Option<Box<dyn Transport>>> {
        let stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };

        let transport: Box<dyn Transport> = match self.kind {
            TransportKind::Tcp => Box::new(TcpTransport::new(stream)?),
            TransportKind::WebSocket => Box::new(WebSocketTransport::accept(stream)?),
        };
        Ok(Some(transport))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}
