//! RSP carried over WebSocket binary messages.

use super::{is_disconnect, Transport};
use crate::error::{RspError, RspResult};
use std::io::ErrorKind;
use std::net::TcpStream;
use tungstenite::handshake::HandshakeError;
use tungstenite::{Message, WebSocket};

/// Server side of a WebSocket connection.
///
/// Message boundaries carry no meaning: payloads of every incoming text or
/// binary message are concatenated into one byte stream.
pub struct WebSocketTransport {
    socket: WebSocket<TcpStream>,
    pending: Vec<u8>,
    blocking: bool,
    peer: String,
}

impl WebSocketTransport {
    /// Run the server handshake on a freshly accepted stream.
    pub fn accept(stream: TcpStream) -> RspResult<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| format!("ws://{addr}"));

        let socket = match tungstenite::accept(stream) {
            Ok(socket) => socket,
            Err(HandshakeError::Failure(e)) => return Err(e.into()),
            Err(HandshakeError::Interrupted(_)) => {
                return Err(RspError::Io(std::io::Error::new(
                    ErrorKind::WouldBlock,
                    "WebSocket handshake interrupted",
                )))
            }
        };
        log::debug!("WebSocket handshake completed with {peer}");

        Ok(Self { socket, pending: Vec::new(), blocking: true, peer })
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

impl Transport for WebSocketTransport {
    fn read(&mut self, buf: &mut [u8]) -> RspResult<usize> {
        if !self.pending.is_empty() {
            return Ok(self.drain_pending(buf));
        }

        match self.socket.read() {
            Ok(Message::Binary(data)) => self.pending.extend_from_slice(&data),
            Ok(Message::Text(text)) => self.pending.extend_from_slice(text.as_bytes()),
            Ok(Message::Close(_)) => return Err(RspError::ConnectionClosed),
            // Control frames are answered by tungstenite itself.
            Ok(_) => return Ok(0),
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) =>
            {
                return Ok(0)
            }
            Err(tungstenite::Error::Io(e)) if is_disconnect(e.kind()) => {
                return Err(RspError::ConnectionClosed)
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                return Err(RspError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        }

        Ok(self.drain_pending(buf))
    }

    fn write_all(&mut self, data: &[u8]) -> RspResult<()> {
        let was_blocking = self.blocking;
        if !was_blocking {
            self.set_blocking(true)?;
        }
        let result = self.socket.send(Message::Binary(data.to_vec()));
        if !was_blocking {
            self.set_blocking(false)?;
        }

        match result {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Err(RspError::ConnectionClosed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_blocking(&mut self, blocking: bool) -> RspResult<()> {
        self.socket.get_mut().set_nonblocking(!blocking)?;
        self.blocking = blocking;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
