//! In-process transport over crossbeam channels.
//!
//! Lets a GDB front end living in the same process (or a test harness) talk
//! to the server without a socket.

use super::{Listener, Transport};
use crate::error::{RspError, RspResult};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::net::SocketAddr;

/// One end of an in-process byte pipe.
pub struct ChannelTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    blocking: bool,
    name: String,
}

impl ChannelTransport {
    /// Create two connected ends. Bytes written to one are read from the other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = crossbeam_channel::unbounded();
        let (b_tx, b_rx) = crossbeam_channel::unbounded();
        (
            Self { tx: a_tx, rx: b_rx, pending: Vec::new(), blocking: true, name: "channel:a".into() },
            Self { tx: b_tx, rx: a_rx, pending: Vec::new(), blocking: true, name: "channel:b".into() },
        )
    }

    /// Read until `count` bytes arrived or the peer hung up.
    pub fn read_exact_bytes(&mut self, count: usize) -> RspResult<Vec<u8>> {
        let mut out = Vec::with_capacity(count);
        let mut buf = vec![0u8; count];
        while out.len() < count {
            let n = self.read(&mut buf[..count - out.len()])?;
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Read one complete `$...#xx` packet, skipping any acknowledgement bytes
    /// in front of it. Returns the payload.
    pub fn read_packet(&mut self) -> RspResult<Vec<u8>> {
        let mut byte = [0u8; 1];
        loop {
            self.read_exact_into(&mut byte)?;
            if byte[0] == b'$' {
                break;
            }
        }
        let mut payload = Vec::new();
        loop {
            self.read_exact_into(&mut byte)?;
            if byte[0] == b'#' {
                break;
            }
            payload.push(byte[0]);
        }
        let _checksum = self.read_exact_bytes(2)?;
        Ok(payload)
    }

    fn read_exact_into(&mut self, buf: &mut [u8]) -> RspResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read(&mut buf[filled..])?;
        }
        Ok(())
    }
}

impl Transport for ChannelTransport {
    fn read(&mut self, buf: &mut [u8]) -> RspResult<usize> {
        if self.pending.is_empty() {
            let chunk = if self.blocking {
                self.rx.recv().map_err(|_| RspError::ConnectionClosed)?
            } else {
                match self.rx.try_recv() {
                    Ok(chunk) => chunk,
                    Err(TryRecvError::Empty) => return Ok(0),
                    Err(TryRecvError::Disconnected) => return Err(RspError::ConnectionClosed),
                }
            };
            self.pending = chunk;
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> RspResult<()> {
        self.tx.send(data.to_vec()).map_err(|_| RspError::ConnectionClosed)
    }

    fn set_blocking(&mut self, blocking: bool) -> RspResult<()> {
        self.blocking = blocking;
        Ok(())
    }

    fn close(&mut self) {
        // Swapping in a dead channel drops our sender so the peer sees the hang-up.
        let (tx, _) = crossbeam_channel::bounded(0);
        self.tx = tx;
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

/// Listener fed with server-side channel ends by the embedding code.
pub struct ChannelListener {
    incoming: Receiver<ChannelTransport>,
}

impl ChannelListener {
    /// Returns the listener and a connector. Every call of the connector yields
    /// the client end of a new connection.
    pub fn new() -> (Self, ChannelConnector) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { incoming: rx }, ChannelConnector { outgoing: tx })
    }
}

impl Listener for ChannelListener {
    fn accept(&mut self) -> RspResult<Option<Box<dyn Transport>>> {
        match self.incoming.try_recv() {
            Ok(transport) => Ok(Some(Box::new(transport))),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Client-side factory for [`ChannelListener`] connections.
#[derive(Clone)]
pub struct ChannelConnector {
    outgoing: Sender<ChannelTransport>,
}

impl ChannelConnector {
    pub fn connect(&self) -> RspResult<ChannelTransport> {
        let (server, client) = ChannelTransport::pair();
        self.outgoing.send(server).map_err(|_| RspError::ConnectionClosed)?;
        Ok(client)
    }
}
