//! Extracts packets from a client transport and writes framed responses.

use super::packet::{Frame, ACK, INTERRUPT, NAK, PACKET_END, PACKET_START};
use crate::control::{Cancel, Poller};
use crate::error::{RspError, RspResult};
use crate::transport::Transport;

const READ_CHUNK: usize = 1024;

/// What arrived from the client.
#[derive(Debug)]
pub enum Inbound {
    Packet(Frame),
    /// A `0x03` break-in outside of a packet.
    Interrupt,
    /// A frame failed validation and was answered with `-`.
    Malformed(RspError),
    /// The wait was abandoned because of a detach or shutdown request.
    Cancelled(Cancel),
}

/// Packet reader/writer over one client connection.
pub struct Framer {
    transport: Box<dyn Transport>,
    rx: Vec<u8>,
    rx_pos: usize,
    last_sent: Vec<u8>,
    awaiting_ack: bool,
    payload_limit: usize,
}

impl Framer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            rx: Vec::new(),
            rx_pos: 0,
            last_sent: Vec::new(),
            awaiting_ack: false,
            payload_limit: usize::MAX,
        }
    }

    /// Reject inbound packets whose payload is longer than `limit` bytes.
    /// The excess is read and discarded, not buffered.
    #[must_use]
    pub fn with_payload_limit(mut self, limit: usize) -> Self {
        self.payload_limit = limit;
        self
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    pub fn set_blocking(&mut self, blocking: bool) -> RspResult<()> {
        self.transport.set_blocking(blocking)
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Wait for the next inbound event.
    ///
    /// While idle the transport is read without blocking so detach and
    /// shutdown requests are noticed within one poll interval. Once a `$`
    /// arrives the rest of the frame is read blocking. The transport is left
    /// in blocking mode on return.
    pub fn read_packet(&mut self, poller: &mut Poller) -> RspResult<Inbound> {
        self.transport.set_blocking(false)?;
        loop {
            if let Some(cancel) = poller.cancelled() {
                self.transport.set_blocking(true)?;
                return Ok(Inbound::Cancelled(cancel));
            }

            let Some(byte) = self.next_byte()? else {
                poller.pause();
                continue;
            };

            match byte {
                PACKET_START => break,
                ACK => self.awaiting_ack = false,
                NAK => self.retransmit()?,
                INTERRUPT => {
                    self.transport.set_blocking(true)?;
                    return Ok(Inbound::Interrupt);
                }
                other => log::trace!("Ignoring stray byte 0x{other:02x} between packets"),
            }
        }

        self.transport.set_blocking(true)?;
        let inbound = match self.read_frame_body()? {
            Ok(frame) => {
                if self.awaiting_ack {
                    log::warn!("No acknowledgement received for the previous response, continuing");
                    self.awaiting_ack = false;
                }
                self.transport.write_all(&[ACK])?;
                log::trace!("<- {}", String::from_utf8_lossy(&frame.payload));
                Inbound::Packet(frame)
            }
            Err(err) => {
                log::warn!("Rejecting packet: {err}");
                self.transport.write_all(&[NAK])?;
                Inbound::Malformed(err)
            }
        };
        Ok(inbound)
    }

    /// Payload and checksum after a `$`. The outer result carries transport
    /// failures, the inner one frame validation failures.
    fn read_frame_body(&mut self) -> RspResult<RspResult<Frame>> {
        let mut payload = Vec::new();
        let mut oversized = false;
        loop {
            let byte = self.next_byte_blocking()?;
            if byte == PACKET_END {
                break;
            }
            if payload.len() < self.payload_limit {
                payload.push(byte);
            } else {
                oversized = true;
            }
        }

        let digits = [self.next_byte_blocking()?, self.next_byte_blocking()?];
        let received = match std::str::from_utf8(&digits)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
        {
            Some(value) => value,
            None => {
                return Ok(Err(RspError::MalformedPacket(format!(
                    "bad checksum digits {:?}",
                    String::from_utf8_lossy(&digits)
                ))))
            }
        };

        if oversized {
            return Ok(Err(RspError::MalformedPacket(format!(
                "payload longer than {} bytes",
                self.payload_limit
            ))));
        }
        Ok(Frame::verify(payload, received))
    }

    /// Frame and send one response, remembering it for retransmission.
    pub fn send_packet(&mut self, payload: &[u8]) -> RspResult<()> {
        let encoded = Frame::new(payload).encode();
        log::trace!("-> {}", String::from_utf8_lossy(payload));
        self.transport.write_all(&encoded)?;
        self.last_sent = encoded;
        self.awaiting_ack = true;
        Ok(())
    }

    /// Drain pending input without blocking. Returns `true` if a break-in
    /// byte was among it. Acknowledgements are consumed, anything else is left
    /// for the packet reader.
    pub fn poll_interrupt(&mut self) -> RspResult<bool> {
        loop {
            if self.rx_pos >= self.rx.len() && !self.fill()? {
                return Ok(false);
            }
            match self.rx[self.rx_pos] {
                INTERRUPT => {
                    self.rx_pos += 1;
                    return Ok(true);
                }
                ACK => {
                    self.awaiting_ack = false;
                    self.rx_pos += 1;
                }
                _ => return Ok(false),
            }
        }
    }

    fn retransmit(&mut self) -> RspResult<()> {
        if self.last_sent.is_empty() {
            log::warn!("Client requested a retransmit but nothing was sent yet");
            return Ok(());
        }
        log::warn!("Client rejected the last response, retransmitting");
        self.transport.write_all(&self.last_sent)
    }

    fn next_byte(&mut self) -> RspResult<Option<u8>> {
        if self.rx_pos >= self.rx.len() && !self.fill()? {
            return Ok(None);
        }
        let byte = self.rx[self.rx_pos];
        self.rx_pos += 1;
        Ok(Some(byte))
    }

    fn next_byte_blocking(&mut self) -> RspResult<u8> {
        loop {
            if let Some(byte) = self.next_byte()? {
                return Ok(byte);
            }
        }
    }

    /// Refill the receive buffer. Returns `false` when no bytes were available.
    fn fill(&mut self) -> RspResult<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.transport.read(&mut chunk)?;
        if n == 0 {
            return Ok(false);
        }
        self.rx.clear();
        self.rx.extend_from_slice(&chunk[..n]);
        self.rx_pos = 0;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlFlags, YieldPacer};
    use crate::transport::ChannelTransport;
    use std::sync::Arc;

    fn setup() -> (Framer, ChannelTransport, Poller, Arc<ControlFlags>) {
        let (server, client) = ChannelTransport::pair();
        let flags = Arc::new(ControlFlags::new());
        let poller = Poller::new(flags.clone(), Box::new(YieldPacer));
        (Framer::new(Box::new(server)), client, poller, flags)
    }

    #[test]
    fn test_reads_packet_and_acks() {
        let (mut framer, mut client, mut poller, _) = setup();
        client.write_all(b"$qSupported#37").unwrap();
        match framer.read_packet(&mut poller).unwrap() {
            Inbound::Packet(frame) => assert_eq!(frame.payload, b"qSupported"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.read_exact_bytes(1).unwrap(), b"+");
    }

    #[test]
    fn test_split_frame_is_reassembled() {
        let (mut framer, mut client, mut poller, _) = setup();
        client.write_all(b"+$m2000").unwrap();
        client.write_all(b"0000,4#").unwrap();
        client.write_all(b"4f").unwrap();
        match framer.read_packet(&mut poller).unwrap() {
            Inbound::Packet(frame) => assert_eq!(frame.payload, b"m20000000,4"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_checksum_is_nakked() {
        let (mut framer, mut client, mut poller, _) = setup();
        client.write_all(b"$g#00").unwrap();
        assert!(matches!(
            framer.read_packet(&mut poller).unwrap(),
            Inbound::Malformed(RspError::ChecksumMismatch { .. })
        ));
        assert_eq!(client.read_exact_bytes(1).unwrap(), b"-");
    }

    #[test]
    fn test_oversized_packet_is_nakked() {
        let (framer, mut client, mut poller, _) = setup();
        let mut framer = framer.with_payload_limit(8);
        client.write_all(b"$M20000000,8:0011223344556677#00").unwrap();
        client.write_all(b"$?#3f").unwrap();

        assert!(matches!(
            framer.read_packet(&mut poller).unwrap(),
            Inbound::Malformed(RspError::MalformedPacket(_))
        ));
        assert_eq!(client.read_exact_bytes(1).unwrap(), b"-");
        match framer.read_packet(&mut poller).unwrap() {
            Inbound::Packet(frame) => assert_eq!(frame.payload, b"?"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_interrupt_outside_packet() {
        let (mut framer, mut client, mut poller, _) = setup();
        client.write_all(&[INTERRUPT]).unwrap();
        assert!(matches!(framer.read_packet(&mut poller).unwrap(), Inbound::Interrupt));
    }

    #[test]
    fn test_cancel_while_idle() {
        let (mut framer, _client, mut poller, flags) = setup();
        flags.request_detach();
        assert!(matches!(
            framer.read_packet(&mut poller).unwrap(),
            Inbound::Cancelled(Cancel::Detach)
        ));
    }

    #[test]
    fn test_nak_triggers_retransmit() {
        let (mut framer, mut client, mut poller, _) = setup();
        framer.send_packet(b"OK").unwrap();
        assert_eq!(client.read_packet().unwrap(), b"OK");
        client.write_all(b"-").unwrap();
        client.write_all(b"+$?#3f").unwrap();
        assert!(matches!(framer.read_packet(&mut poller).unwrap(), Inbound::Packet(_)));
        assert_eq!(client.read_packet().unwrap(), b"OK");
    }

    #[test]
    fn test_missing_ack_is_tolerated() {
        let (mut framer, mut client, mut poller, _) = setup();
        framer.send_packet(b"OK").unwrap();
        client.write_all(b"$?#3f").unwrap();
        match framer.read_packet(&mut poller).unwrap() {
            Inbound::Packet(frame) => assert_eq!(frame.payload, b"?"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_poll_interrupt_consumes_acks_only() {
        let (mut framer, mut client, _, _) = setup();
        framer.set_blocking(false).unwrap();
        assert!(!framer.poll_interrupt().unwrap());
        client.write_all(b"++").unwrap();
        assert!(!framer.poll_interrupt().unwrap());
        client.write_all(&[INTERRUPT]).unwrap();
        assert!(framer.poll_interrupt().unwrap());
    }

    #[test]
    fn test_closed_connection_surfaces() {
        let (mut framer, client, mut poller, _) = setup();
        drop(client);
        assert!(matches!(framer.read_packet(&mut poller), Err(RspError::ConnectionClosed)));
    }
}
