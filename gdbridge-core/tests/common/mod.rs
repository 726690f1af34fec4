//! A minimal RSP client for driving the server over loopback TCP.

#![allow(dead_code)]

use gdbridge_core::protocol::{checksum, Frame};
use gdbridge_core::{GdbServer, ServerConfig, SimBoard, SimMonitor, TargetState};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

pub fn test_config() -> ServerConfig {
    ServerConfig { port: 0, poll_interval_ms: 1, ..ServerConfig::default() }
}

/// Start a server on an ephemeral port serving a fresh simulated board.
pub fn start_sim() -> (GdbServer, SimMonitor, SocketAddr) {
    let sim = SimBoard::new();
    let monitor = sim.monitor();
    let server = GdbServer::start(test_config(), Box::new(sim)).expect("server starts");
    let addr = server.local_addr().expect("bound to a socket");
    (server, monitor, addr)
}

/// Wait until the simulated core reports `state`.
pub fn wait_for_state(monitor: &SimMonitor, state: TargetState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while monitor.state() != state {
        assert!(Instant::now() < deadline, "target never reached {state:?}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub struct RspClient {
    stream: TcpStream,
}

impl RspClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to server");
        stream.set_read_timeout(Some(Duration::from_secs(5))).expect("set read timeout");
        Self { stream }
    }

    pub fn send(&mut self, payload: &[u8]) {
        self.send_raw(&Frame::new(payload).encode());
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write to server");
    }

    /// Next byte, or `None` once the server closed the connection.
    pub fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => None,
            Ok(_) => Some(byte[0]),
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted) => {
                None
            }
            Err(e) => panic!("read from server failed: {e}"),
        }
    }

    /// Read one packet without acknowledging it. Bytes in front of the `$`
    /// (acknowledgements) are skipped.
    pub fn read_packet_unacked(&mut self) -> Vec<u8> {
        loop {
            match self.read_byte() {
                Some(b'$') => break,
                Some(_) => {}
                None => panic!("connection closed while waiting for a packet"),
            }
        }
        let mut payload = Vec::new();
        loop {
            match self.read_byte() {
                Some(b'#') => break,
                Some(byte) => payload.push(byte),
                None => panic!("connection closed inside a packet"),
            }
        }
        let digits = [self.read_byte(), self.read_byte()];
        let expected = format!("{:02x}", checksum(&payload));
        assert_eq!(digits, [Some(expected.as_bytes()[0]), Some(expected.as_bytes()[1])]);
        payload
    }

    pub fn read_packet(&mut self) -> Vec<u8> {
        let payload = self.read_packet_unacked();
        self.send_raw(b"+");
        payload
    }

    pub fn request(&mut self, payload: &[u8]) -> Vec<u8> {
        self.send(payload);
        self.read_packet()
    }

    pub fn request_str(&mut self, payload: &str) -> String {
        String::from_utf8(self.request(payload.as_bytes())).expect("reply is text")
    }

    /// Everything the server sends until it closes the connection.
    pub fn read_to_close(&mut self) -> Vec<u8> {
        let mut received = Vec::new();
        while let Some(byte) = self.read_byte() {
            received.push(byte);
        }
        received
    }
}
