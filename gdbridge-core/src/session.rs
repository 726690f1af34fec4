//! Session management module.
//!
//! One session serves one connected client: it reads packets, dispatches
//! them against the current board and writes the replies, until the client
//! leaves or the server asks it to stop.

use crate::board::BoardHandle;
use crate::control::{Cancel, Poller};
use crate::debug::{BreakpointManager, DebugManager, ResumeLoop, ResumeOutcome, Signal};
use crate::error::RspError;
use crate::events::{EventSink, ServerEvent};
use crate::flash::FlashPipeline;
use crate::memory::MemoryManager;
use crate::protocol::{Command, Framer, Inbound, Query, XferWindow};
use crate::xfer;
use anyhow::Result;

const REPLY_OK: &[u8] = b"OK";
const REPLY_ERROR: &[u8] = b"E01";
const REPLY_BAD_ANNEX: &[u8] = b"E00";
const REPLY_BAD_OFFSET: &[u8] = b"E16";

const MONITOR_HELP: &str = "\
Monitor commands:
  reset  reset the target and halt at the reset vector
  halt   halt the target
  help   show this text
";

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent `D`.
    Detached,
    /// The client sent `k`.
    Killed,
    /// The client hung up.
    ClientClosed,
    /// The server asked the session to stop.
    Cancelled(Cancel),
}

/// Result of dispatching one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(Vec<u8>),
    /// Nothing is sent back; the client's own timeout deals with it.
    Unsupported,
    Detach,
    Kill,
    Cancelled(Cancel),
}

impl Outcome {
    fn reply(payload: impl Into<Vec<u8>>) -> Self {
        Self::Reply(payload.into())
    }

    /// Turn a failed collaborator call into the `E01` reply.
    fn or_error(result: Result<Vec<u8>>) -> Self {
        match result {
            Ok(payload) => Self::Reply(payload),
            Err(e) => {
                log::error!("{e:#}");
                Self::reply(REPLY_ERROR)
            }
        }
    }
}

/// State of one client connection.
pub struct Session<'a> {
    framer: Framer,
    board: BoardHandle,
    poller: &'a mut Poller,
    events: EventSink,
    packet_size: usize,
    flash: FlashPipeline,
    debug: DebugManager,
    memory: MemoryManager,
    breakpoints: BreakpointManager,
}

impl<'a> Session<'a> {
    pub fn new(
        framer: Framer,
        board: BoardHandle,
        poller: &'a mut Poller,
        events: EventSink,
        packet_size: usize,
    ) -> Self {
        Self {
            framer,
            board,
            poller,
            events,
            packet_size,
            flash: FlashPipeline::new(),
            debug: DebugManager::new(),
            memory: MemoryManager::new(),
            breakpoints: BreakpointManager::new(),
        }
    }

    pub fn peer(&self) -> String {
        self.framer.peer()
    }

    /// Serve packets until the session ends.
    ///
    /// Errors are failures the session cannot recover from, such as a target
    /// that stops responding while it runs. The caller drops the client then.
    pub fn run(&mut self) -> Result<SessionEnd> {
        loop {
            let frame = match self.framer.read_packet(self.poller) {
                Ok(Inbound::Packet(frame)) => frame,
                Ok(Inbound::Interrupt) => {
                    log::debug!("Break-in while the target is not running, ignored");
                    continue;
                }
                Ok(Inbound::Malformed(_)) => continue,
                Ok(Inbound::Cancelled(cancel)) => return Ok(SessionEnd::Cancelled(cancel)),
                Err(RspError::ConnectionClosed) => return Ok(SessionEnd::ClientClosed),
                Err(e) => return Err(e.into()),
            };

            let outcome = match Command::parse(&frame.payload) {
                Ok(command) => match self.dispatch(command) {
                    Ok(outcome) => outcome,
                    Err(e) if is_closed(&e) => return Ok(SessionEnd::ClientClosed),
                    Err(e) => return Err(e),
                },
                Err(e) => {
                    log::warn!("{e}");
                    Outcome::reply(REPLY_ERROR)
                }
            };

            let sent = match outcome {
                Outcome::Reply(payload) => self.framer.send_packet(&payload),
                Outcome::Unsupported => Ok(()),
                Outcome::Detach => {
                    if let Err(e) = self.framer.send_packet(REPLY_OK) {
                        log::debug!("Detach reply not delivered: {e}");
                    }
                    return Ok(SessionEnd::Detached);
                }
                Outcome::Kill => return Ok(SessionEnd::Killed),
                Outcome::Cancelled(cancel) => return Ok(SessionEnd::Cancelled(cancel)),
            };
            match sent {
                Ok(()) => {}
                Err(RspError::ConnectionClosed) => return Ok(SessionEnd::ClientClosed),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close the client connection.
    pub fn close(&mut self) {
        self.framer.close();
    }

    /// Execute one command.
    ///
    /// Failing target or flash calls become an `E01` reply. An `Err` is only
    /// returned from the resume loop, where it ends the session.
    pub fn dispatch(&mut self, command: Command) -> Result<Outcome> {
        log::debug!("Dispatching {command:?}");
        let outcome = match command {
            Command::Query(query) => self.query(query),
            Command::SetThread => Outcome::reply(REPLY_OK),
            Command::LastSignal => {
                let mut slot = self.board.lock();
                Outcome::or_error(
                    self.debug.last_signal(slot.target()).map(|s| s.stop_reply().into_bytes()),
                )
            }
            Command::ReadRegisters => {
                let mut slot = self.board.lock();
                Outcome::or_error(self.debug.read_registers(slot.target()).map(String::into_bytes))
            }
            Command::ReadRegister(index) => {
                let mut slot = self.board.lock();
                Outcome::or_error(
                    self.debug.read_register(slot.target(), index).map(String::into_bytes),
                )
            }
            Command::WriteRegister { index, value } => {
                let mut slot = self.board.lock();
                Outcome::or_error(
                    self.debug.write_register(slot.target(), index, value).map(|()| ok()),
                )
            }
            Command::ReadMemory { address, length } => {
                let limit = self.max_read_len();
                if length > limit {
                    log::debug!("Clamping {length} byte read @ 0x{address:08X} to {limit} bytes");
                }
                let length = length.min(limit);
                let mut slot = self.board.lock();
                Outcome::or_error(
                    self.memory.read_block_hex(slot.target(), address, length).map(String::into_bytes),
                )
            }
            Command::WriteMemory { address, data } | Command::WriteMemoryBinary { address, data } => {
                let mut slot = self.board.lock();
                Outcome::or_error(self.memory.write_block(slot.target(), address, &data).map(|()| ok()))
            }
            Command::FlashErase { address, length } => {
                let mut slot = self.board.lock();
                let events = &self.events;
                let result =
                    self.flash.erase(&mut slot, address, length, &mut |p| events.flash_progress(p));
                Outcome::or_error(result.map(|()| ok()))
            }
            Command::FlashWrite { address, data } => {
                let mut slot = self.board.lock();
                Outcome::or_error(self.flash.write(&mut slot, address, &data).map(|()| ok()))
            }
            Command::FlashDone => {
                let mut slot = self.board.lock();
                let events = &self.events;
                let result = self.flash.done(&mut slot, &mut |p| events.flash_progress(p));
                Outcome::or_error(result.map(|()| ok()))
            }
            Command::ContQuery | Command::UnknownV(_) => Outcome::reply(Vec::new()),
            Command::Continue => return self.resume(),
            Command::Step => {
                let mut slot = self.board.lock();
                Outcome::or_error(self.debug.step(slot.target()).map(|()| {
                    self.events.send(ServerEvent::Halted(Signal::Trap));
                    Signal::Trap.stop_reply().into_bytes()
                }))
            }
            Command::InsertBreakpoint { address } => {
                let mut slot = self.board.lock();
                let result = self.breakpoints.set_breakpoint(slot.target(), address);
                Outcome::or_error(result.map(|accepted| if accepted { ok() } else { REPLY_ERROR.to_vec() }))
            }
            Command::RemoveBreakpoint { address } => {
                let mut slot = self.board.lock();
                Outcome::or_error(self.breakpoints.clear_breakpoint(slot.target(), address).map(|()| ok()))
            }
            Command::Detach => Outcome::Detach,
            Command::Kill => Outcome::Kill,
            Command::Unsupported(packet) => {
                log::debug!("Unsupported packet {packet:?}, not replying");
                Outcome::Unsupported
            }
        };
        Ok(outcome)
    }

    fn resume(&mut self) -> Result<Outcome> {
        match ResumeLoop::new(&mut self.framer, &self.board, self.poller).run()? {
            ResumeOutcome::Stopped(signal) => {
                self.events.send(ServerEvent::Halted(signal));
                Ok(Outcome::reply(signal.stop_reply()))
            }
            ResumeOutcome::Cancelled(cancel) => Ok(Outcome::Cancelled(cancel)),
        }
    }

    /// Largest `m` read whose hex reply fits the packet size. Longer reads
    /// are answered short, which clients handle by asking for the rest.
    fn max_read_len(&self) -> usize {
        self.packet_size.saturating_sub(4) / 2
    }

    fn query(&mut self, query: Query) -> Outcome {
        match query {
            Query::Supported => Outcome::reply(format!(
                "PacketSize={:x};qXfer:features:read+;qXfer:memory-map:read+",
                self.packet_size
            )),
            Query::Features { annex, window } => {
                if annex != "target.xml" {
                    log::warn!("Unknown qXfer features annex {annex:?}");
                    return Outcome::reply(REPLY_BAD_ANNEX);
                }
                let document = self.board.lock().target().register_description_xml();
                self.xfer(document.as_bytes(), window)
            }
            Query::MemoryMap(window) => {
                let document = self.board.lock().flash().memory_map_xml();
                self.xfer(document.as_bytes(), window)
            }
            Query::Offsets => Outcome::reply("Text=0;Data=0;Bss=0"),
            Query::Symbol => Outcome::reply(REPLY_OK),
            Query::Attached => Outcome::reply("1"),
            Query::TraceStatus => Outcome::reply("T0"),
            Query::TraceList | Query::ThreadInfoNext => Outcome::reply("l"),
            Query::CurrentThread => Outcome::reply("QC1"),
            Query::ThreadInfoFirst => Outcome::reply("m1"),
            Query::Monitor(command) => Outcome::or_error(self.monitor(&command)),
            Query::Unknown(name) => {
                log::debug!("Unknown query q{name}, replying empty");
                Outcome::reply(Vec::new())
            }
        }
    }

    fn xfer(&self, document: &[u8], window: XferWindow) -> Outcome {
        xfer::read_window(document, window, self.packet_size)
            .map_or_else(|| Outcome::reply(REPLY_BAD_OFFSET), Outcome::Reply)
    }

    /// `qRcmd`: run a monitor command and return its hex-encoded console text.
    fn monitor(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let command = String::from_utf8_lossy(command);
        let command = command.trim();
        log::info!("Monitor command {command:?}");

        let text = match command {
            "reset" | "reset halt" => {
                self.board.lock().target().reset_stop_on_reset()?;
                "Target reset and halted\n".to_string()
            }
            "halt" => {
                self.debug.halt(self.board.lock().target())?;
                "Target halted\n".to_string()
            }
            "help" => MONITOR_HELP.to_string(),
            other => format!("Unknown monitor command: {other}\n"),
        };
        Ok(hex::encode(text).into_bytes())
    }
}

fn ok() -> Vec<u8> {
    REPLY_OK.to_vec()
}

fn is_closed(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<RspError>(), Some(RspError::ConnectionClosed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlFlags, YieldPacer};
    use crate::protocol::Frame;
    use crate::sim::{SimBoard, SimMonitor, SIM_PAGE_SIZE, SIM_RAM_BASE};
    use crate::target::{CoreRegister, TargetState};
    use crate::transport::{ChannelTransport, Transport};
    use crossbeam_channel::Receiver;
    use std::sync::Arc;

    struct Fixture {
        client: Option<ChannelTransport>,
        board: BoardHandle,
        monitor: SimMonitor,
        poller: Poller,
        events: EventSink,
        event_rx: Receiver<ServerEvent>,
        framer: Option<Framer>,
    }

    fn fixture() -> Fixture {
        let (server, client) = ChannelTransport::pair();
        let sim = SimBoard::new();
        let monitor = sim.monitor();
        let (events, event_rx) = EventSink::new();
        Fixture {
            client: Some(client),
            board: BoardHandle::new(Box::new(sim)),
            monitor,
            poller: Poller::new(Arc::new(ControlFlags::new()), Box::new(YieldPacer)),
            events,
            event_rx,
            framer: Some(Framer::new(Box::new(server))),
        }
    }

    impl Fixture {
        fn session(&mut self) -> Session<'_> {
            let framer = self.framer.take().unwrap_or_else(|| panic!("session already built"));
            Session::new(framer, self.board.clone(), &mut self.poller, self.events.clone(), 2048)
        }
    }

    fn send(session: &mut Session<'_>, payload: &[u8]) -> Outcome {
        session.dispatch(Command::parse(payload).unwrap()).unwrap()
    }

    fn reply(session: &mut Session<'_>, payload: &[u8]) -> Vec<u8> {
        match send(session, payload) {
            Outcome::Reply(reply) => reply,
            other => panic!("expected a reply to {payload:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_supported_advertises_packet_size() {
        let mut f = fixture();
        let mut session = f.session();
        let supported = String::from_utf8(reply(&mut session, b"qSupported")).unwrap();
        assert!(supported.starts_with("PacketSize=800;"));
        assert!(supported.contains("qXfer:features:read+"));
        assert!(supported.contains("qXfer:memory-map:read+"));
    }

    #[test]
    fn test_fixed_replies() {
        let mut f = fixture();
        let mut session = f.session();
        assert_eq!(reply(&mut session, b"Hg0"), b"OK");
        assert_eq!(reply(&mut session, b"qOffsets"), b"Text=0;Data=0;Bss=0");
        assert_eq!(reply(&mut session, b"qSymbol::"), b"OK");
        assert_eq!(reply(&mut session, b"qAttached"), b"1");
        assert_eq!(reply(&mut session, b"qTStatus"), b"T0");
        assert_eq!(reply(&mut session, b"qTfV"), b"l");
        assert_eq!(reply(&mut session, b"qC"), b"QC1");
        assert_eq!(reply(&mut session, b"qfThreadInfo"), b"m1");
        assert_eq!(reply(&mut session, b"qsThreadInfo"), b"l");
        assert_eq!(reply(&mut session, b"vCont?"), b"");
        assert_eq!(reply(&mut session, b"vMustReplyEmpty"), b"");
        assert_eq!(reply(&mut session, b"qL1200"), b"");
    }

    #[test]
    fn test_fresh_target_reports_s17() {
        let mut f = fixture();
        let mut session = f.session();
        assert_eq!(reply(&mut session, b"?"), b"S17");
    }

    #[test]
    fn test_register_packets() {
        let mut f = fixture();
        f.monitor.set_register(CoreRegister::R1, 0x1234_5678);
        let mut session = f.session();
        assert_eq!(reply(&mut session, b"g").len(), 8 * CoreRegister::GDB_ORDER.len());
        assert_eq!(reply(&mut session, b"p1"), b"78563412");
        assert_eq!(reply(&mut session, b"Pf=00010008"), b"OK");
        assert_eq!(reply(&mut session, b"pf"), b"00010008");
        assert_eq!(reply(&mut session, b"p40"), b"E01");
        drop(session);
        assert_eq!(f.monitor.register(CoreRegister::Pc), 0x0800_0100);
    }

    #[test]
    fn test_memory_packets() {
        let mut f = fixture();
        let mut session = f.session();
        assert_eq!(reply(&mut session, b"M20000000,2:abcd"), b"OK");
        assert_eq!(reply(&mut session, b"X20000002,2:\x7d\x03\x01"), b"OK");
        assert_eq!(reply(&mut session, b"X20000000,0:"), b"OK");
        assert_eq!(reply(&mut session, b"m20000000,4"), b"abcd2301");
        assert_eq!(reply(&mut session, b"M08000000,1:00"), b"E01");
        drop(session);
        assert_eq!(f.monitor.memory(SIM_RAM_BASE, 4), [0xab, 0xcd, 0x23, 0x01]);
    }

    #[test]
    fn test_huge_read_is_answered_short() {
        let mut f = fixture();
        let mut session = f.session();
        let clamped = reply(&mut session, b"m20000000,ffffffffffffffff");
        assert_eq!(clamped.len(), 2 * ((2048 - 4) / 2));
        assert_eq!(reply(&mut session, b"m0,80000000").len(), 2044);
        assert_eq!(reply(&mut session, b"m20000000,4"), b"00000000");
    }

    #[test]
    fn test_flash_load_cut_short_by_board_swap() {
        let mut f = fixture();
        let board = f.board.clone();
        let replacement = SimBoard::new();
        let replacement_monitor = replacement.monitor();
        let mut session = f.session();

        assert_eq!(reply(&mut session, b"vFlashErase:08000000,400"), b"OK");
        assert_eq!(reply(&mut session, b"vFlashWrite:08000000:\x01\x02\x03"), b"OK");
        let _old = board.replace(Box::new(replacement));
        assert_eq!(reply(&mut session, b"vFlashDone"), b"E01");
        drop(session);

        assert!(replacement_monitor.programmed_pages().is_empty());
        assert_eq!(replacement_monitor.reset_count(), 0);
        assert!(f.event_rx.try_iter().any(|e| matches!(e, ServerEvent::FlashFailed(_))));
    }

    #[test]
    fn test_bad_arguments_reply_error() {
        let mut f = fixture();
        let mut client = f.client.take().unwrap_or_else(|| panic!("client already taken"));
        client.write_all(&Frame::new(&b"mzz,4"[..]).encode()).unwrap();
        client.write_all(&Frame::new(&b"k"[..]).encode()).unwrap();

        let mut session = f.session();
        assert_eq!(session.run().unwrap(), SessionEnd::Killed);
        assert_eq!(client.read_packet().unwrap(), b"E01");
    }

    #[test]
    fn test_hang_up_ends_session() {
        let mut f = fixture();
        drop(f.client.take());
        let mut session = f.session();
        assert_eq!(session.run().unwrap(), SessionEnd::ClientClosed);
    }

    #[test]
    fn test_breakpoints() {
        let mut f = fixture();
        f.monitor.set_breakpoint_limit(1);
        let mut session = f.session();
        assert_eq!(reply(&mut session, b"Z1,08000100,2"), b"OK");
        assert_eq!(reply(&mut session, b"Z1,08000200,2"), b"E01");
        assert_eq!(send(&mut session, b"Z0,08000100,2"), Outcome::Unsupported);
        assert_eq!(reply(&mut session, b"z1,08000100,2"), b"OK");
        drop(session);
        assert!(f.monitor.breakpoints().is_empty());
    }

    #[test]
    fn test_unknown_leading_character_is_silent() {
        let mut f = fixture();
        let mut session = f.session();
        assert_eq!(send(&mut session, b"!"), Outcome::Unsupported);
        assert_eq!(send(&mut session, b"D"), Outcome::Detach);
        assert_eq!(send(&mut session, b"k"), Outcome::Kill);
    }

    #[test]
    fn test_xfer_documents() {
        let mut f = fixture();
        let mut session = f.session();
        let first = reply(&mut session, b"qXfer:features:read:target.xml:0,10");
        assert_eq!(first[0], b'm');
        assert_eq!(&first[1..], b"<?xml version=\"1");
        assert_eq!(reply(&mut session, b"qXfer:features:read:other.xml:0,10"), b"E00");
        assert_eq!(reply(&mut session, b"qXfer:features:read:target.xml:100000,10"), b"E16");

        let map = reply(&mut session, b"qXfer:memory-map:read::0,1000");
        assert_eq!(map[0], b'l');
        assert!(String::from_utf8_lossy(&map).contains("type=\"flash\""));
    }

    #[test]
    fn test_flash_load() {
        let mut f = fixture();
        let mut session = f.session();
        let image = vec![0x5a; SIM_PAGE_SIZE + 16];
        let mut write = b"vFlashWrite:08000000:".to_vec();
        write.extend_from_slice(&image);

        assert_eq!(reply(&mut session, b"vFlashErase:08000000,800"), b"OK");
        assert_eq!(reply(&mut session, &write), b"OK");
        assert_eq!(reply(&mut session, b"vFlashDone"), b"OK");
        drop(session);

        assert_eq!(f.monitor.flash_image()[..image.len()], image[..]);
        assert_eq!(f.monitor.reset_count(), 1);
        let events: Vec<ServerEvent> = f.event_rx.try_iter().collect();
        assert!(events.contains(&ServerEvent::FlashDone));
        assert!(events.contains(&ServerEvent::FlashProgress {
            written: image.len(),
            total: image.len()
        }));
    }

    #[test]
    fn test_flash_failure_replies_error() {
        let mut f = fixture();
        f.monitor.fail_program_at(0);
        let mut session = f.session();
        assert_eq!(reply(&mut session, b"vFlashErase:08000000,400"), b"OK");
        assert_eq!(reply(&mut session, b"vFlashWrite:08000000:\x01\x02"), b"OK");
        assert_eq!(reply(&mut session, b"vFlashDone"), b"E01");
        drop(session);
        assert_eq!(f.monitor.reset_count(), 0);
        assert!(f.event_rx.try_iter().any(|e| matches!(e, ServerEvent::FlashFailed(_))));
        assert_eq!(f.monitor.flash_image()[0], 0xff);
    }

    #[test]
    fn test_monitor_commands() {
        let mut f = fixture();
        let mut session = f.session();
        let help = reply(&mut session, format!("qRcmd,{}", hex::encode("help")).as_bytes());
        assert!(String::from_utf8(hex::decode(help).unwrap()).unwrap().contains("reset"));

        let reset = reply(&mut session, format!("qRcmd,{}", hex::encode("reset")).as_bytes());
        assert_eq!(hex::decode(reset).unwrap(), b"Target reset and halted\n");

        let unknown = reply(&mut session, format!("qRcmd,{}", hex::encode("frob")).as_bytes());
        assert_eq!(hex::decode(unknown).unwrap(), b"Unknown monitor command: frob\n");
        drop(session);
        assert_eq!(f.monitor.reset_count(), 1);
    }

    #[test]
    fn test_step_reports_trap() {
        let mut f = fixture();
        let mut session = f.session();
        assert_eq!(reply(&mut session, b"s"), b"S05");
        drop(session);
        assert_eq!(f.monitor.register(CoreRegister::Pc), 2);
        assert_eq!(f.monitor.state(), TargetState::Halted);
        assert_eq!(f.event_rx.try_recv().unwrap(), ServerEvent::Halted(Signal::Trap));
    }
}
