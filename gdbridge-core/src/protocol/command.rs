//! Decoding of packet payloads into commands.

use super::packet::{decode_hex, decode_u32_le, parse_hex_u32, parse_hex_usize, unescape};
use crate::error::{RspError, RspResult};

/// Breakpoint type in `Z`/`z` packets.
pub const SOFTWARE_BREAKPOINT: u8 = b'1';

/// `qXfer` read window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferWindow {
    pub offset: usize,
    pub length: usize,
}

/// Query packets (`q...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Supported,
    Features { annex: String, window: XferWindow },
    MemoryMap(XferWindow),
    Offsets,
    Symbol,
    Attached,
    TraceStatus,
    /// `qTfV` / `qTfP` and their `qTs*` continuations.
    TraceList,
    CurrentThread,
    ThreadInfoFirst,
    ThreadInfoNext,
    /// `qRcmd`, already hex-decoded.
    Monitor(Vec<u8>),
    Unknown(String),
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Query(Query),
    SetThread,
    LastSignal,
    ReadRegisters,
    ReadRegister(usize),
    WriteRegister { index: usize, value: u32 },
    ReadMemory { address: u32, length: usize },
    /// `M`, hex data.
    WriteMemory { address: u32, data: Vec<u8> },
    /// `X`, binary data after unescaping.
    WriteMemoryBinary { address: u32, data: Vec<u8> },
    FlashErase { address: u32, length: usize },
    FlashWrite { address: u32, data: Vec<u8> },
    FlashDone,
    ContQuery,
    /// Any other `v` packet; answered with the empty reply.
    UnknownV(String),
    Continue,
    Step,
    InsertBreakpoint { address: u32 },
    RemoveBreakpoint { address: u32 },
    Detach,
    Kill,
    /// Leading character or breakpoint type the server does not handle. No
    /// reply is sent for these.
    Unsupported(String),
}

impl Command {
    /// Decode a packet payload.
    pub fn parse(payload: &[u8]) -> RspResult<Self> {
        let Some((&first, rest)) = payload.split_first() else {
            return Ok(Self::Unsupported(String::new()));
        };

        let command = match first {
            b'q' => Self::Query(parse_query(rest)?),
            b'H' => Self::SetThread,
            b'?' => Self::LastSignal,
            b'g' => Self::ReadRegisters,
            b'p' => Self::ReadRegister(parse_hex_usize(rest)?),
            b'P' => {
                let (index, value) = split_once(rest, b'=')?;
                Self::WriteRegister { index: parse_hex_usize(index)?, value: decode_u32_le(value)? }
            }
            b'm' => {
                let (address, length) = split_once(rest, b',')?;
                Self::ReadMemory { address: parse_hex_u32(address)?, length: parse_hex_usize(length)? }
            }
            b'M' => {
                let (header, data) = split_once(rest, b':')?;
                let (address, length) = split_once(header, b',')?;
                let data = decode_hex(data)?;
                check_length(parse_hex_usize(length)?, data.len())?;
                Self::WriteMemory { address: parse_hex_u32(address)?, data }
            }
            b'X' => {
                let (header, data) = split_once(rest, b':')?;
                let (address, length) = split_once(header, b',')?;
                let data = unescape(data);
                check_length(parse_hex_usize(length)?, data.len())?;
                Self::WriteMemoryBinary { address: parse_hex_u32(address)?, data }
            }
            b'v' => parse_v(rest)?,
            b'c' | b'C' => Self::Continue,
            b's' | b'S' => Self::Step,
            b'Z' | b'z' => parse_breakpoint(first, rest)?,
            b'D' => Self::Detach,
            b'k' => Self::Kill,
            _ => Self::Unsupported(String::from_utf8_lossy(payload).into_owned()),
        };
        Ok(command)
    }
}

fn parse_query(rest: &[u8]) -> RspResult<Query> {
    if rest.starts_with(b"Supported") {
        return Ok(Query::Supported);
    }
    if let Some(args) = rest.strip_prefix(b"Xfer:features:read:") {
        let (annex, window) = split_once(args, b':')?;
        return Ok(Query::Features {
            annex: String::from_utf8_lossy(annex).into_owned(),
            window: parse_window(window)?,
        });
    }
    if let Some(args) = rest.strip_prefix(b"Xfer:memory-map:read::") {
        return Ok(Query::MemoryMap(parse_window(args)?));
    }
    if let Some(hex_command) = rest.strip_prefix(b"Rcmd,") {
        return Ok(Query::Monitor(decode_hex(hex_command)?));
    }

    let query = match rest {
        b"Offsets" => Query::Offsets,
        b"Attached" => Query::Attached,
        b"TStatus" => Query::TraceStatus,
        b"TfV" | b"TfP" | b"TsV" | b"TsP" => Query::TraceList,
        b"C" => Query::CurrentThread,
        b"fThreadInfo" => Query::ThreadInfoFirst,
        b"sThreadInfo" => Query::ThreadInfoNext,
        _ if rest.starts_with(b"Symbol") => Query::Symbol,
        _ if rest.starts_with(b"Attached") => Query::Attached,
        _ => Query::Unknown(String::from_utf8_lossy(rest).into_owned()),
    };
    Ok(query)
}

fn parse_v(rest: &[u8]) -> RspResult<Command> {
    if let Some(args) = rest.strip_prefix(b"FlashErase:") {
        let (address, length) = split_once(args, b',')?;
        return Ok(Command::FlashErase {
            address: parse_hex_u32(address)?,
            length: parse_hex_usize(length)?,
        });
    }
    if let Some(args) = rest.strip_prefix(b"FlashWrite:") {
        let (address, data) = split_once(args, b':')?;
        return Ok(Command::FlashWrite { address: parse_hex_u32(address)?, data: unescape(data) });
    }
    let command = match rest {
        b"FlashDone" => Command::FlashDone,
        b"Cont?" => Command::ContQuery,
        _ => Command::UnknownV(String::from_utf8_lossy(rest).into_owned()),
    };
    Ok(command)
}

fn parse_breakpoint(first: u8, rest: &[u8]) -> RspResult<Command> {
    let mut fields = rest.split(|&b| b == b',');
    let kind = fields.next().unwrap_or_default();
    let address = fields.next().ok_or_else(|| malformed(rest))?;

    if kind != &[SOFTWARE_BREAKPOINT][..] {
        return Ok(Command::Unsupported(format!(
            "{}{}",
            char::from(first),
            String::from_utf8_lossy(rest)
        )));
    }

    let address = parse_hex_u32(address)?;
    Ok(if first == b'Z' {
        Command::InsertBreakpoint { address }
    } else {
        Command::RemoveBreakpoint { address }
    })
}

fn parse_window(args: &[u8]) -> RspResult<XferWindow> {
    let (offset, length) = split_once(args, b',')?;
    Ok(XferWindow { offset: parse_hex_usize(offset)?, length: parse_hex_usize(length)? })
}

fn check_length(declared: usize, actual: usize) -> RspResult<()> {
    if declared == actual {
        Ok(())
    } else {
        Err(RspError::MalformedPacket(format!(
            "length field says {declared} bytes but {actual} bytes followed"
        )))
    }
}

fn split_once(bytes: &[u8], separator: u8) -> RspResult<(&[u8], &[u8])> {
    let index = bytes.iter().position(|&b| b == separator).ok_or_else(|| malformed(bytes))?;
    Ok((&bytes[..index], &bytes[index + 1..]))
}

fn malformed(bytes: &[u8]) -> RspError {
    RspError::MalformedPacket(String::from_utf8_lossy(bytes).into_owned())
}
