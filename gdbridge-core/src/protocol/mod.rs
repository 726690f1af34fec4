//! GDB remote serial protocol: packet framing and command decoding.

pub mod command;
pub mod framer;
pub mod packet;

pub use command::{Command, Query, XferWindow};
pub use framer::{Framer, Inbound};
pub use packet::{checksum, escape, unescape, Frame};
