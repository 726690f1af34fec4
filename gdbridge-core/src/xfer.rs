//! `qXfer` document pagination.

use crate::protocol::packet::{needs_escape, ESCAPE, ESCAPE_XOR};
use crate::protocol::XferWindow;

/// Bytes of a reply packet taken by framing and the `m`/`l` marker.
const REPLY_OVERHEAD: usize = 4;

/// Build the reply for one `qXfer` read of `document`.
///
/// The chunk is cut so its escaped form fits `packet_size`, and it is
/// prefixed with `m` when more data follows and `l` for the final one.
/// Returns `None` when the offset lies past the end of the document.
pub fn read_window(document: &[u8], window: XferWindow, packet_size: usize) -> Option<Vec<u8>> {
    if window.offset > document.len() {
        log::warn!(
            "qXfer offset {} is past the end of a {} byte document",
            window.offset,
            document.len()
        );
        return None;
    }

    let budget = packet_size.saturating_sub(REPLY_OVERHEAD);
    let remaining = &document[window.offset..];
    let wanted = &remaining[..window.length.min(remaining.len())];

    let mut reply = Vec::with_capacity(wanted.len().min(budget) + 1);
    reply.push(b'l');
    let mut taken = 0;
    for &byte in wanted {
        let width = if needs_escape(byte) { 2 } else { 1 };
        if reply.len() - 1 + width > budget {
            break;
        }
        if width == 2 {
            reply.push(ESCAPE);
            reply.push(byte ^ ESCAPE_XOR);
        } else {
            reply.push(byte);
        }
        taken += 1;
    }

    if taken < remaining.len() {
        reply[0] = b'm';
    }
    Some(reply)
}
