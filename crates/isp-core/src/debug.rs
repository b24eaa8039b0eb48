//! Diagnostic hook for the `-D/--debug` flag (§6). The session/dialect
//! layer never prints directly — it hands the last request/response frame
//! pair to a caller-supplied sink, which the CLI glue renders with
//! `eprintln!`, keeping rendering out of the protocol core and gated
//! behind a flag checked only in `main.rs`.

use crate::frame::Frame;
use std::cell::RefCell;
use std::rc::Rc;

/// Invoked with `(request, response)` after each successful frame exchange.
/// `Rc<RefCell<_>>` rather than a plain `Box` so autodetect can hand the
/// same sink to several per-dialect engines in turn.
pub type DebugSink = Rc<RefCell<dyn FnMut(&Frame, &Frame)>>;

/// Renders bytes as lowercase space-separated hex pairs.
#[must_use]
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_formats_bytes() {
        assert_eq!(hex_dump(&[0x00, 0xAB, 0xFF]), "00 ab ff");
        assert_eq!(hex_dump(&[]), "");
    }
}
