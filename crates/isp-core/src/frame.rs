//! Byte-level frame codec.
//!
//! Two framings exist across dialects (§4.1): a UART framing with
//! preamble/terminator bytes shared by the serial dialects, and a
//! length-prefixed USB framing used only by U15. Each dialect picks one at
//! construction time. Every frame carries a sender tag (§3 data model) —
//! host frames and device frames differ slightly in their UART byte shape
//! (the host adds a pad byte before the terminator) — so `encode` and
//! `decode` are true inverses of each other regardless of which side sent
//! the frame.

use crate::error::FrameError;

/// UART terminator byte.
const UART_TERMINATOR: u8 = 0x16;
/// UART host-frame padding byte, inserted before the terminator.
const UART_HOST_PAD: u8 = 0x6A;
/// UART host preamble.
const UART_HOST_PREAMBLE: [u8; 2] = [0x7E, 0x6F];
/// UART device preamble.
const UART_DEVICE_PREAMBLE: [u8; 3] = [0x46, 0xB9, 0x68];

/// Maximum payload accepted when decoding, guarding against a corrupted
/// length field turning into an unbounded allocation.
const MAX_FRAME_LEN: usize = 4096;

/// Which side emitted a frame. Host frames and device frames use slightly
/// different UART byte shapes (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    Host,
    Device,
}

/// A decoded frame: sender, command code and payload. The checksum and
/// framing bytes are consumed by decoding and are not carried further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: Sender,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn host(command: u8, payload: Vec<u8>) -> Self {
        Self {
            sender: Sender::Host,
            command,
            payload,
        }
    }

    #[must_use]
    pub fn device(command: u8, payload: Vec<u8>) -> Self {
        Self {
            sender: Sender::Device,
            command,
            payload,
        }
    }
}

/// Additive checksum over a byte slice, modulo 0x10000 (§4.1).
fn additive_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for &b in bytes {
        sum = (sum + u32::from(b)) & 0xFFFF;
    }
    sum as u16
}

/// Which framing a dialect uses. Chosen once per dialect engine at
/// construction time (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Preamble/length/checksum/terminator framing over a UART byte stream.
    Uart,
    /// Length-prefixed framing carried whole inside a USB bulk transfer.
    Usb,
}

/// Encodes and decodes frames for one dialect's framing.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    framing: Framing,
}

impl FrameCodec {
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    /// Serializes a frame ready to write to the transport.
    #[must_use]
    pub fn encode(&self, frame: &Frame) -> Vec<u8> {
        match self.framing {
            Framing::Uart => self.encode_uart(frame),
            Framing::Usb => self.encode_usb(frame),
        }
    }

    /// Parses one frame out of a complete buffer.
    ///
    /// For UART framing, `buf` is expected to hold exactly one frame (the
    /// caller reads up to `declared_len` before calling this, per the
    /// transport's blocking discipline in §4.2). For USB framing, `buf` is
    /// one whole bulk transfer.
    pub fn decode(&self, buf: &[u8]) -> Result<Frame, FrameError> {
        match self.framing {
            Framing::Uart => self.decode_uart(buf),
            Framing::Usb => self.decode_usb(buf),
        }
    }

    /// Given bytes read so far starting at the preamble, returns the total
    /// frame length in bytes once enough of the length field is available,
    /// so a transport can `read_exactly` the remainder. `None` means more
    /// header bytes are still needed. Works for either sender's preamble
    /// since both place the length field at the same relative position
    /// once the (differently sized) preamble is skipped.
    #[must_use]
    pub fn declared_len(&self, header: &[u8]) -> Option<usize> {
        match self.framing {
            Framing::Uart => {
                let preamble_len = Self::uart_preamble_len(header)?;
                if header.len() < preamble_len + 2 {
                    return None;
                }
                let len_field =
                    u16::from_be_bytes([header[preamble_len], header[preamble_len + 1]]) as usize;
                Some(preamble_len + len_field + 1) // + terminator
            }
            Framing::Usb => {
                if header.len() < 5 {
                    return None;
                }
                let len_field = u16::from_be_bytes([header[3], header[4]]) as usize;
                Some(8 + len_field + 2) // header + payload + checksum
            }
        }
    }

    fn uart_preamble_len(header: &[u8]) -> Option<usize> {
        if header.len() >= UART_DEVICE_PREAMBLE.len() && header[..UART_DEVICE_PREAMBLE.len()] == UART_DEVICE_PREAMBLE
        {
            Some(UART_DEVICE_PREAMBLE.len())
        } else if header.len() >= UART_HOST_PREAMBLE.len() && header[..UART_HOST_PREAMBLE.len()] == UART_HOST_PREAMBLE
        {
            Some(UART_HOST_PREAMBLE.len())
        } else if header.len() < UART_DEVICE_PREAMBLE.len() {
            None // still need more bytes to disambiguate
        } else {
            Some(0) // neither preamble matched; let decode_uart raise PreambleMismatch
        }
    }

    fn encode_uart(&self, frame: &Frame) -> Vec<u8> {
        let has_pad = frame.sender == Sender::Host;
        // length field covers itself, the command byte, the payload and the checksum.
        let len_field = (2 + 1 + frame.payload.len() + 2) as u16;
        let mut body = Vec::with_capacity(2 + 1 + frame.payload.len());
        body.extend_from_slice(&len_field.to_be_bytes());
        body.push(frame.command);
        body.extend_from_slice(&frame.payload);
        let checksum = additive_checksum(&body);

        let preamble: &[u8] = match frame.sender {
            Sender::Host => &UART_HOST_PREAMBLE,
            Sender::Device => &UART_DEVICE_PREAMBLE,
        };

        let mut out = Vec::with_capacity(preamble.len() + body.len() + 4);
        out.extend_from_slice(preamble);
        out.extend_from_slice(&body);
        out.extend_from_slice(&checksum.to_be_bytes());
        if has_pad {
            out.push(UART_HOST_PAD);
        }
        out.push(UART_TERMINATOR);
        out
    }

    fn decode_uart(&self, buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < UART_HOST_PREAMBLE.len() {
            return Err(FrameError::Truncated);
        }
        let (sender, preamble_len) = if buf.len() >= UART_DEVICE_PREAMBLE.len()
            && buf[..UART_DEVICE_PREAMBLE.len()] == UART_DEVICE_PREAMBLE
        {
            (Sender::Device, UART_DEVICE_PREAMBLE.len())
        } else if buf[..UART_HOST_PREAMBLE.len()] == UART_HOST_PREAMBLE {
            (Sender::Host, UART_HOST_PREAMBLE.len())
        } else {
            return Err(FrameError::PreambleMismatch);
        };

        if buf.len() < preamble_len + 2 {
            return Err(FrameError::Truncated);
        }
        let len_field = u16::from_be_bytes([buf[preamble_len], buf[preamble_len + 1]]) as usize;
        if len_field < 5 || len_field > MAX_FRAME_LEN {
            return Err(FrameError::LengthOutOfRange);
        }
        let body_end = preamble_len + len_field;
        let has_pad = sender == Sender::Host;
        let trailer_len = if has_pad { 2 } else { 1 }; // pad + terminator, or just terminator
        if buf.len() < body_end + trailer_len {
            return Err(FrameError::Truncated);
        }
        let terminator_index = body_end + trailer_len - 1;
        if buf[terminator_index] != UART_TERMINATOR {
            return Err(FrameError::TerminatorMissing);
        }

        let body = &buf[preamble_len..body_end];
        let checksum_bytes = &body[body.len() - 2..];
        let checked = &body[..body.len() - 2];
        let expected = additive_checksum(checked);
        let actual = u16::from_be_bytes([checksum_bytes[0], checksum_bytes[1]]);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch);
        }

        let command = checked[2];
        let payload = checked[3..].to_vec();
        Ok(Frame {
            sender,
            command,
            payload,
        })
    }

    fn encode_usb(&self, frame: &Frame) -> Vec<u8> {
        let len_field = frame.payload.len() as u16;
        let mut body = Vec::with_capacity(8 + frame.payload.len());
        body.extend_from_slice(&0u16.to_be_bytes()); // packet counter, not tracked on the host side
        body.push(frame.command);
        body.extend_from_slice(&len_field.to_be_bytes());
        body.extend_from_slice(&[0, 0]); // reserved
        body.extend_from_slice(&frame.payload);
        let checksum = additive_checksum(&body);

        let mut out = body;
        out.extend_from_slice(&checksum.to_be_bytes());
        out
    }

    fn decode_usb(&self, buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < 8 {
            return Err(FrameError::Truncated);
        }
        let command = buf[2];
        let len_field = u16::from_be_bytes([buf[3], buf[4]]) as usize;
        if len_field > MAX_FRAME_LEN {
            return Err(FrameError::LengthOutOfRange);
        }
        let body_end = 8 + len_field;
        if buf.len() < body_end + 2 {
            return Err(FrameError::Truncated);
        }
        let body = &buf[..body_end];
        let expected = additive_checksum(body);
        let actual = u16::from_be_bytes([buf[body_end], buf[body_end + 1]]);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch);
        }
        // USB framing carries no sender marker of its own; the caller knows
        // from context (it only ever decodes what the device sent).
        Ok(Frame::device(command, buf[8..body_end].to_vec()))
    }
}
