//! Error kinds for the ISP protocol stack.
//!
//! Every fallible boundary defines a narrow error type and folds it into
//! [`IspError`] via a hand-written `From` impl, rather than pulling in an
//! error-derive crate — see `FrameError` for the leaf type and `IspError`
//! for the session-level union.

use std::fmt;

/// Frame decoding failure. Each variant is distinct so the retry policy in
/// the session orchestrator can switch on it (corrupted checksums are
/// retried, malformed preambles are not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The leading preamble bytes did not match the dialect's framing.
    PreambleMismatch,
    /// The declared length field was zero or exceeded the dialect's max frame size.
    LengthOutOfRange,
    /// The trailing checksum did not match the additive sum of the frame body.
    ChecksumMismatch,
    /// The frame was missing its terminator byte.
    TerminatorMissing,
    /// Fewer bytes were available than the length field declared.
    Truncated,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreambleMismatch => write!(f, "frame preamble mismatch"),
            Self::LengthOutOfRange => write!(f, "frame length out of range"),
            Self::ChecksumMismatch => write!(f, "frame checksum mismatch"),
            Self::TerminatorMissing => write!(f, "frame terminator missing"),
            Self::Truncated => write!(f, "frame truncated before expected length"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Top-level error for the programming session.
#[derive(Debug)]
pub enum IspError {
    /// Transport read/write failure or repeated read timeout.
    LinkLost(String),
    /// Framing/checksum/terminator mismatch.
    Frame(FrameError),
    /// The device returned a protocol-level rejection.
    DeviceNak(u8),
    /// The identify response's magic number is not in the model database.
    UnknownModel(u16),
    /// Autodetection matched more than one dialect; lists the candidates.
    AutodetectAmbiguous(Vec<&'static str>),
    /// The requested operation is not available on the selected dialect.
    Unsupported(&'static str),
    /// An option name or value was rejected before any device I/O.
    BadOption(String),
    /// A HEX parse error, or an image larger than its target device region.
    BadImage(String),
    /// The best trim counter's measured error exceeded tolerance.
    TrimFailed { target_khz: u32, best_error_millis: u32 },
    /// The user interrupted the session (signal).
    UserAbort,
}

impl fmt::Display for IspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkLost(detail) => write!(f, "link lost: {detail}"),
            Self::Frame(e) => write!(f, "frame error: {e}"),
            Self::DeviceNak(code) => write!(f, "device rejected command (nak code {code:#04x})"),
            Self::UnknownModel(magic) => write!(f, "unknown model, magic {magic:#06x}"),
            Self::AutodetectAmbiguous(candidates) => {
                write!(f, "autodetect ambiguous among: {}", candidates.join(", "))
            }
            Self::Unsupported(what) => write!(f, "unsupported on this dialect: {what}"),
            Self::BadOption(detail) => write!(f, "bad option: {detail}"),
            Self::BadImage(detail) => write!(f, "bad image: {detail}"),
            Self::TrimFailed {
                target_khz,
                best_error_millis,
            } => write!(
                f,
                "trim failed: best error {best_error_millis} per-mille exceeds tolerance for target {target_khz} kHz"
            ),
            Self::UserAbort => write!(f, "user interrupt"),
        }
    }
}

impl std::error::Error for IspError {}

impl From<FrameError> for IspError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

impl From<std::io::Error> for IspError {
    fn from(e: std::io::Error) -> Self {
        Self::LinkLost(e.to_string())
    }
}

/// Exit status mapping per the CLI contract (§6): 0 success, 1 error, 2 user interrupt.
#[must_use]
pub fn exit_status(result: &Result<(), IspError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(IspError::UserAbort) => 2,
        Err(_) => 1,
    }
}

/// The pipeline stage an error occurred in, for the single-line user-visible report (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PowerCycle,
    Handshake,
    BaudSwitch,
    Trim,
    Erase,
    WriteCode,
    WriteEeprom,
    WriteOptions,
    Terminate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PowerCycle => "power cycle",
            Self::Handshake => "handshake",
            Self::BaudSwitch => "baud switch",
            Self::Trim => "trim",
            Self::Erase => "erase",
            Self::WriteCode => "write code",
            Self::WriteEeprom => "write eeprom",
            Self::WriteOptions => "write options",
            Self::Terminate => "terminate",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_mapping() {
        assert_eq!(exit_status(&Ok(())), 0);
        assert_eq!(exit_status(&Err(IspError::UserAbort)), 2);
        assert_eq!(exit_status(&Err(IspError::UnknownModel(0xDEAD))), 1);
    }

    #[test]
    fn frame_error_folds_into_isp_error() {
        let e: IspError = FrameError::ChecksumMismatch.into();
        assert!(matches!(e, IspError::Frame(FrameError::ChecksumMismatch)));
    }
}
