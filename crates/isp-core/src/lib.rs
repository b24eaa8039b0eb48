//! Protocol core for STC 8051 in-system programming: frame codec,
//! transports, image loading and the programming-session state machine.

pub mod debug;
pub mod error;
pub mod frame;
pub mod image;
pub mod session;
pub mod transport;

pub use debug::{hex_dump, DebugSink};
pub use error::{exit_status, IspError, Stage};
pub use frame::{Frame, FrameCodec, Framing, Sender};
pub use image::{load as load_image, Image};
pub use session::{
    BslVersion, Dialect, DeviceIdentity, ProgrammingPlan, ProgrammingSession, RetryPolicy, SessionOutcome,
    SessionState,
};
pub use transport::{Parity, ResetLine, SerialTransport, Transport, UsbTransport};
