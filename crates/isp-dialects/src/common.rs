//! Shared frame exchange logic used by every dialect engine: encode a
//! request, write it, then read back exactly one response frame by
//! growing the read buffer until [`FrameCodec::declared_len`] resolves a
//! total length (§4.1, §4.2).

use isp_core::{Frame, FrameCodec, Framing, IspError, Transport};
use std::time::{Duration, Instant};

fn initial_probe_len(framing: Framing) -> usize {
    match framing {
        Framing::Uart => 2,
        Framing::Usb => 5,
    }
}

/// Writes `request` and blocks for one response frame within `timeout`.
pub fn exchange(
    transport: &mut dyn Transport,
    codec: &FrameCodec,
    framing: Framing,
    request: &Frame,
    timeout: Duration,
) -> Result<Frame, IspError> {
    let bytes = codec.encode(request);
    transport.write(&bytes)?;
    let deadline = Instant::now() + timeout;
    let frame = read_frame(transport, codec, framing, deadline)?;
    Ok(frame)
}

/// Blocks for one frame without writing anything first — for the
/// spontaneous device announcement that opens every handshake (§4.6 step 1,
/// §4.7): the device speaks first, the host only samples.
pub fn listen(
    transport: &mut dyn Transport,
    codec: &FrameCodec,
    framing: Framing,
    timeout: Duration,
) -> Result<Frame, IspError> {
    let deadline = Instant::now() + timeout;
    read_frame(transport, codec, framing, deadline)
}

fn read_frame(
    transport: &mut dyn Transport,
    codec: &FrameCodec,
    framing: Framing,
    deadline: Instant,
) -> Result<Frame, IspError> {
    let mut buf = transport.read_exactly(initial_probe_len(framing), deadline)?;
    loop {
        if let Some(total) = codec.declared_len(&buf) {
            if total <= buf.len() {
                break;
            }
            let remaining = total - buf.len();
            let rest = transport.read_exactly(remaining, deadline)?;
            buf.extend_from_slice(&rest);
            break;
        }
        let extra = transport.read_exactly(1, deadline)?;
        buf.extend_from_slice(&extra);
    }
    Ok(codec.decode(&buf)?)
}
