//! Duplex byte-stream transports (§4.2).
//!
//! Two interchangeable backends implement the same [`Transport`] trait: a
//! serial backend over `serialport`, and a USB bulk-transfer backend over
//! `rusb`. Dialect engines and the session orchestrator only ever depend on
//! the trait, never on a concrete backend.

use std::time::{Duration, Instant};

/// Parity mode used during the handshake vs. transfer phases (§3 baud plan).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    Even,
    None,
}

/// A duplex byte-stream channel to the target device.
///
/// `read_exactly` returns `Timeout` once `deadline` elapses; partial reads
/// are discarded rather than buffered across calls, so no read can straddle
/// a frame boundary left over from a previous timeout (§4.2).
pub trait Transport {
    /// Write `bytes` to the device, blocking until the whole buffer is sent.
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Read exactly `n` bytes, or `Timeout` if `deadline` elapses first.
    fn read_exactly(&mut self, n: usize, deadline: Instant) -> std::io::Result<Vec<u8>>;

    /// Reconfigure the link's baud rate. A no-op on transports that don't
    /// have one (USB).
    fn set_baud(&mut self, baud: u32) -> std::io::Result<()>;

    /// Reconfigure the link's parity. A no-op on transports that don't have
    /// one (USB).
    fn set_parity(&mut self, parity: Parity) -> std::io::Result<()>;

    /// Assert a reset condition for `duration` (DTR toggle or an external
    /// command the session passes through without interpreting).
    fn assert_reset(&mut self, duration: Duration) -> std::io::Result<()>;

    /// Discard any bytes currently buffered by the OS or driver.
    fn drain(&mut self) -> std::io::Result<()>;
}

fn timeout_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "read_exactly deadline elapsed")
}

/// Serial port backend (UART dialects).
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    reset_line: ResetLine,
}

/// Which hardware line (or external command) asserts the target's reset.
pub enum ResetLine {
    Dtr,
    Rts,
    /// An external shell command, passed through opaquely (the session does
    /// not interpret it — §4.2).
    Command(String),
}

impl SerialTransport {
    /// Opens `path` at `baud` with 8 data bits, 1 stop bit, no flow
    /// control, even parity (the handshake default).
    pub fn open(path: &str, baud: u32, reset_line: ResetLine) -> std::io::Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::Even)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(50))
            .open()?;
        Ok(Self { port, reset_line })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.port.write_all(bytes)
    }

    fn read_exactly(&mut self, n: usize, deadline: Instant) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        let mut chunk = [0u8; 256];
        while out.len() < n {
            if Instant::now() >= deadline {
                return Err(timeout_error());
            }
            match self.port.read(&mut chunk) {
                Ok(0) => continue,
                Ok(read) => out.extend_from_slice(&chunk[..read]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn set_baud(&mut self, baud: u32) -> std::io::Result<()> {
        Ok(self.port.set_baud_rate(baud)?)
    }

    fn set_parity(&mut self, parity: Parity) -> std::io::Result<()> {
        let p = match parity {
            Parity::Even => serialport::Parity::Even,
            Parity::None => serialport::Parity::None,
        };
        Ok(self.port.set_parity(p)?)
    }

    fn assert_reset(&mut self, duration: Duration) -> std::io::Result<()> {
        match &self.reset_line {
            ResetLine::Dtr => {
                self.port.write_data_terminal_ready(true)?;
                std::thread::sleep(duration);
                Ok(self.port.write_data_terminal_ready(false)?)
            }
            ResetLine::Rts => {
                self.port.write_request_to_send(true)?;
                std::thread::sleep(duration);
                Ok(self.port.write_request_to_send(false)?)
            }
            ResetLine::Command(cmd) => {
                // Opaque to the session: any non-zero exit is surfaced as an I/O error.
                let status = std::process::Command::new("sh").arg("-c").arg(cmd).status()?;
                if status.success() {
                    Ok(())
                } else {
                    Err(std::io::Error::other(format!("reset command failed: {status}")))
                }
            }
        }
    }

    fn drain(&mut self) -> std::io::Result<()> {
        Ok(self.port.clear(serialport::ClearBuffer::All)?)
    }
}

/// USB bulk-transfer backend (U15 dialect only). Whole frames are
/// transferred per bulk request; `set_baud`/`set_parity` are no-ops (§4.2).
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    endpoint_out: u8,
    endpoint_in: u8,
}

impl UsbTransport {
    pub fn open(vendor_id: u16, product_id: u16, endpoint_out: u8, endpoint_in: u8) -> Result<Self, rusb::Error> {
        let handle = rusb::open_device_with_vid_pid(vendor_id, product_id).ok_or(rusb::Error::NoDevice)?;
        Ok(Self {
            handle,
            endpoint_out,
            endpoint_in,
        })
    }
}

impl Transport for UsbTransport {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.handle
            .write_bulk(self.endpoint_out, bytes, Duration::from_secs(5))
            .map(|_| ())
            .map_err(to_io_error)
    }

    fn read_exactly(&mut self, n: usize, deadline: Instant) -> std::io::Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timeout_error());
        }
        let read = self
            .handle
            .read_bulk(self.endpoint_in, &mut out, remaining)
            .map_err(to_io_error)?;
        out.truncate(read);
        if read < n {
            return Err(timeout_error());
        }
        Ok(out)
    }

    fn set_baud(&mut self, _baud: u32) -> std::io::Result<()> {
        Ok(())
    }

    fn set_parity(&mut self, _parity: Parity) -> std::io::Result<()> {
        Ok(())
    }

    fn assert_reset(&mut self, _duration: Duration) -> std::io::Result<()> {
        self.handle.reset().map_err(to_io_error)
    }

    fn drain(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn to_io_error(e: rusb::Error) -> std::io::Error {
    match e {
        rusb::Error::Timeout => timeout_error(),
        other => std::io::Error::other(other.to_string()),
    }
}

/// A scripted in-memory transport, exposed unconditionally (not behind
/// `cfg(test)`) so downstream crates — `isp-dialects`, `isp-cli` — can use
/// it in their own test suites without re-implementing a fake transport.
pub mod testutil {

    use super::{Parity, Transport};
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    pub struct MockTransport {
        pub inbound: VecDeque<u8>,
        pub outbound: Vec<u8>,
        pub baud_history: Vec<u32>,
        pub reset_count: usize,
        pub fail_reads: usize,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                inbound: VecDeque::new(),
                outbound: Vec::new(),
                baud_history: Vec::new(),
                reset_count: 0,
                fail_reads: 0,
            }
        }

        pub fn push_inbound(&mut self, bytes: &[u8]) {
            self.inbound.extend(bytes.iter().copied());
        }
    }

    impl Transport for MockTransport {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            self.outbound.extend_from_slice(bytes);
            Ok(())
        }

        fn read_exactly(&mut self, n: usize, _deadline: Instant) -> std::io::Result<Vec<u8>> {
            if self.fail_reads > 0 {
                self.fail_reads -= 1;
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "scripted failure"));
            }
            if self.inbound.len() < n {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "mock underrun"));
            }
            Ok((0..n).map(|_| self.inbound.pop_front().unwrap()).collect())
        }

        fn set_baud(&mut self, baud: u32) -> std::io::Result<()> {
            self.baud_history.push(baud);
            Ok(())
        }

        fn set_parity(&mut self, _parity: Parity) -> std::io::Result<()> {
            Ok(())
        }

        fn assert_reset(&mut self, _duration: Duration) -> std::io::Result<()> {
            self.reset_count += 1;
            Ok(())
        }

        fn drain(&mut self) -> std::io::Result<()> {
            self.inbound.clear();
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn mock_transport_roundtrips_bytes() {
            let mut t = MockTransport::new();
            t.push_inbound(&[1, 2, 3]);
            t.write(&[9, 9]).unwrap();
            let deadline = Instant::now() + Duration::from_millis(10);
            let read = t.read_exactly(3, deadline).unwrap();
            assert_eq!(read, vec![1, 2, 3]);
            assert_eq!(t.outbound, vec![9, 9]);
        }

        #[test]
        fn mock_transport_times_out_on_underrun() {
            let mut t = MockTransport::new();
            t.push_inbound(&[1]);
            let deadline = Instant::now() + Duration::from_millis(10);
            let err = t.read_exactly(3, deadline).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        }
    }
}
