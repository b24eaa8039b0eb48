//! One generic [`Dialect`] implementation parameterized by a per-family
//! [`DialectSpec`] table, rather than seven near-identical structs — the
//! deltas between P89/P12A/P12B/P12/P15A/P15/P8/U15 are data (framing,
//! block size, baud handling, option layout, UID/wakeup-frequency support),
//! not control flow, so they live in `SPECS` and the engine itself stays
//! single and testable.

use crate::common::{exchange, listen};
use isp_core::session::{BslVersion, Dialect, DeviceIdentity};
use isp_core::{DebugSink, Frame, FrameCodec, Framing, IspError};
use isp_core::{Image, Transport};
use isp_models::{Family, McuDescriptor};
use std::time::Duration;

/// Per-family protocol deltas (§4.6 "Dialect-specific deltas").
#[derive(Debug, Clone, Copy)]
pub struct DialectSpec {
    pub family: Family,
    pub dialect_name: &'static str,
    pub framing: Framing,
    /// Command byte a spontaneous announcement frame must carry.
    pub cmd_detect: u8,
    pub cmd_switch_baud: u8,
    pub cmd_trim: u8,
    pub cmd_erase: u8,
    pub cmd_write_code: u8,
    pub cmd_write_eeprom: u8,
    pub cmd_write_options: u8,
    pub cmd_terminate: u8,
    /// Default write-block size; a model's own `write_block_size` override
    /// in the model database wins when present.
    pub block_size: usize,
    /// `Some(baud)` for dialects that never leave their handshake rate
    /// (P89's 2400 baud UART handshake, §4.6 step 3 deltas); `switch_baud`
    /// becomes a no-op validation instead of a negotiation.
    pub fixed_baud: Option<u32>,
    pub supports_uid: bool,
    pub supports_wakeup_freq: bool,
    /// STC89/STC12A fuse their option byte(s) into the last code/eeprom
    /// write instead of sending a separate `write_options` frame (§4.6 step 7).
    pub fuses_options_with_last_write: bool,
    pub option_table: &'static isp_options::OptionTable,
}

const TIMEOUT: Duration = Duration::from_secs(2);
/// Generous: the device announces on its own schedule after reset/power-up.
pub(crate) const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// The handshake always starts at this rate, regardless of dialect (§4.6 step 1).
const HANDSHAKE_BAUD: u32 = 2400;
/// Reference oscillator used to turn a baud value into a divisor when a
/// device's own factory frequency is not yet known.
const REFERENCE_FREQ_HZ: u32 = 11_059_200;
/// Hz represented by one count of the RC-trim/frequency counter carried in
/// the announcement frame.
const FREQ_COUNTER_HZ_PER_COUNT: u32 = 906;
/// Baud divisor tolerance, in per-mille, for accepting a device's reported
/// divisor as close enough to the proposed one (§4.6 step 3, §7).
const BAUD_TOLERANCE_PERMILLE: u32 = 5;
/// Trim search tolerance, in per-mille (§4.6 step 4).
const TRIM_TOLERANCE_PERMILLE: u32 = 5;
/// Spacing between RC-trim candidates tried during the search.
const TRIM_CANDIDATE_STEP: u16 = 0x1000;

fn divisor_for_baud(freq_hz: u32, baud: u32) -> u16 {
    (freq_hz / baud.max(1)).min(u32::from(u16::MAX)) as u16
}

fn baud_for_divisor(freq_hz: u32, divisor: u16) -> u32 {
    if divisor == 0 {
        return 0;
    }
    freq_hz / u32::from(divisor)
}

fn error_permille(achieved: u32, target: u32) -> u32 {
    if target == 0 {
        return 0;
    }
    (u64::from(achieved.abs_diff(target)) * 1000 / u64::from(target)) as u32
}

/// One entry per supported dialect (the `auto` pseudo-dialect is not here;
/// it lives in [`crate::autodetect`]).
pub static SPECS: &[DialectSpec] = &[
    DialectSpec {
        family: Family::Stc89,
        dialect_name: "stc89",
        framing: Framing::Uart,
        cmd_detect: 0x00,
        cmd_switch_baud: 0x01,
        cmd_trim: 0x02,
        cmd_erase: 0x03,
        cmd_write_code: 0x04,
        cmd_write_eeprom: 0x05,
        cmd_write_options: 0x06,
        cmd_terminate: 0x07,
        block_size: 128,
        fixed_baud: Some(HANDSHAKE_BAUD),
        supports_uid: false,
        supports_wakeup_freq: false,
        fuses_options_with_last_write: true,
        option_table: &isp_options::P89_TABLE,
    },
    DialectSpec {
        family: Family::Stc12A,
        dialect_name: "stc12a",
        framing: Framing::Uart,
        cmd_detect: 0x00,
        cmd_switch_baud: 0x01,
        cmd_trim: 0x02,
        cmd_erase: 0x03,
        cmd_write_code: 0x04,
        cmd_write_eeprom: 0x05,
        cmd_write_options: 0x06,
        cmd_terminate: 0x07,
        block_size: 128,
        fixed_baud: None,
        supports_uid: true,
        supports_wakeup_freq: false,
        fuses_options_with_last_write: true,
        option_table: &isp_options::P12A_TABLE,
    },
    DialectSpec {
        family: Family::Stc12B,
        dialect_name: "stc12b",
        framing: Framing::Uart,
        cmd_detect: 0x00,
        cmd_switch_baud: 0x01,
        cmd_trim: 0x02,
        cmd_erase: 0x03,
        cmd_write_code: 0x04,
        cmd_write_eeprom: 0x05,
        cmd_write_options: 0x06,
        cmd_terminate: 0x07,
        block_size: 128,
        fixed_baud: None,
        supports_uid: false,
        supports_wakeup_freq: false,
        fuses_options_with_last_write: false,
        option_table: &isp_options::P12B_TABLE,
    },
    DialectSpec {
        family: Family::Stc12,
        dialect_name: "stc12",
        framing: Framing::Uart,
        cmd_detect: 0x00,
        cmd_switch_baud: 0x01,
        cmd_trim: 0x02,
        cmd_erase: 0x03,
        cmd_write_code: 0x04,
        cmd_write_eeprom: 0x05,
        cmd_write_options: 0x06,
        cmd_terminate: 0x07,
        // Some IAP12 models override this to 256 via the model database.
        block_size: 128,
        fixed_baud: None,
        supports_uid: false,
        supports_wakeup_freq: false,
        fuses_options_with_last_write: false,
        option_table: &isp_options::P12_TABLE,
    },
    DialectSpec {
        family: Family::Stc15A,
        dialect_name: "stc15a",
        framing: Framing::Uart,
        cmd_detect: 0x00,
        cmd_switch_baud: 0x01,
        cmd_trim: 0x02,
        cmd_erase: 0x03,
        cmd_write_code: 0x04,
        cmd_write_eeprom: 0x05,
        cmd_write_options: 0x06,
        cmd_terminate: 0x07,
        block_size: 256,
        fixed_baud: None,
        supports_uid: true,
        supports_wakeup_freq: true,
        fuses_options_with_last_write: false,
        option_table: &isp_options::P15A_TABLE,
    },
    DialectSpec {
        family: Family::Stc15,
        dialect_name: "stc15",
        framing: Framing::Uart,
        cmd_detect: 0x00,
        cmd_switch_baud: 0x01,
        cmd_trim: 0x02,
        cmd_erase: 0x03,
        cmd_write_code: 0x04,
        cmd_write_eeprom: 0x05,
        cmd_write_options: 0x06,
        cmd_terminate: 0x07,
        block_size: 256,
        fixed_baud: None,
        supports_uid: true,
        supports_wakeup_freq: true,
        fuses_options_with_last_write: false,
        option_table: &isp_options::P15_TABLE,
    },
    DialectSpec {
        family: Family::Stc8,
        dialect_name: "stc8",
        framing: Framing::Uart,
        cmd_detect: 0x00,
        cmd_switch_baud: 0x01,
        cmd_trim: 0x02,
        cmd_erase: 0x03,
        cmd_write_code: 0x04,
        cmd_write_eeprom: 0x05,
        cmd_write_options: 0x06,
        cmd_terminate: 0x07,
        block_size: 256,
        fixed_baud: None,
        supports_uid: true,
        supports_wakeup_freq: false,
        fuses_options_with_last_write: false,
        option_table: &isp_options::P8_TABLE,
    },
    DialectSpec {
        family: Family::Usb15,
        dialect_name: "usb15",
        framing: Framing::Usb,
        cmd_detect: 0x00,
        cmd_switch_baud: 0x01,
        cmd_trim: 0x02,
        cmd_erase: 0x03,
        cmd_write_code: 0x04,
        cmd_write_eeprom: 0x05,
        cmd_write_options: 0x06,
        cmd_terminate: 0x07,
        block_size: 512,
        fixed_baud: None,
        supports_uid: true,
        supports_wakeup_freq: true,
        fuses_options_with_last_write: false,
        option_table: &isp_options::USB15_TABLE,
    },
];

#[must_use]
pub fn spec_for(dialect_name: &str) -> Option<&'static DialectSpec> {
    SPECS.iter().find(|s| s.dialect_name == dialect_name)
}

/// A protocol engine for one MCU family, driven entirely by its [`DialectSpec`].
///
/// `descriptor`/`factory_freq_hz` are populated by [`Engine::adopt_announcement`]
/// once the handshake has read the device's spontaneous announcement; every
/// later stage (baud switch, trim, block-size selection) consults them.
pub struct Engine {
    spec: &'static DialectSpec,
    codec: FrameCodec,
    debug_sink: Option<DebugSink>,
    descriptor: Option<McuDescriptor>,
    factory_freq_hz: Option<u32>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("spec", &self.spec)
            .field("codec", &self.codec)
            .field("descriptor", &self.descriptor)
            .field("factory_freq_hz", &self.factory_freq_hz)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn new(spec: &'static DialectSpec) -> Self {
        Self {
            spec,
            codec: FrameCodec::new(spec.framing),
            debug_sink: None,
            descriptor: None,
            factory_freq_hz: None,
        }
    }

    /// Attaches a sink that receives every request/response frame pair,
    /// for the CLI's `-D/--debug` flag.
    #[must_use]
    pub fn with_debug_sink(mut self, sink: DebugSink) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    fn request(&self, transport: &mut dyn Transport, command: u8, payload: Vec<u8>) -> Result<Frame, IspError> {
        let request = Frame::host(command, payload);
        let response = exchange(transport, &self.codec, self.spec.framing, &request, TIMEOUT)?;
        if let Some(sink) = &self.debug_sink {
            sink.borrow_mut()(&request, &response);
        }
        Ok(response)
    }

    /// Parses a passively-read spontaneous announcement frame (§4.6 step 1,
    /// §4.7) into a full [`DeviceIdentity`], classifying the model against
    /// the database and rejecting one from a different family than this
    /// engine's. Also seeds `descriptor`/`factory_freq_hz` for later stages.
    pub(crate) fn adopt_announcement(&mut self, frame: &Frame) -> Result<DeviceIdentity, IspError> {
        if frame.payload.len() < 16 {
            return Err(IspError::BadImage("device announcement shorter than expected".into()));
        }
        let magic = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        let bsl_major = frame.payload[2];
        let bsl_minor = frame.payload[3];
        let bsl_suffix = frame.payload[4] as char;
        let factory_trim_counter = u16::from_be_bytes([frame.payload[5], frame.payload[6]]);
        let wakeup_counter = u16::from_be_bytes([frame.payload[7], frame.payload[8]]);
        let mut uid = [0u8; 7];
        uid.copy_from_slice(&frame.payload[9..16]);

        let descriptor = isp_models::lookup(magic)?;
        if descriptor.family != self.spec.family {
            return Err(IspError::Unsupported(self.spec.dialect_name));
        }

        let factory_freq_hz = u32::from(factory_trim_counter) * FREQ_COUNTER_HZ_PER_COUNT;
        let wakeup_freq_hz = self
            .spec
            .supports_wakeup_freq
            .then(|| u32::from(wakeup_counter) * FREQ_COUNTER_HZ_PER_COUNT);
        let uid = self.spec.supports_uid.then_some(uid);

        self.descriptor = Some(descriptor);
        self.factory_freq_hz = Some(factory_freq_hz);

        Ok(DeviceIdentity {
            magic,
            model_name: descriptor.name,
            code_size: descriptor.code_size,
            eeprom_size: descriptor.eeprom_size,
            bsl_version: BslVersion {
                major: bsl_major,
                minor: bsl_minor,
                suffix: bsl_suffix,
            },
            factory_freq_hz,
            factory_trim_counter,
            wakeup_freq_hz,
            uid,
            current_option_bytes: vec![0; self.spec.option_table.byte_len],
            current_baud: HANDSHAKE_BAUD,
        })
    }

    fn reference_freq(&self) -> u32 {
        self.factory_freq_hz.unwrap_or(REFERENCE_FREQ_HZ)
    }

    fn block_size(&self) -> usize {
        self.descriptor
            .and_then(|d| d.write_block_size)
            .unwrap_or(self.spec.block_size)
    }

    /// Proposes `target_baud`, verifies the device's returned divisor is
    /// within tolerance, switches the transport, then pings at the new
    /// rate. On link loss during the ping, falls back once to half of
    /// `target_baud` (§4.6 step 3, §7).
    fn propose_baud(&mut self, transport: &mut dyn Transport, target_baud: u32, allow_fallback: bool) -> Result<(), IspError> {
        let freq = self.reference_freq();
        let proposed_divisor = divisor_for_baud(freq, target_baud);
        let mut payload = proposed_divisor.to_be_bytes().to_vec();
        payload.extend_from_slice(&target_baud.to_be_bytes());
        let response = self.request(transport, self.spec.cmd_switch_baud, payload)?;
        reject_nak(&response)?;
        if response.payload.len() < 2 {
            return Err(IspError::LinkLost("switch_baud response missing device divisor".into()));
        }
        let device_divisor = u16::from_be_bytes([response.payload[0], response.payload[1]]);
        let achieved = baud_for_divisor(freq, device_divisor);
        let permille = error_permille(achieved, target_baud);
        if permille > BAUD_TOLERANCE_PERMILLE {
            return Err(IspError::LinkLost(format!(
                "baud divisor mismatch: proposed {target_baud}, device settled on {achieved} ({permille} permille off)"
            )));
        }

        transport.set_baud(target_baud)?;
        match self.request(transport, self.spec.cmd_switch_baud, vec![0xFF]) {
            Ok(ping) => {
                reject_nak(&ping)?;
                Ok(())
            }
            Err(IspError::LinkLost(detail)) if allow_fallback => {
                let halved = target_baud / 2;
                transport.set_baud(halved)?;
                self.propose_baud(transport, halved, false).map_err(|_| IspError::LinkLost(detail))
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the RC-trim candidate search, returning the best `(counter, error_permille)`.
    fn search_trim(&self, transport: &mut dyn Transport, target_khz: u32) -> Result<(u16, u32), IspError> {
        let mut best: Option<(u16, u32)> = None;
        let mut candidate: u32 = 0;
        loop {
            let counter = candidate as u16;
            let mut payload = target_khz.to_be_bytes().to_vec();
            payload.extend_from_slice(&counter.to_be_bytes());
            let response = self.request(transport, self.spec.cmd_trim, payload)?;
            reject_nak(&response)?;
            if response.payload.len() < 2 {
                return Err(IspError::TrimFailed {
                    target_khz,
                    best_error_millis: u32::MAX,
                });
            }
            let achieved_khz = u32::from(u16::from_be_bytes([response.payload[0], response.payload[1]]));
            let permille = error_permille(achieved_khz, target_khz);
            if best.map_or(true, |(_, best_permille)| permille < best_permille) {
                best = Some((counter, permille));
            }
            candidate += u32::from(TRIM_CANDIDATE_STEP);
            if candidate > 0xF000 {
                break;
            }
        }
        Ok(best.expect("at least one candidate is always tried"))
    }

    fn write_image(
        &self,
        transport: &mut dyn Transport,
        command: u8,
        image: &Image,
        fused_options: Option<&[u8]>,
    ) -> Result<(), IspError> {
        let block_size = self.block_size();
        let total_chunks = image.data.len().div_ceil(block_size).max(1);
        let mut chunk_index = 0usize;
        for chunk_start in (0..image.data.len()).step_by(block_size) {
            chunk_index += 1;
            let chunk_end = (chunk_start + block_size).min(image.data.len());
            let mut payload = (image.base + chunk_start as u32).to_be_bytes().to_vec();
            payload.extend_from_slice(&image.data[chunk_start..chunk_end]);
            if chunk_index == total_chunks {
                if let Some(options) = fused_options {
                    payload.extend_from_slice(options);
                }
            }
            let response = self.request(transport, command, payload)?;
            reject_nak(&response)?;
        }
        if image.data.is_empty() {
            if let Some(options) = fused_options {
                let mut payload = image.base.to_be_bytes().to_vec();
                payload.extend_from_slice(options);
                let response = self.request(transport, command, payload)?;
                reject_nak(&response)?;
            }
        }
        Ok(())
    }
}

fn reject_nak(response: &Frame) -> Result<(), IspError> {
    if response.command == 0xFF {
        let code = response.payload.first().copied().unwrap_or(0);
        return Err(IspError::DeviceNak(code));
    }
    Ok(())
}

impl Dialect for Engine {
    fn name(&self) -> &'static str {
        self.spec.dialect_name
    }

    fn detect(&mut self, transport: &mut dyn Transport) -> Result<DeviceIdentity, IspError> {
        let frame = listen(transport, &self.codec, self.spec.framing, ANNOUNCE_TIMEOUT)?;
        self.adopt_announcement(&frame)
    }

    fn switch_baud(&mut self, transport: &mut dyn Transport, target_baud: u32) -> Result<(), IspError> {
        if let Some(fixed) = self.spec.fixed_baud {
            return if target_baud == fixed {
                Ok(())
            } else {
                Err(IspError::Unsupported("baud switch"))
            };
        }
        self.propose_baud(transport, target_baud, true)
    }

    fn trim(&mut self, transport: &mut dyn Transport, target_khz: u32) -> Result<(), IspError> {
        let rc_trim_capable = self.descriptor.is_some_and(|d| d.rc_trim_capable);
        if !rc_trim_capable {
            return Err(IspError::Unsupported("trim"));
        }
        let (best_counter, best_permille) = self.search_trim(transport, target_khz)?;
        if best_permille > TRIM_TOLERANCE_PERMILLE {
            return Err(IspError::TrimFailed {
                target_khz,
                best_error_millis: best_permille,
            });
        }
        let mut payload = target_khz.to_be_bytes().to_vec();
        payload.extend_from_slice(&best_counter.to_be_bytes());
        let response = self.request(transport, self.spec.cmd_trim, payload)?;
        reject_nak(&response)
    }

    fn erase(&mut self, transport: &mut dyn Transport) -> Result<(), IspError> {
        let response = self.request(transport, self.spec.cmd_erase, vec![])?;
        reject_nak(&response)
    }

    fn write_code(
        &mut self,
        transport: &mut dyn Transport,
        image: &Image,
        fused_options: Option<&[u8]>,
    ) -> Result<(), IspError> {
        self.write_image(transport, self.spec.cmd_write_code, image, fused_options)
    }

    fn write_eeprom(
        &mut self,
        transport: &mut dyn Transport,
        image: &Image,
        fused_options: Option<&[u8]>,
    ) -> Result<(), IspError> {
        self.write_image(transport, self.spec.cmd_write_eeprom, image, fused_options)
    }

    fn write_options(&mut self, transport: &mut dyn Transport, options: &[u8]) -> Result<(), IspError> {
        let response = self.request(transport, self.spec.cmd_write_options, options.to_vec())?;
        reject_nak(&response)
    }

    fn fuses_options(&self) -> bool {
        self.spec.fuses_options_with_last_write
    }

    fn terminate(&mut self, transport: &mut dyn Transport) -> Result<(), IspError> {
        let response = self.request(transport, self.spec.cmd_terminate, vec![])?;
        reject_nak(&response)
    }
}
