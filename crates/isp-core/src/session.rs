//! Programming-session orchestration: the common choreography shared by
//! every dialect (§4.6), driven through the [`Dialect`] trait so one run
//! loop can drive any family without knowing its internals.

use crate::error::{FrameError, IspError, Stage};
use crate::image::Image;
use crate::transport::Transport;
use std::fmt;

/// A parsed bootloader version string, e.g. `7.1S` (§3 "bsl_version_string").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BslVersion {
    pub major: u8,
    pub minor: u8,
    pub suffix: char,
}

impl fmt::Display for BslVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.major, self.minor, self.suffix)
    }
}

/// Target state established by a dialect's handshake (§3 "Target state").
/// Mutated monotonically as the session progresses and discarded at
/// session end; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub magic: u16,
    pub model_name: &'static str,
    pub code_size: u32,
    pub eeprom_size: u32,
    pub bsl_version: BslVersion,
    pub factory_freq_hz: u32,
    pub factory_trim_counter: u16,
    pub wakeup_freq_hz: Option<u32>,
    pub uid: Option<[u8; 7]>,
    pub current_option_bytes: Vec<u8>,
    pub current_baud: u32,
}

/// Capability set every dialect engine implements (§4.6). The session
/// orchestrator only ever calls through this trait.
pub trait Dialect {
    fn name(&self) -> &'static str;
    fn detect(&mut self, transport: &mut dyn Transport) -> Result<DeviceIdentity, IspError>;
    fn switch_baud(&mut self, transport: &mut dyn Transport, target_baud: u32) -> Result<(), IspError>;
    fn trim(&mut self, transport: &mut dyn Transport, target_khz: u32) -> Result<(), IspError>;
    fn erase(&mut self, transport: &mut dyn Transport) -> Result<(), IspError>;
    /// `fused_options`, when `Some`, must be appended to this write's final
    /// block rather than sent as a separate `write_options` frame — the
    /// orchestrator only ever passes `Some` here when [`Dialect::fuses_options`]
    /// is true and this is the last write stage the plan requests (§4.6 step 7).
    fn write_code(
        &mut self,
        transport: &mut dyn Transport,
        image: &Image,
        fused_options: Option<&[u8]>,
    ) -> Result<(), IspError>;
    fn write_eeprom(
        &mut self,
        transport: &mut dyn Transport,
        image: &Image,
        fused_options: Option<&[u8]>,
    ) -> Result<(), IspError>;
    fn write_options(&mut self, transport: &mut dyn Transport, options: &[u8]) -> Result<(), IspError>;
    /// True for dialects (STC89, STC12A) whose option bytes must not be
    /// committed as a separate frame and are instead fused into the
    /// payload of the last code/eeprom write (§4.6 step 7).
    fn fuses_options(&self) -> bool;
    /// Best-effort: a terminate failure never changes the session's final outcome.
    fn terminate(&mut self, transport: &mut dyn Transport) -> Result<(), IspError>;
}

impl std::fmt::Debug for dyn Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Dialect").field("name", &self.name()).finish()
    }
}

/// The work requested of a session; any field left `None` skips that stage.
#[derive(Debug, Clone, Default)]
pub struct ProgrammingPlan {
    pub target_baud: u32,
    pub trim_khz: Option<u32>,
    pub code_image: Option<Image>,
    pub eeprom_image: Option<Image>,
    pub options: Option<Vec<u8>>,
}

/// The point the session reached before stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Waiting,
    Identified,
    BaudSwitched,
    Trimmed,
    Erased,
    CodeWritten,
    EepromWritten,
    OptionsWritten,
    Terminated,
}

/// Retry policy for transient frame errors during the handshake and each
/// command (§7): corrupted checksums and truncated reads are retried up to
/// `max_attempts`; malformed preambles and length-out-of-range are not,
/// since they indicate the wrong dialect rather than line noise.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn is_retryable(error: &IspError) -> bool {
        matches!(
            error,
            IspError::Frame(FrameError::ChecksumMismatch | FrameError::Truncated) | IspError::LinkLost(_)
        )
    }

    fn run<T>(&self, mut attempt: impl FnMut() -> Result<T, IspError>) -> Result<T, IspError> {
        let mut last_err = None;
        for _ in 0..self.max_attempts {
            match attempt() {
                Ok(v) => return Ok(v),
                Err(e) if Self::is_retryable(&e) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("max_attempts >= 1"))
    }
}

/// Result of running a full session: the last state reached, and the error
/// (if any) that stopped forward progress. `terminate` is always attempted
/// once the device has been identified, regardless of where the plan failed.
#[derive(Debug)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub error: Option<(Stage, IspError)>,
}

impl SessionOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.state == SessionState::Terminated
    }
}

pub struct ProgrammingSession {
    dialect: Box<dyn Dialect>,
    retry: RetryPolicy,
}

impl ProgrammingSession {
    #[must_use]
    pub fn new(dialect: Box<dyn Dialect>, retry: RetryPolicy) -> Self {
        Self { dialect, retry }
    }

    /// Drives the full choreography: handshake, baud switch, optional trim,
    /// erase, optional code/eeprom/option writes, terminate. Stops at the
    /// first non-retryable failure but still attempts `terminate` if the
    /// device was at least identified, so the target is left runnable.
    ///
    /// Option bytes are fused into the last code/eeprom write instead of
    /// sent as a separate `write_options` frame whenever
    /// [`Dialect::fuses_options`] is true and a write of that kind is part
    /// of the plan (§4.6 step 7); the eeprom write is preferred as the fuse
    /// target since it is always the later of the two stages when both run.
    pub fn run(&mut self, transport: &mut dyn Transport, plan: &ProgrammingPlan) -> SessionOutcome {
        let mut state = SessionState::Waiting;

        let identity = match self.retry.run(|| self.dialect.detect(transport)) {
            Ok(identity) => identity,
            Err(e) => return SessionOutcome { state, error: Some((Stage::Handshake, e)) },
        };
        state = SessionState::Identified;
        let _ = identity;

        if let Err(e) = self.retry.run(|| self.dialect.switch_baud(transport, plan.target_baud)) {
            return self.finish_with_error(transport, state, Stage::BaudSwitch, e);
        }
        state = SessionState::BaudSwitched;

        if let Some(khz) = plan.trim_khz {
            if let Err(e) = self.retry.run(|| self.dialect.trim(transport, khz)) {
                return self.finish_with_error(transport, state, Stage::Trim, e);
            }
            state = SessionState::Trimmed;
        }

        if let Err(e) = self.retry.run(|| self.dialect.erase(transport)) {
            return self.finish_with_error(transport, state, Stage::Erase, e);
        }
        state = SessionState::Erased;

        let fuses = self.dialect.fuses_options();
        let options = plan.options.as_deref();
        let fuse_into_eeprom = fuses && options.is_some() && plan.eeprom_image.is_some();
        let fuse_into_code = fuses && options.is_some() && plan.code_image.is_some() && !fuse_into_eeprom;

        if let Some(image) = &plan.code_image {
            let fused = if fuse_into_code { options } else { None };
            if let Err(e) = self.retry.run(|| self.dialect.write_code(transport, image, fused)) {
                return self.finish_with_error(transport, state, Stage::WriteCode, e);
            }
            state = SessionState::CodeWritten;
        }

        if let Some(image) = &plan.eeprom_image {
            let fused = if fuse_into_eeprom { options } else { None };
            if let Err(e) = self.retry.run(|| self.dialect.write_eeprom(transport, image, fused)) {
                return self.finish_with_error(transport, state, Stage::WriteEeprom, e);
            }
            state = SessionState::EepromWritten;
        }

        if let Some(options) = options {
            if !(fuse_into_code || fuse_into_eeprom) {
                if let Err(e) = self.retry.run(|| self.dialect.write_options(transport, options)) {
                    return self.finish_with_error(transport, state, Stage::WriteOptions, e);
                }
            }
            state = SessionState::OptionsWritten;
        }

        match self.dialect.terminate(transport) {
            Ok(()) => SessionOutcome {
                state: SessionState::Terminated,
                error: None,
            },
            Err(e) => SessionOutcome {
                state,
                error: Some((Stage::Terminate, e)),
            },
        }
    }

    /// After a non-retryable failure past the handshake, still try to leave
    /// the device running rather than stranding it mid-erase.
    fn finish_with_error(
        &mut self,
        transport: &mut dyn Transport,
        state: SessionState,
        stage: Stage,
        error: IspError,
    ) -> SessionOutcome {
        let _ = self.dialect.terminate(transport);
        SessionOutcome {
            state,
            error: Some((stage, error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testutil::MockTransport;

    struct StubDialect {
        fail_at: Option<&'static str>,
        fuses_options: bool,
        calls: Vec<&'static str>,
        fused_payload_seen: Option<bool>,
    }

    impl StubDialect {
        fn new(fail_at: Option<&'static str>) -> Self {
            Self { fail_at, fuses_options: false, calls: Vec::new(), fused_payload_seen: None }
        }

        fn fusing(mut self) -> Self {
            self.fuses_options = true;
            self
        }

        fn check(&mut self, name: &'static str) -> Result<(), IspError> {
            self.calls.push(name);
            if self.fail_at == Some(name) {
                Err(IspError::Unsupported(name))
            } else {
                Ok(())
            }
        }

        fn stub_identity() -> DeviceIdentity {
            DeviceIdentity {
                magic: 0xABCD,
                model_name: "STUB",
                code_size: 0x2000,
                eeprom_size: 0x200,
                bsl_version: BslVersion { major: 1, minor: 0, suffix: 'A' },
                factory_freq_hz: 11_059_200,
                factory_trim_counter: 0,
                wakeup_freq_hz: None,
                uid: None,
                current_option_bytes: vec![0],
                current_baud: 2400,
            }
        }
    }

    impl Dialect for StubDialect {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn detect(&mut self, _t: &mut dyn Transport) -> Result<DeviceIdentity, IspError> {
            self.check("detect")?;
            Ok(Self::stub_identity())
        }

        fn switch_baud(&mut self, _t: &mut dyn Transport, _baud: u32) -> Result<(), IspError> {
            self.check("switch_baud")
        }

        fn trim(&mut self, _t: &mut dyn Transport, _khz: u32) -> Result<(), IspError> {
            self.check("trim")
        }

        fn erase(&mut self, _t: &mut dyn Transport) -> Result<(), IspError> {
            self.check("erase")
        }

        fn write_code(
            &mut self,
            _t: &mut dyn Transport,
            _image: &Image,
            fused_options: Option<&[u8]>,
        ) -> Result<(), IspError> {
            self.fused_payload_seen = Some(fused_options.is_some());
            self.check("write_code")
        }

        fn write_eeprom(
            &mut self,
            _t: &mut dyn Transport,
            _image: &Image,
            fused_options: Option<&[u8]>,
        ) -> Result<(), IspError> {
            self.fused_payload_seen = Some(fused_options.is_some());
            self.check("write_eeprom")
        }

        fn write_options(&mut self, _t: &mut dyn Transport, _options: &[u8]) -> Result<(), IspError> {
            self.check("write_options")
        }

        fn fuses_options(&self) -> bool {
            self.fuses_options
        }

        fn terminate(&mut self, _t: &mut dyn Transport) -> Result<(), IspError> {
            self.check("terminate")
        }
    }

    #[test]
    fn successful_session_visits_every_stage_in_order() {
        let dialect = StubDialect::new(None);
        let mut session = ProgrammingSession::new(Box::new(dialect), RetryPolicy::default());
        let mut transport = MockTransport::new();
        let plan = ProgrammingPlan {
            target_baud: 115_200,
            trim_khz: Some(11_059),
            code_image: Some(Image { base: 0, data: vec![0; 16] }),
            eeprom_image: Some(Image { base: 0, data: vec![0; 4] }),
            options: Some(vec![0xFF]),
        };
        let outcome = session.run(&mut transport, &plan);
        assert!(outcome.is_success());
        assert_eq!(outcome.state, SessionState::Terminated);
    }

    #[test]
    fn non_fusing_dialect_sends_separate_write_options() {
        let dialect = StubDialect::new(None);
        let mut session = ProgrammingSession::new(Box::new(dialect), RetryPolicy::default());
        let mut transport = MockTransport::new();
        let plan = ProgrammingPlan {
            target_baud: 115_200,
            trim_khz: None,
            code_image: Some(Image { base: 0, data: vec![0; 16] }),
            eeprom_image: None,
            options: Some(vec![0xFF]),
        };
        let outcome = session.run(&mut transport, &plan);
        assert!(outcome.is_success());
    }

    #[test]
    fn fusing_dialect_never_issues_a_separate_options_frame() {
        // A StubDialect that panics if write_options is ever called.
        struct PanicsOnSeparateOptions(StubDialect);
        impl Dialect for PanicsOnSeparateOptions {
            fn name(&self) -> &'static str {
                self.0.name()
            }
            fn detect(&mut self, t: &mut dyn Transport) -> Result<DeviceIdentity, IspError> {
                self.0.detect(t)
            }
            fn switch_baud(&mut self, t: &mut dyn Transport, b: u32) -> Result<(), IspError> {
                self.0.switch_baud(t, b)
            }
            fn trim(&mut self, t: &mut dyn Transport, k: u32) -> Result<(), IspError> {
                self.0.trim(t, k)
            }
            fn erase(&mut self, t: &mut dyn Transport) -> Result<(), IspError> {
                self.0.erase(t)
            }
            fn write_code(
                &mut self,
                t: &mut dyn Transport,
                i: &Image,
                fused: Option<&[u8]>,
            ) -> Result<(), IspError> {
                self.0.write_code(t, i, fused)
            }
            fn write_eeprom(
                &mut self,
                t: &mut dyn Transport,
                i: &Image,
                fused: Option<&[u8]>,
            ) -> Result<(), IspError> {
                self.0.write_eeprom(t, i, fused)
            }
            fn write_options(&mut self, _t: &mut dyn Transport, _options: &[u8]) -> Result<(), IspError> {
                panic!("fusing dialect must not call write_options separately");
            }
            fn fuses_options(&self) -> bool {
                true
            }
            fn terminate(&mut self, t: &mut dyn Transport) -> Result<(), IspError> {
                self.0.terminate(t)
            }
        }

        let dialect = PanicsOnSeparateOptions(StubDialect::new(None).fusing());
        let mut session = ProgrammingSession::new(Box::new(dialect), RetryPolicy::default());
        let mut transport = MockTransport::new();
        let plan = ProgrammingPlan {
            target_baud: 115_200,
            trim_khz: None,
            code_image: Some(Image { base: 0, data: vec![0; 16] }),
            eeprom_image: None,
            options: Some(vec![0xFF]),
        };
        let outcome = session.run(&mut transport, &plan);
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(outcome.state, SessionState::Terminated);
    }

    #[test]
    fn failure_mid_plan_still_attempts_terminate() {
        let dialect = StubDialect::new(Some("write_code"));
        let mut session = ProgrammingSession::new(Box::new(dialect), RetryPolicy::default());
        let mut transport = MockTransport::new();
        let plan = ProgrammingPlan {
            target_baud: 115_200,
            trim_khz: None,
            code_image: Some(Image { base: 0, data: vec![0; 16] }),
            eeprom_image: None,
            options: None,
        };
        let outcome = session.run(&mut transport, &plan);
        assert!(!outcome.is_success());
        assert_eq!(outcome.state, SessionState::Erased);
        assert_eq!(outcome.error.unwrap().0, Stage::WriteCode);
    }

    #[test]
    fn failed_handshake_skips_terminate() {
        let dialect = StubDialect::new(Some("detect"));
        let mut session = ProgrammingSession::new(Box::new(dialect), RetryPolicy::default());
        let mut transport = MockTransport::new();
        let plan = ProgrammingPlan::default();
        let outcome = session.run(&mut transport, &plan);
        assert!(!outcome.is_success());
        assert_eq!(outcome.state, SessionState::Waiting);
    }

    #[test]
    fn retry_policy_recovers_from_transient_checksum_errors() {
        let mut attempts = 0;
        let policy = RetryPolicy { max_attempts: 3 };
        let result: Result<(), IspError> = policy.run(|| {
            attempts += 1;
            if attempts < 2 {
                Err(IspError::Frame(FrameError::ChecksumMismatch))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(attempts, 2);
    }

    #[test]
    fn retry_policy_does_not_retry_preamble_mismatch() {
        let mut attempts = 0;
        let policy = RetryPolicy { max_attempts: 3 };
        let result: Result<(), IspError> = policy.run(|| {
            attempts += 1;
            Err(IspError::Frame(FrameError::PreambleMismatch))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn bsl_version_displays_major_minor_suffix() {
        let v = BslVersion { major: 7, minor: 1, suffix: 'S' };
        assert_eq!(v.to_string(), "7.1S");
    }
}
