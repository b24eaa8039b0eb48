//! End-to-end scenario tests driving a full [`ProgrammingSession`] through
//! a real [`Engine`] over a scripted [`MockTransport`] (§8 concrete
//! scenarios), the integration-test counterpart to `isp-core`'s and
//! `isp-dialects`' inline unit tests.

use isp_core::session::Dialect;
use isp_core::transport::testutil::MockTransport;
use isp_core::{Frame, FrameCodec, Image, IspError, ProgrammingPlan, ProgrammingSession, RetryPolicy};
use isp_dialects::{spec_for, Engine};

/// 16-byte spontaneous announcement payload (§4.6 step 1): magic, bsl
/// major/minor/suffix, factory trim counter, wakeup counter, 7-byte UID.
fn announcement_payload(magic: u16) -> Vec<u8> {
    let mut p = magic.to_be_bytes().to_vec();
    p.push(7);
    p.push(1);
    p.push(b'S');
    p.extend_from_slice(&[0x00, 0x00]);
    p.extend_from_slice(&[0x00, 0x00]);
    p.extend_from_slice(&[0; 7]);
    p
}

fn ok_frame(command: u8) -> Frame {
    Frame::device(command, vec![])
}

#[test]
fn full_session_over_stc89_succeeds() {
    let spec = spec_for("stc89").unwrap();
    let codec = FrameCodec::new(spec.framing);
    let mut transport = MockTransport::new();

    // Announcement is read passively, never requested.
    transport.push_inbound(&codec.encode(&Frame::device(spec.cmd_detect, announcement_payload(0xF0F0))));
    transport.push_inbound(&codec.encode(&ok_frame(spec.cmd_erase)));
    transport.push_inbound(&codec.encode(&ok_frame(spec.cmd_write_code)));
    transport.push_inbound(&codec.encode(&ok_frame(spec.cmd_terminate)));

    let engine = Engine::new(spec);
    let mut session = ProgrammingSession::new(Box::new(engine), RetryPolicy::default());
    let plan = ProgrammingPlan {
        // STC89 never leaves its 2400-baud handshake rate.
        target_baud: 2400,
        trim_khz: None,
        code_image: Some(Image { base: 0, data: vec![0xAA; 32] }),
        eeprom_image: None,
        options: None,
    };
    let outcome = session.run(&mut transport, &plan);
    assert!(outcome.is_success(), "{outcome:?}");
    // switch_baud is a no-op at the fixed handshake rate: no baud change issued.
    assert!(transport.baud_history.is_empty());
}

#[test]
fn session_recovers_from_one_corrupted_identify_response() {
    let spec = spec_for("stc89").unwrap();
    let codec = FrameCodec::new(spec.framing);
    let mut transport = MockTransport::new();

    let good = codec.encode(&Frame::device(spec.cmd_detect, announcement_payload(0xF0F0)));
    let mut corrupted = good.clone();
    let last = corrupted.len() - 2;
    corrupted[last] ^= 0xFF; // flips a checksum byte, not the terminator
    transport.push_inbound(&corrupted);
    transport.push_inbound(&good);
    transport.push_inbound(&codec.encode(&ok_frame(spec.cmd_erase)));
    transport.push_inbound(&codec.encode(&ok_frame(spec.cmd_terminate)));

    let engine = Engine::new(spec);
    let mut session = ProgrammingSession::new(Box::new(engine), RetryPolicy::default());
    let outcome = session.run(&mut transport, &ProgrammingPlan { target_baud: 2400, ..ProgrammingPlan::default() });
    assert!(outcome.is_success(), "{outcome:?}");
}

#[test]
fn unknown_model_magic_stops_before_any_write() {
    let spec = spec_for("stc89").unwrap();
    let codec = FrameCodec::new(spec.framing);
    let mut transport = MockTransport::new();
    transport.push_inbound(&codec.encode(&Frame::device(spec.cmd_detect, announcement_payload(0x0000))));

    let engine = Engine::new(spec);
    let mut session = ProgrammingSession::new(Box::new(engine), RetryPolicy::default());
    let outcome = session.run(&mut transport, &ProgrammingPlan::default());
    assert!(!outcome.is_success());
    let (_, err) = outcome.error.unwrap();
    assert!(matches!(err, IspError::UnknownModel(0x0000)));
    // The announcement is only ever read, never requested: nothing was written,
    // and terminate is never sent since the handshake itself failed.
    assert!(transport.outbound.is_empty());
}

#[test]
fn image_too_large_for_region_is_rejected_before_any_device_io() {
    let image = Image { base: 0, data: vec![0u8; 0x3000] };
    let err = image.bounds_check(0x2000).unwrap_err();
    assert!(matches!(err, IspError::BadImage(_)));
}
