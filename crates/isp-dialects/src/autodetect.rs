//! The `auto` pseudo-dialect (§4.7): reads the device's single spontaneous
//! announcement and classifies it against a signature table, rather than
//! replaying every dialect's handshake against a device that only ever
//! speaks once. Restricted to the UART dialects — USB15 is always selected
//! explicitly, since it lives on its own bus rather than the shared serial
//! line autodetect listens on.

use crate::common::listen;
use crate::engine::{Engine, ANNOUNCE_TIMEOUT, SPECS};
use isp_core::session::{Dialect, DeviceIdentity};
use isp_core::{DebugSink, Frame, FrameCodec, Framing, IspError};
use isp_core::Transport;
use isp_models::Family;

/// Maps an identify magic to the dialect family(ies) it can belong to.
///
/// Most magics map 1:1, but `0xF5C0` is genuinely ambiguous between the
/// STC12B and STC12 revisions sharing the same announced magic across a
/// documented bootloader-version overlap — autodetect must report that
/// ambiguity rather than silently picking one (§8 scenario 3).
struct Signature {
    magic: u16,
    family: Family,
}

static SIGNATURES: &[Signature] = &[
    Signature { magic: 0xF0F0, family: Family::Stc89 },
    Signature { magic: 0xF2C0, family: Family::Stc12A },
    Signature { magic: 0xF5C0, family: Family::Stc12B },
    Signature { magic: 0xF5C0, family: Family::Stc12 },
    Signature { magic: 0xF6C0, family: Family::Stc12 },
    Signature { magic: 0xF4C0, family: Family::Stc15A },
    Signature { magic: 0xF449, family: Family::Stc15 },
    Signature { magic: 0xF9C0, family: Family::Stc15 },
    Signature { magic: 0xF3C0, family: Family::Stc8 },
];

fn dialect_name_for(family: Family) -> &'static str {
    SPECS
        .iter()
        .find(|s| s.family == family)
        .expect("every family in SIGNATURES has a matching spec")
        .dialect_name
}

/// Reads exactly one announcement frame and commits to the single dialect
/// whose signature matches its magic.
///
/// # Errors
/// `AutodetectAmbiguous` if the magic maps to more than one family;
/// `UnknownModel` if the magic matches none; the underlying transport/frame
/// error if no announcement ever arrives.
pub fn autodetect(
    transport: &mut dyn Transport,
    debug_sink: Option<DebugSink>,
) -> Result<(Box<dyn Dialect>, DeviceIdentity), IspError> {
    let codec = FrameCodec::new(Framing::Uart);
    let frame: Frame = listen(transport, &codec, Framing::Uart, ANNOUNCE_TIMEOUT)?;
    if frame.payload.len() < 2 {
        return Err(IspError::BadImage("device announcement shorter than expected".into()));
    }
    let magic = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);

    let families: Vec<Family> = SIGNATURES.iter().filter(|s| s.magic == magic).map(|s| s.family).collect();

    match families.as_slice() {
        [] => Err(IspError::UnknownModel(magic)),
        [family] => {
            let spec = SPECS
                .iter()
                .find(|s| s.family == *family)
                .expect("every family in SIGNATURES has a matching spec");
            let mut engine = Engine::new(spec);
            if let Some(sink) = &debug_sink {
                engine = engine.with_debug_sink(sink.clone());
            }
            let identity = engine.adopt_announcement(&frame)?;
            Ok((Box::new(engine), identity))
        }
        many => {
            let names: Vec<&'static str> = many.iter().map(|f| dialect_name_for(*f)).collect();
            Err(IspError::AutodetectAmbiguous(names))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spec_for;
    use isp_core::transport::testutil::MockTransport;

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

    #[test]
    fn autodetect_classifies_a_single_announcement() {
        let mut transport = MockTransport::new();
        let codec = FrameCodec::new(Framing::Uart);
        transport.push_inbound(&codec.encode(&Frame::device(0x00, announcement_payload(0xF0F0))));

        let (dialect, identity) = autodetect(&mut transport, None).unwrap();
        assert_eq!(dialect.name(), spec_for("stc89").unwrap().dialect_name);
        assert_eq!(identity.magic, 0xF0F0);
        // Only the one announcement is read; nothing is written back.
        assert!(transport.outbound.is_empty());
    }

    #[test]
    fn autodetect_reports_ambiguity_for_an_overlapping_magic() {
        let mut transport = MockTransport::new();
        let codec = FrameCodec::new(Framing::Uart);
        transport.push_inbound(&codec.encode(&Frame::device(0x00, announcement_payload(0xF5C0))));

        let err = autodetect(&mut transport, None).unwrap_err();
        match err {
            IspError::AutodetectAmbiguous(candidates) => {
                assert!(candidates.contains(&"stc12b"));
                assert!(candidates.contains(&"stc12"));
            }
            other => panic!("expected AutodetectAmbiguous, got {other:?}"),
        }
    }

    #[test]
    fn autodetect_rejects_an_unknown_magic() {
        let mut transport = MockTransport::new();
        let codec = FrameCodec::new(Framing::Uart);
        transport.push_inbound(&codec.encode(&Frame::device(0x00, announcement_payload(0x1234))));

        let err = autodetect(&mut transport, None).unwrap_err();
        assert!(matches!(err, IspError::UnknownModel(0x1234)));
    }

    #[test]
    fn autodetect_fails_when_nothing_answers() {
        let mut transport = MockTransport::new();
        let err = autodetect(&mut transport, None).unwrap_err();
        assert!(matches!(err, IspError::LinkLost(_)));
    }
}
