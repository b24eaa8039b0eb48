//! STC 8051 ISP command-line front end.
//!
//! Owns only the external interface named in §6: argument parsing, wiring
//! a transport and dialect together, and a single-line final report.
//! Progress rendering during a session and the internals of any external
//! reset command are explicitly out of scope here (§1 non-goals) — they
//! belong to whatever shell command `-r` names.

mod args;

use args::{Config, ResetAssertion};
use isp_core::session::{Dialect, DeviceIdentity};
use isp_core::{
    exit_status, hex_dump, load_image, DebugSink, Image, IspError, ProgrammingPlan, ProgrammingSession, ResetLine,
    RetryPolicy, SerialTransport, Stage, Transport, UsbTransport,
};
use isp_dialects::{autodetect, spec_for, Engine};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args::parse(&args) {
        Ok(cfg) => cfg,
        Err(msg) => {
            eprintln!("error: {msg}");
            std::process::exit(1);
        }
    };

    if config.show_help {
        print!("{}", args::HELP_TEXT);
        std::process::exit(0);
    }
    if config.show_version {
        println!("stc-isp {VERSION}");
        std::process::exit(0);
    }

    let result = run(&config);
    if let Err((stage, ref e)) = result {
        eprintln!("error during {stage}: {e}");
    }
    std::process::exit(exit_status(&result.map_err(|(_, e)| e)));
}

fn run(config: &Config) -> Result<(), (Stage, IspError)> {
    let mut transport = open_transport(config)?;

    if config.autoreset {
        transport
            .assert_reset(Duration::from_millis(200))
            .map_err(|e| (Stage::PowerCycle, e.into()))?;
    }

    let debug_sink = debug_sink(config.debug);

    let (mut dialect, identity): (Box<dyn Dialect>, DeviceIdentity) = if config.dialect == "auto" {
        autodetect(transport.as_mut(), debug_sink).map_err(|e| (Stage::Handshake, e))?
    } else {
        let spec = spec_for(&config.dialect).expect("validated by args::parse");
        let mut engine = Engine::new(spec);
        if let Some(sink) = debug_sink {
            engine = engine.with_debug_sink(sink);
        }
        let identity = engine.detect(transport.as_mut()).map_err(|e| (Stage::Handshake, e))?;
        (Box::new(engine), identity)
    };

    if config.debug {
        eprintln!("debug: identified magic {:#06x} via {}", identity.magic, dialect.name());
    }

    let block_size = spec_for(dialect.name()).map_or(128, |s| s.block_size);
    let code_image = load_bounded(config.code_image.as_deref(), identity.code_size, block_size)?;
    let eeprom_image = load_bounded(config.eeprom_image.as_deref(), identity.eeprom_size, block_size)?;
    let options = encode_options(config, dialect.as_ref(), &identity)?;

    let plan = ProgrammingPlan {
        target_baud: config.baud,
        trim_khz: config.trim_khz,
        code_image,
        eeprom_image,
        options,
    };

    let mut session = ProgrammingSession::new(dialect, RetryPolicy::default());
    let outcome = session.run(transport.as_mut(), &plan);
    match outcome.error {
        None => Ok(()),
        Some((stage, e)) => Err((stage, e)),
    }
}

/// Picks the transport backend by dialect: `usb15` opens a USB bulk
/// connection by vendor/product ID, every other named dialect (and `auto`,
/// which only probes UART families) opens the serial port from `-p`.
fn open_transport(config: &Config) -> Result<Box<dyn Transport>, (Stage, IspError)> {
    if config.dialect == "usb15" {
        let transport = UsbTransport::open(config.usb_vid, config.usb_pid, config.usb_ep_out, config.usb_ep_in)
            .map_err(|e| (Stage::Handshake, IspError::LinkLost(e.to_string())))?;
        if config.debug {
            eprintln!(
                "debug: opened USB device {:#06x}:{:#06x}",
                config.usb_vid, config.usb_pid
            );
        }
        return Ok(Box::new(transport));
    }

    let port = config
        .port
        .as_deref()
        .ok_or_else(|| (Stage::Handshake, IspError::LinkLost("no -p/--port given".into())))?;
    let reset_line = match &config.reset_assertion {
        ResetAssertion::Dtr => ResetLine::Dtr,
        ResetAssertion::Rts => ResetLine::Rts,
        ResetAssertion::Command(cmd) => ResetLine::Command(cmd.clone()),
    };
    let transport =
        SerialTransport::open(port, config.handshake_baud, reset_line).map_err(|e| (Stage::Handshake, e.into()))?;
    if config.debug {
        eprintln!("debug: opened {port} at handshake baud {}", config.handshake_baud);
    }
    Ok(Box::new(transport))
}

/// Builds the `-D/--debug` sink: a hex dump of every request/response
/// frame pair, printed to stderr. Rendering lives here, not in the
/// protocol core.
fn debug_sink(enabled: bool) -> Option<DebugSink> {
    if !enabled {
        return None;
    }
    Some(Rc::new(RefCell::new(|req: &isp_core::Frame, resp: &isp_core::Frame| {
        eprintln!(
            "debug: tx cmd {:#04x} [{}]  rx cmd {:#04x} [{}]",
            req.command,
            hex_dump(&req.payload),
            resp.command,
            hex_dump(&resp.payload)
        );
    })))
}

/// Loads `path` (detected as HEX or raw by its own suffix), checks it fits
/// the target region, and pads it to a multiple of the dialect's write
/// block size with `0xFF` (§4.3, invariant 4).
fn load_bounded(path: Option<&str>, region_len: u32, block_size: usize) -> Result<Option<Image>, (Stage, IspError)> {
    let Some(path) = path else { return Ok(None) };
    let bytes = std::fs::read(path).map_err(|e| (Stage::Handshake, IspError::BadImage(format!("{path}: {e}"))))?;
    let mut image = load_image(path, &bytes).map_err(|e| (Stage::Handshake, e))?;
    image.bounds_check(region_len).map_err(|e| (Stage::Handshake, e))?;
    image.pad_to_block(block_size);
    Ok(Some(image))
}

fn encode_options(
    config: &Config,
    dialect: &dyn Dialect,
    identity: &DeviceIdentity,
) -> Result<Option<Vec<u8>>, (Stage, IspError)> {
    if config.options.is_empty() {
        return Ok(None);
    }
    let spec = spec_for(dialect.name()).expect("dialect name always resolves to a spec");
    let requests: Vec<(&str, &str)> = config.options.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let bytes = isp_options::encode(spec.option_table, &identity.current_option_bytes, &requests)
        .map_err(|e| (Stage::WriteOptions, e))?;
    Ok(Some(bytes))
}
