//! Command-line argument parsing (§6 external interfaces). A hand-rolled
//! loop over `std::env::args()` — no argument-parsing crate.

/// Which hardware line (or external shell command) asserts reset, as named
/// on the CLI. Distinct from `isp_core::ResetLine` so this module has no
/// dependency on `isp-core` beyond what it needs to describe user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetAssertion {
    Dtr,
    Rts,
    Command(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub code_image: Option<String>,
    pub eeprom_image: Option<String>,
    pub autoreset: bool,
    pub reset_assertion: ResetAssertion,
    pub dialect: String,
    pub port: Option<String>,
    pub baud: u32,
    pub handshake_baud: u32,
    pub options: Vec<(String, String)>,
    pub trim_khz: Option<u32>,
    pub debug: bool,
    pub show_help: bool,
    pub show_version: bool,
    pub usb_vid: u16,
    pub usb_pid: u16,
    pub usb_ep_out: u8,
    pub usb_ep_in: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            code_image: None,
            eeprom_image: None,
            autoreset: false,
            reset_assertion: ResetAssertion::Dtr,
            dialect: "auto".to_string(),
            port: None,
            baud: 19200,
            handshake_baud: 2400,
            options: Vec::new(),
            trim_khz: None,
            debug: false,
            show_help: false,
            show_version: false,
            usb_vid: 0x4348,
            usb_pid: 0x5537,
            usb_ep_out: 0x02,
            usb_ep_in: 0x82,
        }
    }
}

const DIALECTS: &[&str] = &[
    "stc89", "stc12a", "stc12b", "stc12", "stc15a", "stc15", "stc8", "usb15", "auto",
];

/// Parses a full argument list (excluding argv[0]).
///
/// # Errors
/// A human-readable message naming the offending flag or value.
pub fn parse(args: &[String]) -> Result<Config, String> {
    let mut cfg = Config::default();
    let mut positionals: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-h" | "--help" => cfg.show_help = true,
            "-V" | "--version" => cfg.show_version = true,
            "-D" | "--debug" => cfg.debug = true,
            "-a" | "--autoreset" => cfg.autoreset = true,
            "-A" => {
                let value = next_value(args, &mut i, "-A")?;
                cfg.reset_assertion = match value.as_str() {
                    "dtr" => ResetAssertion::Dtr,
                    "rts" => ResetAssertion::Rts,
                    other => return Err(format!("-A expects dtr|rts, got '{other}'")),
                };
            }
            "-r" | "--resetcmd" => {
                let value = next_value(args, &mut i, arg)?;
                cfg.reset_assertion = ResetAssertion::Command(value);
            }
            "-P" => {
                let value = next_value(args, &mut i, "-P")?;
                if !DIALECTS.contains(&value.as_str()) {
                    return Err(format!("-P expects one of {}, got '{value}'", DIALECTS.join("|")));
                }
                cfg.dialect = value;
            }
            "-p" | "--port" => cfg.port = Some(next_value(args, &mut i, arg)?),
            "-b" | "--baud" => cfg.baud = parse_u32(&next_value(args, &mut i, arg)?, arg)?,
            "-l" | "--handshake" => cfg.handshake_baud = parse_u32(&next_value(args, &mut i, arg)?, arg)?,
            "-t" | "--trim" => cfg.trim_khz = Some(parse_u32(&next_value(args, &mut i, arg)?, arg)?),
            "-o" | "--option" => {
                let value = next_value(args, &mut i, arg)?;
                let (key, val) = value
                    .split_once('=')
                    .ok_or_else(|| format!("-o expects KEY=VALUE, got '{value}'"))?;
                cfg.options.push((key.to_string(), val.to_string()));
            }
            "--usb-vid" => cfg.usb_vid = parse_hex_u16(&next_value(args, &mut i, arg)?, arg)?,
            "--usb-pid" => cfg.usb_pid = parse_hex_u16(&next_value(args, &mut i, arg)?, arg)?,
            "--usb-ep-out" => cfg.usb_ep_out = parse_u32(&next_value(args, &mut i, arg)?, arg)? as u8,
            "--usb-ep-in" => cfg.usb_ep_in = parse_u32(&next_value(args, &mut i, arg)?, arg)? as u8,
            other if other.starts_with('-') && other != "-" => {
                return Err(format!("unrecognized flag '{other}'"));
            }
            other => positionals.push(other),
        }
        i += 1;
    }

    if cfg.show_help || cfg.show_version {
        return Ok(cfg);
    }

    if positionals.len() > 2 {
        return Err(format!("expected at most 2 positional image paths, got {}", positionals.len()));
    }
    cfg.code_image = positionals.first().map(|s| (*s).to_string());
    cfg.eeprom_image = positionals.get(1).map(|s| (*s).to_string());

    Ok(cfg)
}

fn next_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i).cloned().ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_u32(raw: &str, flag: &str) -> Result<u32, String> {
    raw.parse::<u32>().map_err(|_| format!("{flag} expects a number, got '{raw}'"))
}

fn parse_hex_u16(raw: &str, flag: &str) -> Result<u16, String> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u16::from_str_radix(digits, 16).map_err(|_| format!("{flag} expects a hex value, got '{raw}'"))
}

pub const HELP_TEXT: &str = "\
Usage: stc-isp [options] [code_image] [eeprom_image]

  -P dialect        stc89|stc12a|stc12b|stc12|stc15a|stc15|stc8|usb15|auto (default auto)
  -p, --port DEV    serial port device
  -b, --baud N      transfer baud rate (default 19200)
  -l, --handshake N handshake baud rate (default 2400)
  -o, --option K=V  set a device option (repeatable)
  -t, --trim KHZ    trim internal RC oscillator to KHZ
  -a, --autoreset   toggle reset line automatically
  -A dtr|rts        which line autoreset toggles (default dtr)
  -r, --resetcmd SH shell command to run instead of a reset line
  --usb-vid HEX     USB vendor ID for the usb15 dialect (default 0x4348)
  --usb-pid HEX     USB product ID for the usb15 dialect (default 0x5537)
  --usb-ep-out N    USB bulk OUT endpoint (default 2)
  --usb-ep-in N     USB bulk IN endpoint (default 130)
  -D, --debug       print diagnostic frames to stderr
  -V, --version     print version and exit
  -h, --help        print this help and exit
";

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = parse(&argv(&[])).unwrap();
        assert_eq!(cfg.dialect, "auto");
        assert_eq!(cfg.baud, 19200);
        assert_eq!(cfg.handshake_baud, 2400);
        assert!(!cfg.autoreset);
    }

    #[test]
    fn positionals_become_code_and_eeprom_images() {
        let cfg = parse(&argv(&["code.hex", "eeprom.bin"])).unwrap();
        assert_eq!(cfg.code_image.as_deref(), Some("code.hex"));
        assert_eq!(cfg.eeprom_image.as_deref(), Some("eeprom.bin"));
    }

    #[test]
    fn rejects_too_many_positionals() {
        assert!(parse(&argv(&["a", "b", "c"])).is_err());
    }

    #[test]
    fn rejects_unknown_dialect() {
        assert!(parse(&argv(&["-P", "bogus"])).is_err());
    }

    #[test]
    fn parses_repeated_options() {
        let cfg = parse(&argv(&["-o", "reset_pin_enabled=on", "-o", "brownout_threshold=3v3"])).unwrap();
        assert_eq!(cfg.options.len(), 2);
        assert_eq!(cfg.options[0], ("reset_pin_enabled".to_string(), "on".to_string()));
    }

    #[test]
    fn rejects_option_without_equals() {
        assert!(parse(&argv(&["-o", "noequals"])).is_err());
    }

    #[test]
    fn rejects_unrecognized_flag() {
        assert!(parse(&argv(&["--bogus"])).is_err());
    }

    #[test]
    fn resetcmd_overrides_reset_assertion() {
        let cfg = parse(&argv(&["-r", "echo reset"])).unwrap();
        assert_eq!(cfg.reset_assertion, ResetAssertion::Command("echo reset".to_string()));
    }

    #[test]
    fn help_flag_short_circuits_positional_validation() {
        let cfg = parse(&argv(&["-h", "a", "b", "c"])).unwrap();
        assert!(cfg.show_help);
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(parse(&argv(&["-b"])).is_err());
    }

    #[test]
    fn rejects_non_numeric_baud() {
        assert!(parse(&argv(&["-b", "fast"])).is_err());
    }
}
