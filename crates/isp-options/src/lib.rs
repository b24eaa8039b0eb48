//! Device option registry (§4.5): named fuse-like fields that pack into a
//! shared options byte array. Validation — domain membership and
//! cross-field predicates — runs entirely offline, before any device I/O.
//! Each dialect family gets its own [`OptionTable`]: byte width and field
//! layout genuinely differ across P89/P12A/P12/P12B/P15A/P15/P8 (§4.6).

use isp_core::IspError;
use isp_models::Family;
use std::collections::BTreeMap;

/// The set of values a field accepts.
#[derive(Debug, Clone, Copy)]
pub enum Domain {
    Bool,
    Enum(&'static [(&'static str, u8)]),
    Range(u8, u8),
    /// A divisor that must be a power of two, capped at `max_divisor`.
    /// Stored as its base-2 log so a 3-bit field covers divisors up to 128.
    /// Rejects non-power-of-two input such as `5` (§3, §8 scenario 4).
    PowerOfTwo { max_divisor: u32 },
    /// A byte count that must be an exact multiple of `unit`, capped at
    /// `max`. Stored as `value / unit`. Used by P8's `program_eeprom_split`.
    Multiple { unit: u32, max: u32 },
}

impl Domain {
    fn parse(&self, raw: &str) -> Option<u8> {
        match self {
            Self::Bool => match raw {
                "on" | "true" | "1" => Some(1),
                "off" | "false" | "0" => Some(0),
                _ => None,
            },
            Self::Enum(variants) => variants.iter().find(|(name, _)| *name == raw).map(|(_, v)| *v),
            Self::Range(lo, hi) => raw.parse::<u8>().ok().filter(|v| v >= lo && v <= hi),
            Self::PowerOfTwo { max_divisor } => {
                let value: u32 = raw.parse().ok()?;
                if value == 0 || !value.is_power_of_two() || value > *max_divisor {
                    return None;
                }
                Some(value.trailing_zeros() as u8)
            }
            Self::Multiple { unit, max } => {
                let value: u32 = raw.parse().ok()?;
                if value == 0 || value % unit != 0 || value > *max {
                    return None;
                }
                u8::try_from(value / unit).ok()
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Bool => "on|off".to_string(),
            Self::Enum(variants) => variants.iter().map(|(n, _)| *n).collect::<Vec<_>>().join("|"),
            Self::Range(lo, hi) => format!("{lo}..={hi}"),
            Self::PowerOfTwo { max_divisor } => format!("a power of two up to {max_divisor}"),
            Self::Multiple { unit, max } => format!("a multiple of {unit} up to {max}"),
        }
    }
}

/// One named bit-field packed into the shared options byte array. Several
/// fields commonly share a byte (`byte_index`), distinguished by `mask`/`shift`.
#[derive(Debug)]
pub struct OptionField {
    pub name: &'static str,
    pub byte_index: usize,
    pub mask: u8,
    pub shift: u8,
    pub domain: Domain,
    /// Fields this one's non-default value depends on, e.g.
    /// `watchdog_prescale` depends on `watchdog_por_enabled`. Checked after
    /// every field in a request is parsed, not per-field, so order in the
    /// `-o` argument list never matters.
    pub requires: &'static [(&'static str, u8)],
}

/// The set of fields and the byte array length for one dialect family.
#[derive(Debug)]
pub struct OptionTable {
    pub family: Family,
    pub byte_len: usize,
    pub fields: &'static [OptionField],
}

fn field<'a>(table: &'a OptionTable, name: &str) -> Option<&'a OptionField> {
    table.fields.iter().find(|f| f.name == name)
}

/// Parses a single `KEY=VALUE` CLI argument into its raw parts.
///
/// # Errors
/// Returns `BadOption` if there is no `=`.
pub fn split_kv(arg: &str) -> Result<(&str, &str), IspError> {
    arg.split_once('=')
        .ok_or_else(|| IspError::BadOption(format!("expected KEY=VALUE, got '{arg}'")))
}

/// Parses and validates a batch of `KEY=VALUE` options against `table`,
/// returning the encoded byte array seeded from `defaults`. Every field is
/// validated — domain membership, then cross-field `requires` predicates —
/// before any byte is written, so a single bad option rejects the whole
/// batch with no partial state.
///
/// # Errors
/// `BadOption` naming the offending key for unknown fields, out-of-domain
/// values, or unmet cross-field requirements.
pub fn encode(table: &OptionTable, defaults: &[u8], requests: &[(&str, &str)]) -> Result<Vec<u8>, IspError> {
    if defaults.len() != table.byte_len {
        return Err(IspError::BadOption(format!(
            "default option array has {} bytes, dialect expects {}",
            defaults.len(),
            table.byte_len
        )));
    }

    let mut parsed: BTreeMap<&str, u8> = BTreeMap::new();
    for (key, raw) in requests {
        let f = field(table, key).ok_or_else(|| IspError::BadOption(format!("unknown option '{key}'")))?;
        let value = f
            .domain
            .parse(raw)
            .ok_or_else(|| IspError::BadOption(format!("'{key}' expects {}, got '{raw}'", f.domain.describe())))?;
        parsed.insert(key, value);
    }

    for f in table.fields {
        let Some(&value) = parsed.get(f.name) else { continue };
        for (dep_name, required_value) in f.requires {
            let dep_value = parsed
                .get(dep_name)
                .copied()
                .or_else(|| Some(read_field(defaults, field(table, dep_name)?)))
                .unwrap_or(0);
            if dep_value != *required_value && value != 0 {
                return Err(IspError::BadOption(format!(
                    "'{}' requires '{dep_name}' to be set first",
                    f.name
                )));
            }
        }
    }

    let mut bytes = defaults.to_vec();
    for (key, value) in parsed {
        let f = field(table, key).expect("validated above");
        write_field(&mut bytes, f, value);
    }
    Ok(bytes)
}

/// Decodes every field in `table` out of `bytes`, in table order.
///
/// # Panics
/// Panics if `bytes.len() != table.byte_len`; callers own that invariant.
#[must_use]
pub fn decode(table: &OptionTable, bytes: &[u8]) -> Vec<(&'static str, u8)> {
    assert_eq!(bytes.len(), table.byte_len, "option byte array length mismatch");
    table.fields.iter().map(|f| (f.name, read_field(bytes, f))).collect()
}

fn read_field(bytes: &[u8], f: &OptionField) -> u8 {
    (bytes[f.byte_index] & f.mask) >> f.shift
}

fn write_field(bytes: &mut [u8], f: &OptionField, value: u8) {
    bytes[f.byte_index] = (bytes[f.byte_index] & !f.mask) | ((value << f.shift) & f.mask);
}

/// Looks up the option table for a family. Every family in [`Family`] has
/// exactly one table.
#[must_use]
pub fn table_for_family(family: Family) -> &'static OptionTable {
    match family {
        Family::Stc89 => &P89_TABLE,
        Family::Stc12A => &P12A_TABLE,
        Family::Stc12B => &P12B_TABLE,
        Family::Stc12 => &P12_TABLE,
        Family::Stc15A => &P15A_TABLE,
        Family::Stc15 => &P15_TABLE,
        Family::Stc8 => &P8_TABLE,
        Family::Usb15 => &USB15_TABLE,
    }
}

/// P89: a single byte packs reset-pin, watchdog-on-reset, and clock source
/// (§4.6 "options encoded in a single byte").
const P89_FIELDS: &[OptionField] = &[
    OptionField {
        name: "reset_pin_enabled",
        byte_index: 0,
        mask: 0b0000_0001,
        shift: 0,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "watchdog_por_enabled",
        byte_index: 0,
        mask: 0b0000_0010,
        shift: 1,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "clock_source",
        byte_index: 0,
        mask: 0b0000_1100,
        shift: 2,
        domain: Domain::Enum(&[("internal", 0), ("external", 1)]),
        requires: &[],
    },
];

pub static P89_TABLE: OptionTable = OptionTable {
    family: Family::Stc89,
    byte_len: 1,
    fields: P89_FIELDS,
};

/// P12A: also a single byte, plus a brownout threshold (UID readout is a
/// dialect capability, not an option byte, so it has no field here).
const P12A_FIELDS: &[OptionField] = &[
    OptionField {
        name: "reset_pin_enabled",
        byte_index: 0,
        mask: 0b0000_0001,
        shift: 0,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "watchdog_por_enabled",
        byte_index: 0,
        mask: 0b0000_0010,
        shift: 1,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "brownout_threshold",
        byte_index: 0,
        mask: 0b0000_1100,
        shift: 2,
        domain: Domain::Enum(&[("2v7", 0), ("3v3", 1), ("4v5", 2), ("6v", 3)]),
        requires: &[],
    },
];

pub static P12A_TABLE: OptionTable = OptionTable {
    family: Family::Stc12A,
    byte_len: 1,
    fields: P12A_FIELDS,
};

/// P12/P12B: two bytes — byte 0 packs the same flags as P12A, byte 1 adds a
/// watchdog prescale (§4.6 "options two bytes"). Shared by both families
/// since neither spec section nor the model database distinguishes their
/// option layout, only their magic/block-size handling.
const P12_FIELDS: &[OptionField] = &[
    OptionField {
        name: "reset_pin_enabled",
        byte_index: 0,
        mask: 0b0000_0001,
        shift: 0,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "watchdog_por_enabled",
        byte_index: 0,
        mask: 0b0000_0010,
        shift: 1,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "brownout_threshold",
        byte_index: 0,
        mask: 0b0000_1100,
        shift: 2,
        domain: Domain::Enum(&[("2v7", 0), ("3v3", 1), ("4v5", 2), ("6v", 3)]),
        requires: &[],
    },
    OptionField {
        name: "watchdog_prescale",
        byte_index: 1,
        mask: 0b0111_1111,
        shift: 0,
        domain: Domain::PowerOfTwo { max_divisor: 128 },
        requires: &[("watchdog_por_enabled", 1)],
    },
];

pub static P12_TABLE: OptionTable = OptionTable {
    family: Family::Stc12,
    byte_len: 2,
    fields: P12_FIELDS,
};

pub static P12B_TABLE: OptionTable = OptionTable {
    family: Family::Stc12B,
    byte_len: 2,
    fields: P12_FIELDS,
};

/// P15A/P15/U15: byte 0 packs reset-pin and watchdog controls, byte 1 the
/// watchdog prescale (a power of two, §8 scenario 4), byte 2 brownout
/// threshold, byte 3 clock source.
const P15_FIELDS: &[OptionField] = &[
    OptionField {
        name: "reset_pin_enabled",
        byte_index: 0,
        mask: 0b0000_0001,
        shift: 0,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "watchdog_por_enabled",
        byte_index: 0,
        mask: 0b0000_0010,
        shift: 1,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "watchdog_prescale",
        byte_index: 1,
        mask: 0b0111_1111,
        shift: 0,
        domain: Domain::PowerOfTwo { max_divisor: 128 },
        requires: &[("watchdog_por_enabled", 1)],
    },
    OptionField {
        name: "brownout_threshold",
        byte_index: 2,
        mask: 0b0000_1111,
        shift: 0,
        domain: Domain::Enum(&[("2v", 0), ("2v3", 1), ("2v7", 2), ("3v3", 3)]),
        requires: &[],
    },
    OptionField {
        name: "clock_source",
        byte_index: 3,
        mask: 0b0000_0011,
        shift: 0,
        domain: Domain::Enum(&[("internal", 0), ("external", 1)]),
        requires: &[],
    },
];

pub static P15A_TABLE: OptionTable = OptionTable {
    family: Family::Stc15A,
    byte_len: 4,
    fields: P15_FIELDS,
};

pub static P15_TABLE: OptionTable = OptionTable {
    family: Family::Stc15,
    byte_len: 4,
    fields: P15_FIELDS,
};

pub static USB15_TABLE: OptionTable = OptionTable {
    family: Family::Usb15,
    byte_len: 4,
    fields: P15_FIELDS,
};

/// P8: the P15 layout plus a fifth byte for `program_eeprom_split` — the
/// code/EEPROM boundary, settable in 512-byte units up to the part's
/// total flash (§4.6 "programmable code/EEPROM split").
const P8_FIELDS: &[OptionField] = &[
    OptionField {
        name: "reset_pin_enabled",
        byte_index: 0,
        mask: 0b0000_0001,
        shift: 0,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "watchdog_por_enabled",
        byte_index: 0,
        mask: 0b0000_0010,
        shift: 1,
        domain: Domain::Bool,
        requires: &[],
    },
    OptionField {
        name: "watchdog_prescale",
        byte_index: 1,
        mask: 0b0111_1111,
        shift: 0,
        domain: Domain::PowerOfTwo { max_divisor: 128 },
        requires: &[("watchdog_por_enabled", 1)],
    },
    OptionField {
        name: "brownout_threshold",
        byte_index: 2,
        mask: 0b0000_1111,
        shift: 0,
        domain: Domain::Enum(&[("2v", 0), ("2v3", 1), ("2v7", 2), ("3v3", 3)]),
        requires: &[],
    },
    OptionField {
        name: "clock_source",
        byte_index: 3,
        mask: 0b0000_0011,
        shift: 0,
        domain: Domain::Enum(&[("internal", 0), ("external", 1)]),
        requires: &[],
    },
    OptionField {
        name: "program_eeprom_split",
        byte_index: 4,
        mask: 0xFF,
        shift: 0,
        domain: Domain::Multiple { unit: 512, max: 0x10000 },
        requires: &[],
    },
];

pub static P8_TABLE: OptionTable = OptionTable {
    family: Family::Stc8,
    byte_len: 5,
    fields: P8_FIELDS,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_sets_bool_field() {
        let bytes = encode(&P15_TABLE, &[0, 0, 0, 0], &[("reset_pin_enabled", "on")]).unwrap();
        assert_eq!(bytes[0] & 0b1, 1);
    }

    #[test]
    fn encode_rejects_unknown_key() {
        let err = encode(&P15_TABLE, &[0, 0, 0, 0], &[("does_not_exist", "on")]).unwrap_err();
        assert!(matches!(err, IspError::BadOption(_)));
    }

    #[test]
    fn encode_rejects_out_of_domain_value() {
        let err = encode(&P15_TABLE, &[0, 0, 0, 0], &[("brownout_threshold", "9v")]).unwrap_err();
        assert!(matches!(err, IspError::BadOption(_)));
    }

    #[test]
    fn encode_rejects_prescale_without_watchdog_enabled() {
        let err = encode(&P15_TABLE, &[0, 0, 0, 0], &[("watchdog_prescale", "4")]).unwrap_err();
        assert!(matches!(err, IspError::BadOption(_)));
    }

    #[test]
    fn encode_rejects_non_power_of_two_prescale() {
        // §8 scenario 4: watchdog_prescale=5 must be rejected before any I/O.
        let err = encode(
            &P15_TABLE,
            &[0, 0, 0, 0],
            &[("watchdog_por_enabled", "on"), ("watchdog_prescale", "5")],
        )
        .unwrap_err();
        assert!(matches!(err, IspError::BadOption(_)));
    }

    #[test]
    fn encode_accepts_prescale_when_watchdog_enabled_in_same_batch() {
        let bytes = encode(
            &P15_TABLE,
            &[0, 0, 0, 0],
            &[("watchdog_por_enabled", "on"), ("watchdog_prescale", "4")],
        )
        .unwrap();
        assert_eq!(bytes[0] & 0b10, 0b10);
        // 4 = 2^2, stored as the log2.
        assert_eq!(bytes[1] & 0b0111_1111, 2);
    }

    #[test]
    fn encode_accepts_prescale_when_watchdog_already_set_in_defaults() {
        let bytes = encode(&P15_TABLE, &[0b10, 0, 0, 0], &[("watchdog_prescale", "8")]).unwrap();
        assert_eq!(bytes[1] & 0b0111_1111, 3);
    }

    #[test]
    fn decode_round_trips_encoded_fields() {
        let bytes = encode(
            &P15_TABLE,
            &[0, 0, 0, 0],
            &[("reset_pin_enabled", "on"), ("brownout_threshold", "3v3")],
        )
        .unwrap();
        let decoded = decode(&P15_TABLE, &bytes);
        assert!(decoded.contains(&("reset_pin_enabled", 1)));
        assert!(decoded.contains(&("brownout_threshold", 3)));
    }

    #[test]
    fn split_kv_rejects_missing_equals() {
        assert!(split_kv("justakey").is_err());
        assert_eq!(split_kv("k=v").unwrap(), ("k", "v"));
    }

    #[test]
    fn p89_table_is_one_byte_and_round_trips() {
        assert_eq!(P89_TABLE.byte_len, 1);
        let bytes = encode(&P89_TABLE, &[0], &[("clock_source", "external")]).unwrap();
        let decoded = decode(&P89_TABLE, &bytes);
        assert!(decoded.contains(&("clock_source", 1)));
    }

    #[test]
    fn p8_table_accepts_eeprom_split_multiple_of_512() {
        let bytes = encode(&P8_TABLE, &[0, 0, 0, 0, 0], &[("program_eeprom_split", "2048")]).unwrap();
        assert_eq!(bytes[4], 4); // 2048 / 512
    }

    #[test]
    fn p8_table_rejects_eeprom_split_not_a_multiple_of_512() {
        let err = encode(&P8_TABLE, &[0, 0, 0, 0, 0], &[("program_eeprom_split", "2000")]).unwrap_err();
        assert!(matches!(err, IspError::BadOption(_)));
    }

    #[test]
    fn table_for_family_covers_every_family() {
        assert_eq!(table_for_family(Family::Stc89).byte_len, 1);
        assert_eq!(table_for_family(Family::Stc12A).byte_len, 1);
        assert_eq!(table_for_family(Family::Stc12).byte_len, 2);
        assert_eq!(table_for_family(Family::Stc12B).byte_len, 2);
        assert_eq!(table_for_family(Family::Stc15A).byte_len, 4);
        assert_eq!(table_for_family(Family::Stc15).byte_len, 4);
        assert_eq!(table_for_family(Family::Usb15).byte_len, 4);
        assert_eq!(table_for_family(Family::Stc8).byte_len, 5);
    }
}
