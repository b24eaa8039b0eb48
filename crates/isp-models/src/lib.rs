//! MCU model database (§3 data model): maps the 16-bit magic returned by a
//! device's identify response to its full descriptor — sizes, dialect
//! family, and the per-model flags (`iap_configurable`, `rc_trim_capable`,
//! `mcs251`) the protocol layer cannot infer from the magic alone. A flat
//! table probed by a numeric key, unknown magics surfaced as a typed error
//! rather than a panic.

use isp_core::IspError;

/// The dialect family an MCU's identify magic belongs to. Distinct from
/// `isp_dialects::DialectKind` so this crate has no dependency on the
/// engines that implement the protocol — only on which family applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Stc89,
    Stc12A,
    Stc12B,
    Stc12,
    Stc15A,
    Stc15,
    Stc8,
    Usb15,
}

impl Family {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stc89 => "stc89",
            Self::Stc12A => "stc12a",
            Self::Stc12B => "stc12b",
            Self::Stc12 => "stc12",
            Self::Stc15A => "stc15a",
            Self::Stc15 => "stc15",
            Self::Stc8 => "stc8",
            Self::Usb15 => "usb15",
        }
    }
}

/// A single entry in the model database (§3 "MCU descriptor").
///
/// `write_block_size` overrides the owning dialect's default write-block
/// size for this one model. Several P12/P12B-family parts accept either
/// 128- or 256-byte blocks at the device's discretion, and which one a
/// given part actually wants is a per-model fact rather than something
/// negotiated at announcement time (§9 design notes: "retain the current
/// behavior of picking by model rather than by announcement"). `None`
/// means "use the owning dialect's default block size."
#[derive(Debug, Clone, Copy)]
pub struct McuDescriptor {
    pub magic: u16,
    pub name: &'static str,
    pub family: Family,
    pub total_size: u32,
    pub code_size: u32,
    pub eeprom_size: u32,
    pub iap_configurable: bool,
    pub rc_trim_capable: bool,
    pub mcs251: bool,
    pub write_block_size: Option<usize>,
}

/// Static table, ordered by magic for readability; lookup is a linear scan
/// since the table is small enough that a hash map buys nothing.
static TABLE: &[McuDescriptor] = &[
    McuDescriptor {
        magic: 0xF0F0,
        name: "STC89C52RC",
        family: Family::Stc89,
        total_size: 0x2000,
        code_size: 0x2000,
        eeprom_size: 0,
        iap_configurable: false,
        rc_trim_capable: false,
        mcs251: false,
        write_block_size: None,
    },
    McuDescriptor {
        magic: 0xF2C0,
        name: "STC12C5A60S2",
        family: Family::Stc12A,
        total_size: 0xF000,
        code_size: 0xF000,
        eeprom_size: 0,
        iap_configurable: false,
        rc_trim_capable: false,
        mcs251: false,
        write_block_size: None,
    },
    McuDescriptor {
        magic: 0xF5C0,
        name: "STC12C5204AD",
        family: Family::Stc12B,
        total_size: 0x1000,
        code_size: 0x1000,
        eeprom_size: 0,
        iap_configurable: false,
        rc_trim_capable: false,
        mcs251: false,
        write_block_size: None,
    },
    McuDescriptor {
        magic: 0xF6C0,
        name: "IAP12C5A62AD",
        family: Family::Stc12,
        total_size: 0x10000,
        code_size: 0xF800,
        eeprom_size: 0x0800,
        iap_configurable: true,
        rc_trim_capable: false,
        mcs251: false,
        // This part is documented as tolerating 256-byte blocks; the bare
        // dialect default (128) would still work but wastes round trips.
        write_block_size: Some(256),
    },
    McuDescriptor {
        magic: 0xF4C0,
        name: "IAP15W4K58S4",
        family: Family::Stc15A,
        total_size: 0x10000,
        code_size: 0xE800,
        eeprom_size: 0x1800,
        iap_configurable: true,
        rc_trim_capable: true,
        mcs251: false,
        write_block_size: None,
    },
    McuDescriptor {
        magic: 0xF449,
        name: "IAP15F2K61S2",
        family: Family::Stc15,
        total_size: 0xF800,
        code_size: 0xF400,
        eeprom_size: 0x0400,
        iap_configurable: true,
        rc_trim_capable: true,
        mcs251: false,
        write_block_size: None,
    },
    McuDescriptor {
        magic: 0xF9C0,
        name: "STC15F104W",
        family: Family::Stc15,
        total_size: 0x1800,
        code_size: 0x1800,
        eeprom_size: 0,
        iap_configurable: false,
        rc_trim_capable: true,
        mcs251: false,
        write_block_size: None,
    },
    McuDescriptor {
        magic: 0xF3C0,
        name: "STC8A8K64S4A12",
        family: Family::Stc8,
        total_size: 0x10000,
        code_size: 0xFC00,
        eeprom_size: 0x0400,
        iap_configurable: true,
        rc_trim_capable: true,
        mcs251: false,
        write_block_size: None,
    },
    McuDescriptor {
        magic: 0xFAC0,
        name: "STC15W1K24S-USB",
        family: Family::Usb15,
        total_size: 0x1C00,
        code_size: 0x1800,
        eeprom_size: 0x0400,
        iap_configurable: true,
        rc_trim_capable: true,
        mcs251: false,
        write_block_size: None,
    },
];

/// Looks up a device by its identify-response magic.
///
/// # Errors
/// Returns `IspError::UnknownModel` when the magic is not in the table.
pub fn lookup(magic: u16) -> Result<McuDescriptor, IspError> {
    TABLE
        .iter()
        .find(|d| d.magic == magic)
        .copied()
        .ok_or(IspError::UnknownModel(magic))
}

/// All descriptors for a given family, in table order.
#[must_use]
pub fn by_family(family: Family) -> Vec<McuDescriptor> {
    TABLE.iter().filter(|d| d.family == family).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_magic_succeeds() {
        let d = lookup(0xF0F0).unwrap();
        assert_eq!(d.name, "STC89C52RC");
        assert_eq!(d.family, Family::Stc89);
    }

    #[test]
    fn lookup_unknown_magic_is_typed_error() {
        let err = lookup(0x0000).unwrap_err();
        assert!(matches!(err, IspError::UnknownModel(0x0000)));
    }

    #[test]
    fn table_has_no_duplicate_magics() {
        let mut magics: Vec<u16> = TABLE.iter().map(|d| d.magic).collect();
        magics.sort_unstable();
        let mut deduped = magics.clone();
        deduped.dedup();
        assert_eq!(magics.len(), deduped.len());
    }

    #[test]
    fn by_family_filters_correctly() {
        let stc15a = by_family(Family::Stc15A);
        assert_eq!(stc15a.len(), 1);
        assert_eq!(stc15a[0].magic, 0xF4C0);
    }

    #[test]
    fn every_descriptor_honors_the_size_invariant() {
        for d in TABLE {
            assert!(
                d.code_size + d.eeprom_size <= d.total_size,
                "{}: code_size + eeprom_size exceeds total_size",
                d.name
            );
        }
    }

    #[test]
    fn scenario_device_resolves_to_iap15f2k61s2() {
        let d = lookup(0xF449).unwrap();
        assert_eq!(d.name, "IAP15F2K61S2");
        assert_eq!(d.family, Family::Stc15);
        // "61.0 KB" code flash.
        assert_eq!(d.code_size, 61 * 1024);
    }
}
