//! Bluetooth UUID representation
//!
//! SIG-assigned identifiers are 16- or 32-bit shorthands that expand onto the
//! Bluetooth Base UUID; vendor identifiers are full 128-bit values. Equality,
//! ordering and hashing are defined over the expanded 128-bit form, so a
//! 16-bit UUID and its expansion always compare equal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

/// The Bluetooth Base UUID: `00000000-0000-1000-8000-00805F9B34FB`.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;

/// A Bluetooth UUID in its 16-, 32- or 128-bit form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum BleUuid {
    /// 16-bit SIG-assigned identifier
    Uuid16(u16),
    /// 32-bit SIG-assigned identifier
    Uuid32(u32),
    /// Full 128-bit identifier
    Uuid128(Uuid),
}

impl BleUuid {
    /// Create a 16-bit UUID.
    pub const fn uuid16(value: u16) -> Self {
        BleUuid::Uuid16(value)
    }

    /// Create a 32-bit UUID.
    pub const fn uuid32(value: u32) -> Self {
        BleUuid::Uuid32(value)
    }

    /// Expand to the full 128-bit value.
    pub fn to_u128(&self) -> u128 {
        match self {
            BleUuid::Uuid16(v) => ((*v as u128) << 96) | BLUETOOTH_BASE_UUID,
            BleUuid::Uuid32(v) => ((*v as u128) << 96) | BLUETOOTH_BASE_UUID,
            BleUuid::Uuid128(u) => u.as_u128(),
        }
    }

    /// Expand to a [`uuid::Uuid`].
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_u128(self.to_u128())
    }

    /// Build from a full [`uuid::Uuid`], compressing onto the Base UUID when
    /// the value lies in the SIG-assigned range.
    pub fn from_uuid(uuid: Uuid) -> Self {
        let value = uuid.as_u128();
        let short_mask: u128 = 0xFFFF_FFFF << 96;
        if value & !short_mask == BLUETOOTH_BASE_UUID {
            let short = (value >> 96) as u32;
            if short <= u16::MAX as u32 {
                BleUuid::Uuid16(short as u16)
            } else {
                BleUuid::Uuid32(short)
            }
        } else {
            BleUuid::Uuid128(uuid)
        }
    }
}

impl PartialEq for BleUuid {
    fn eq(&self, other: &Self) -> bool {
        self.to_u128() == other.to_u128()
    }
}

impl Eq for BleUuid {}

impl Hash for BleUuid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_u128().hash(state);
    }
}

impl PartialOrd for BleUuid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BleUuid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_u128().cmp(&other.to_u128())
    }
}

impl fmt::Display for BleUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleUuid::Uuid16(v) => write!(f, "0x{:04X}", v),
            BleUuid::Uuid32(v) => write!(f, "0x{:08X}", v),
            BleUuid::Uuid128(u) => write!(f, "{}", u),
        }
    }
}

impl From<Uuid> for BleUuid {
    fn from(uuid: Uuid) -> Self {
        BleUuid::from_uuid(uuid)
    }
}

impl From<u16> for BleUuid {
    fn from(value: u16) -> Self {
        BleUuid::Uuid16(value)
    }
}

impl FromStr for BleUuid {
    type Err = uuid::Error;

    /// Parse `"0x2A00"`, `"2A00"`, `"0x0001F00D"` or a hyphenated 128-bit
    /// UUID string. Full 128-bit values in the SIG range compress onto the
    /// Base UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        if hex.len() == 4 {
            if let Ok(v) = u16::from_str_radix(hex, 16) {
                return Ok(BleUuid::Uuid16(v));
            }
        }
        if hex.len() == 8 {
            if let Ok(v) = u32::from_str_radix(hex, 16) {
                return Ok(BleUuid::Uuid32(v));
            }
        }
        Uuid::parse_str(s).map(BleUuid::from_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid16_expansion() {
        let uuid = BleUuid::uuid16(0x180D);
        assert_eq!(
            uuid.to_uuid(),
            Uuid::parse_str("0000180d-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn test_uuid32_expansion() {
        let uuid = BleUuid::uuid32(0x0001_F00D);
        assert_eq!(
            uuid.to_uuid(),
            Uuid::parse_str("0001f00d-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn test_short_and_expanded_compare_equal() {
        let short = BleUuid::uuid16(0x2A37);
        let long = BleUuid::Uuid128(Uuid::parse_str("00002a37-0000-1000-8000-00805f9b34fb").unwrap());
        assert_eq!(short, long);

        let mut set = HashSet::new();
        set.insert(short);
        assert!(set.contains(&long));
    }

    #[test]
    fn test_from_uuid_compresses_sig_range() {
        let uuid = Uuid::parse_str("00002a00-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(BleUuid::from_uuid(uuid), BleUuid::Uuid16(0x2A00));

        let vendor = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        assert_eq!(BleUuid::from_uuid(vendor), BleUuid::Uuid128(vendor));
    }

    #[test]
    fn test_parse_short_forms() {
        assert_eq!("0x2A00".parse::<BleUuid>().unwrap(), BleUuid::Uuid16(0x2A00));
        assert_eq!("2A00".parse::<BleUuid>().unwrap(), BleUuid::Uuid16(0x2A00));
        assert_eq!("0001F00D".parse::<BleUuid>().unwrap(), BleUuid::Uuid32(0x0001_F00D));
    }

    #[test]
    fn test_parse_full_form() {
        let parsed: BleUuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap();
        assert_eq!(
            parsed,
            BleUuid::Uuid128(Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap())
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(BleUuid::uuid16(0x180F).to_string(), "0x180F");
        assert_eq!(BleUuid::uuid32(0xDEAD_BEEF).to_string(), "0xDEADBEEF");
    }

    #[test]
    fn test_ordering_is_canonical() {
        let a = BleUuid::uuid16(0x1800);
        let b = BleUuid::uuid16(0x1801);
        assert!(a < b);
    }
}
