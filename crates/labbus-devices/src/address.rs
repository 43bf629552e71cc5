/*!
 * GPIB bus addresses.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};

/// Highest valid primary address
pub const MAX_PRIMARY: u8 = 30;

/// Secondary value meaning "no secondary address"
pub const NO_SECONDARY: u8 = 0;

/// Lowest valid secondary address
pub const MIN_SECONDARY: u8 = 0x60;

/// Highest valid secondary address
pub const MAX_SECONDARY: u8 = 0x7E;

/// Address of a device on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "(u8, u8)", into = "(u8, u8)")]
pub struct BusAddress {
    primary: u8,
    secondary: u8,
}

impl BusAddress {
    /// Create an address, validating both parts
    pub fn new(primary: u8, secondary: u8) -> Result<Self> {
        if primary > MAX_PRIMARY {
            return Err(BusError::invalid_argument(format!(
                "Primary address {} is outside 0..={}",
                primary, MAX_PRIMARY
            )));
        }
        if secondary != NO_SECONDARY && !(MIN_SECONDARY..=MAX_SECONDARY).contains(&secondary) {
            return Err(BusError::invalid_argument(format!(
                "Secondary address {:#04x} must be 0 or within {:#04x}..={:#04x}",
                secondary, MIN_SECONDARY, MAX_SECONDARY
            )));
        }
        Ok(Self { primary, secondary })
    }

    /// Create an address without a secondary part
    pub fn primary_only(primary: u8) -> Result<Self> {
        Self::new(primary, NO_SECONDARY)
    }

    /// Primary address
    pub fn primary(&self) -> u8 {
        self.primary
    }

    /// Secondary address, `None` when unset
    pub fn secondary(&self) -> Option<u8> {
        (self.secondary != NO_SECONDARY).then_some(self.secondary)
    }

    /// Whether both addresses select the same device for bus arbitration
    ///
    /// Primaries must match; an unset secondary on either side matches any
    /// secondary on the other.
    pub fn same_device(&self, other: &BusAddress) -> bool {
        self.primary == other.primary
            && (self.secondary == NO_SECONDARY
                || other.secondary == NO_SECONDARY
                || self.secondary == other.secondary)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.secondary() {
            Some(secondary) => write!(f, "{} {}", self.primary, secondary),
            None => write!(f, "{}", self.primary),
        }
    }
}

impl FromStr for BusAddress {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|p| !p.is_empty());

        let parse = |part: &str| {
            part.parse::<u8>()
                .map_err(|e| BusError::invalid_argument(format!("Invalid address '{}': {}", s, e)))
        };

        let primary = match parts.next() {
            Some(part) => parse(part)?,
            None => return Err(BusError::invalid_argument("Empty bus address")),
        };
        let secondary = match parts.next() {
            Some(part) => parse(part)?,
            None => NO_SECONDARY,
        };
        if parts.next().is_some() {
            return Err(BusError::invalid_argument(format!(
                "Too many parts in bus address '{}'",
                s
            )));
        }
        Self::new(primary, secondary)
    }
}

impl TryFrom<(u8, u8)> for BusAddress {
    type Error = BusError;

    fn try_from((primary, secondary): (u8, u8)) -> Result<Self> {
        Self::new(primary, secondary)
    }
}

impl From<BusAddress> for (u8, u8) {
    fn from(address: BusAddress) -> Self {
        (address.primary, address.secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ranges() {
        assert!(BusAddress::primary_only(0).is_ok());
        assert!(BusAddress::primary_only(30).is_ok());
        assert!(BusAddress::primary_only(31).is_err());
        assert!(BusAddress::new(5, 0x60).is_ok());
        assert!(BusAddress::new(5, 0x7E).is_ok());
        assert!(BusAddress::new(5, 0x5F).is_err());
        assert!(BusAddress::new(5, 0x7F).is_err());
        assert!(BusAddress::new(5, 1).is_err());
    }

    #[test]
    fn test_same_device() {
        let plain = BusAddress::primary_only(5).unwrap();
        let sec_a = BusAddress::new(5, 0x60).unwrap();
        let sec_b = BusAddress::new(5, 0x61).unwrap();
        let other = BusAddress::primary_only(6).unwrap();

        assert!(plain.same_device(&sec_a));
        assert!(sec_a.same_device(&plain));
        assert!(sec_a.same_device(&sec_a));
        assert!(!sec_a.same_device(&sec_b));
        assert!(!plain.same_device(&other));
        assert_ne!(plain, sec_a);
    }

    #[test]
    fn test_display_matches_directive_argument() {
        assert_eq!(BusAddress::primary_only(22).unwrap().to_string(), "22");
        assert_eq!(BusAddress::new(3, 0x60).unwrap().to_string(), "3 96");
    }

    #[test]
    fn test_parse() {
        assert_eq!("7".parse::<BusAddress>().unwrap(), BusAddress::primary_only(7).unwrap());
        assert_eq!("7,96".parse::<BusAddress>().unwrap(), BusAddress::new(7, 96).unwrap());
        assert_eq!("7 96".parse::<BusAddress>().unwrap(), BusAddress::new(7, 96).unwrap());
        assert!("".parse::<BusAddress>().is_err());
        assert!("x".parse::<BusAddress>().is_err());
        assert!("1 96 3".parse::<BusAddress>().is_err());
        assert!("40".parse::<BusAddress>().is_err());
    }
}
