use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A program-counter address in the target.
///
/// Held bare in memory; the debugger-facing breakpoint form prepends `*` so
/// the location is parsed as an address instead of a linespec. The checkpoint
/// file stores the `*`-prefixed form.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeAddr(u64);

impl CodeAddr {
    pub fn new(addr: u64) -> CodeAddr {
        CodeAddr(addr)
    }

    /// The form the debugger accepts as a breakpoint location.
    pub fn breakpoint_location(self) -> String {
        format!("*{:#x}", self.0)
    }
}

impl fmt::Display for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeAddr({:#x})", self.0)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("not a code address: {0:?}")]
pub struct ParseCodeAddrError(String);

impl FromStr for CodeAddr {
    type Err = ParseCodeAddrError;

    /// Accepts `*0x40123a`, `0x40123a` and bare hex digits.
    fn from_str(s: &str) -> Result<CodeAddr, ParseCodeAddrError> {
        let bare = s.strip_prefix('*').unwrap_or(s);
        let digits = bare
            .strip_prefix("0x")
            .or_else(|| bare.strip_prefix("0X"))
            .unwrap_or(bare);
        u64::from_str_radix(digits, 16)
            .map(CodeAddr)
            .map_err(|_| ParseCodeAddrError(s.to_owned()))
    }
}

impl Serialize for CodeAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.breakpoint_location())
    }
}

impl<'de> Deserialize<'de> for CodeAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<CodeAddr, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_on_disk_forms() {
        let expected = CodeAddr::new(0x40123a);
        assert_eq!("*0x40123a".parse::<CodeAddr>().unwrap(), expected);
        assert_eq!("0x40123a".parse::<CodeAddr>().unwrap(), expected);
        assert_eq!("40123a".parse::<CodeAddr>().unwrap(), expected);
        assert!("main".parse::<CodeAddr>().is_err());
    }

    #[test]
    fn breakpoint_location_is_star_prefixed_hex() {
        assert_eq!(CodeAddr::new(0x4011f0).breakpoint_location(), "*0x4011f0");
        assert_eq!(CodeAddr::new(0x4011f0).to_string(), "0x4011f0");
    }

    #[test]
    fn serde_round_trips_through_the_star_form() {
        let addr = CodeAddr::new(0x401260);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"*0x401260\"");
        let back: CodeAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
