//! Lookup key normalisation.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

static HEX_ADDRESS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9A-F]{6,16}$").ok());

/// Organisationally unique prefix (first three octets) of a hardware address
/// in `AA-BB-CC` form.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct VendorKey(String);

impl VendorKey {
    /// Accepts `aa:bb:cc:..`, `AA-BB-CC-..`, `aabb.cc..` and bare hex.
    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        let digits: String = raw
            .trim()
            .chars()
            .filter(|ch| !matches!(ch, ':' | '-' | '.'))
            .map(|ch| ch.to_ascii_uppercase())
            .collect();

        let valid = HEX_ADDRESS
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(&digits));
        if !valid {
            return Err(IngestError::InvalidKey(raw.to_string()));
        }

        Ok(Self(format!(
            "{}-{}-{}",
            &digits[0..2],
            &digits[2..4],
            &digits[4..6]
        )))
    }

    /// Canonical `AA-BB-CC` text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VendorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VendorKey {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VendorKey {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VendorKey> for String {
    fn from(key: VendorKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_common_notations() {
        for raw in [
            "00:1a:2b:3c:4d:5e",
            "00-1A-2B-3C-4D-5E",
            "001a.2b3c.4d5e",
            "001A2B3C4D5E",
            "00:1a:2b",
            " 001a2b ",
        ] {
            assert_eq!(VendorKey::parse(raw).unwrap().as_str(), "00-1A-2B");
        }
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["", "00:1a", "zz:yy:xx", "not a mac", "00:1a:2b:3c:4d:5e:6f:70:81"]
        {
            assert!(
                matches!(VendorKey::parse(raw), Err(IngestError::InvalidKey(_))),
                "{raw} should be rejected"
            );
        }
    }
}
