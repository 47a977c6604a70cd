//! PCI address parsing and normalization.

use crate::error::{Result, SwapError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Domain applied to short-form addresses (`01:00.0`).
pub const DEFAULT_DOMAIN: &str = "0000";

/// Full form: 0000:01:00.0
static FULL_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// Short form without domain: 01:00.0
static SHORT_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$").expect("Invalid PCI address regex")
});

/// A validated, lower-case, four-field PCI address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress(String);

impl PciAddress {
    /// Validate and normalize a user-supplied address.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if FULL_ADDRESS_REGEX.is_match(trimmed) {
            Ok(Self(trimmed.to_ascii_lowercase()))
        } else if SHORT_ADDRESS_REGEX.is_match(trimmed) {
            Ok(Self(format!("{}:{}", DEFAULT_DOMAIN, trimmed.to_ascii_lowercase())))
        } else {
            Err(SwapError::InvalidAddress { address: input.to_string() })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PciAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a list of addresses, failing on the first malformed one.
pub fn validate_all<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<PciAddress>> {
    inputs.iter().map(|s| PciAddress::parse(s.as_ref())).collect()
}
