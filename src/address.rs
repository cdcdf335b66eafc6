//! Canonical address handling.
//!
//! Chain addresses show up in lowercase, uppercase and EIP-55 mixed case.
//! Everything that is stored or used as a map key goes through these helpers
//! so comparisons never depend on the input casing.

use alloy_primitives::Address;
use std::str::FromStr;

/// Lowercase `0x`-prefixed hex, the form stored in the database.
pub fn canonical(address: &Address) -> String {
    format!("{address:?}")
}

/// Parses an address regardless of its casing. Checksums are not enforced.
pub fn parse(value: &str) -> Option<Address> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Address::from_str(&trimmed.to_ascii_lowercase()).ok()
}

/// Like [`parse`], but an empty or NULL column becomes the zero address.
pub fn parse_or_zero(value: Option<&str>) -> Option<Address> {
    match value {
        None => Some(Address::ZERO),
        Some(v) if v.trim().is_empty() => Some(Address::ZERO),
        Some(v) => parse(v),
    }
}
