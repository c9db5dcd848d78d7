use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use data_encoding::HEXLOWER;
use mongodb::bson::Bson;
use thiserror::Error;

use crate::model::hash::{decode_prefixed, serde_via_str, HexError};
use crate::signature::keccak256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error(transparent)]
    Hex(#[from] HexError),
    #[error("mixed-case address fails its checksum")]
    BadChecksum,
}

/// A 20-byte ledger account address.
///
/// Equality is on the raw bytes, so comparisons are case-insensitive with
/// respect to the textual form. Display always yields the EIP-55 checksummed
/// form, which is also the form used inside vote digests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletAddress([u8; 20]);

impl WalletAddress {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The EIP-55 mixed-case checksum encoding.
    pub fn to_checksum(&self) -> String {
        let hex = HEXLOWER.encode(&self.0);
        let hash = keccak256(hex.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in hex.chars().enumerate() {
            let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl From<[u8; 20]> for WalletAddress {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl FromStr for WalletAddress {
    type Err = AddressError;

    /// Accepts all-lowercase, all-uppercase or correctly checksummed input.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Self(decode_prefixed(s)?);
        let hex = &s[2..];
        let mixed_case = hex.chars().any(|c| c.is_ascii_lowercase())
            && hex.chars().any(|c| c.is_ascii_uppercase());
        if mixed_case && address.to_checksum()[2..] != *hex {
            return Err(AddressError::BadChecksum);
        }
        Ok(address)
    }
}

impl Display for WalletAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl Debug for WalletAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WalletAddress({self})")
    }
}

serde_via_str!(WalletAddress);

/// Addresses are stored in their checksummed form, so filters can match on
/// the exact string.
impl From<WalletAddress> for Bson {
    fn from(address: WalletAddress) -> Self {
        Bson::String(address.to_checksum())
    }
}
