use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use mongodb::bson::Bson;
use rocket::request::FromParam;
use thiserror::Error;

/// Errors from parsing `0x`-prefixed hex strings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("missing 0x prefix")]
    MissingPrefix,
    #[error("expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("invalid hex: {0}")]
    Encoding(#[from] data_encoding::DecodeError),
}

/// Decode a `0x`-prefixed hex string of exactly `N` bytes.
pub fn decode_prefixed<const N: usize>(s: &str) -> Result<[u8; N], HexError> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or(HexError::MissingPrefix)?;
    let bytes = HEXLOWER_PERMISSIVE.decode(hex.as_bytes())?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| HexError::WrongLength {
        expected: N,
        actual,
    })
}

/// Encode bytes as a lowercase `0x`-prefixed hex string.
pub fn encode_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", HEXLOWER.encode(bytes))
}

/// A 32-byte hash: vote message digests and ledger transaction hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

/// Keccak-256 digest of a vote message.
pub type MessageDigest = Hash32;

/// Hash of a ledger transaction.
pub type TxHash = Hash32;

impl Hash32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl FromStr for Hash32 {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_prefixed(s).map(Self)
    }
}

impl Display for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&encode_prefixed(&self.0))
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({self})")
    }
}

impl From<Hash32> for Bson {
    fn from(hash: Hash32) -> Self {
        Bson::String(hash.to_string())
    }
}

impl<'a> FromParam<'a> for Hash32 {
    type Error = HexError;

    fn from_param(param: &'a str) -> Result<Self, Self::Error> {
        param.parse()
    }
}

/// A 65-byte recoverable signature: `r || s || v`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VoteSignature([u8; 65]);

impl VoteSignature {
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }
}

impl From<[u8; 65]> for VoteSignature {
    fn from(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }
}

impl FromStr for VoteSignature {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_prefixed(s).map(Self)
    }
}

impl Display for VoteSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&encode_prefixed(&self.0))
    }
}

impl Debug for VoteSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "VoteSignature({self})")
    }
}

/// Serialise any `Display + FromStr` value as its string form.
macro_rules! serde_via_str {
    ($($ty:ty),*) => {$(
        impl ::serde::Serialize for $ty {
            fn serialize<S: ::serde::Serializer>(
                &self,
                serializer: S,
            ) -> ::std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $ty {
            fn deserialize<D: ::serde::Deserializer<'de>>(
                deserializer: D,
            ) -> ::std::result::Result<Self, D::Error> {
                let s = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                s.parse()
                    .map_err(<D::Error as ::serde::de::Error>::custom)
            }
        }
    )*};
}

pub(crate) use serde_via_str;

serde_via_str!(Hash32, VoteSignature);
