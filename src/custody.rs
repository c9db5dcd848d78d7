//! Custody of voters' signing keys at rest.
//!
//! Blobs have the form `hex(iv) ":" hex(ciphertext)`: AES-256-CBC with PKCS#7
//! padding under a key derived from the server's master secret with scrypt.
//! This is the format written by the registration flow, so existing blobs
//! remain readable.
//!
//! Decrypted keys never leave this module except by reference inside
//! [`KeyCustodian::with_signing_key`], whose closure is synchronous: the key
//! cannot be held across an `.await`, and is zeroized when the closure
//! returns or unwinds.

use std::fmt::{Debug, Formatter};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use k256::ecdsa::SigningKey;
use log::debug;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Salt used by the registration flow when deriving the blob key.
const KDF_SALT: &[u8] = b"salt";
/// scrypt cost parameters: N = 2^14, r = 8, p = 1.
const KDF_LOG_N: u8 = 14;
const KDF_R: u32 = 8;
const KDF_P: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CustodyError {
    #[error("malformed key blob: {0}")]
    Malformed(&'static str),
    #[error("key blob failed to decrypt")]
    Cipher,
    #[error("decrypted key material is not a valid signing key")]
    InvalidKey,
    #[error("key derivation failed")]
    Kdf,
}

/// An encrypted signing key as stored on a voter's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyBlob(String);

impl KeyBlob {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for KeyBlob {
    fn from(blob: String) -> Self {
        Self(blob)
    }
}

/// Encrypts and decrypts voters' signing keys under the server master secret.
pub struct KeyCustodian {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl KeyCustodian {
    /// Derive the blob key from the master secret. This runs the KDF once.
    pub fn new(master_secret: &str) -> Result<Self, CustodyError> {
        Self::with_cost(master_secret, KDF_LOG_N)
    }

    /// Derive the blob key with a non-standard scrypt cost. Blobs produced
    /// this way cannot be read by a custodian built with [`KeyCustodian::new`].
    pub(crate) fn with_cost(master_secret: &str, log_n: u8) -> Result<Self, CustodyError> {
        let params =
            scrypt::Params::new(log_n, KDF_R, KDF_P, KEY_LEN).map_err(|_| CustodyError::Kdf)?;
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        scrypt::scrypt(master_secret.as_bytes(), KDF_SALT, &params, key.as_mut())
            .map_err(|_| CustodyError::Kdf)?;
        Ok(Self { key })
    }

    /// Encrypt a plaintext key (the `0x`-prefixed hex private key) into a blob.
    /// A fresh random IV is used for every call.
    pub fn encrypt(&self, plaintext_key: &str) -> Result<KeyBlob, CustodyError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(self.key.as_ref(), &iv)
            .map_err(|_| CustodyError::Cipher)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext_key.as_bytes());

        Ok(KeyBlob(format!(
            "{}:{}",
            HEXLOWER.encode(&iv),
            HEXLOWER.encode(&ciphertext)
        )))
    }

    /// Encrypt a signing key in the textual form the registration flow uses.
    pub fn encrypt_signing_key(&self, key: &SigningKey) -> Result<KeyBlob, CustodyError> {
        let plaintext = Zeroizing::new(format!("0x{}", HEXLOWER.encode(&key.to_bytes())));
        self.encrypt(&plaintext)
    }

    /// Decrypt `blob` and run `f` with the resulting signing key.
    ///
    /// The key is dropped (and zeroized) on every exit path, including when
    /// `f` panics.
    pub fn with_signing_key<R>(
        &self,
        blob: &KeyBlob,
        f: impl FnOnce(&SigningKey) -> R,
    ) -> Result<R, CustodyError> {
        let key = self.decrypt(blob)?;
        Ok(f(&key))
    }

    /// Decrypt a blob into its signing key.
    fn decrypt(&self, blob: &KeyBlob) -> Result<SigningKey, CustodyError> {
        let (iv_hex, ciphertext_hex) = blob
            .as_str()
            .split_once(':')
            .ok_or(CustodyError::Malformed("missing separator"))?;
        if ciphertext_hex.contains(':') {
            return Err(CustodyError::Malformed("too many parts"));
        }

        let iv = HEXLOWER_PERMISSIVE
            .decode(iv_hex.as_bytes())
            .map_err(|_| CustodyError::Malformed("IV is not hex"))?;
        if iv.len() != IV_LEN {
            return Err(CustodyError::Malformed("IV has the wrong length"));
        }
        let ciphertext = HEXLOWER_PERMISSIVE
            .decode(ciphertext_hex.as_bytes())
            .map_err(|_| CustodyError::Malformed("ciphertext is not hex"))?;
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CustodyError::Malformed("ciphertext is not whole blocks"));
        }

        let plaintext = Zeroizing::new(
            Aes256CbcDec::new_from_slices(self.key.as_ref(), &iv)
                .map_err(|_| CustodyError::Malformed("IV has the wrong length"))?
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
                .map_err(|_| {
                    debug!("Key blob failed padding check");
                    CustodyError::Cipher
                })?,
        );

        parse_private_key(&plaintext)
    }
}

impl Debug for KeyCustodian {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCustodian").finish_non_exhaustive()
    }
}

/// Parse `0x`-prefixed (or bare) hex private key text.
fn parse_private_key(text: &[u8]) -> Result<SigningKey, CustodyError> {
    let hex = text.strip_prefix(b"0x").unwrap_or(text);
    let bytes = Zeroizing::new(
        HEXLOWER_PERMISSIVE
            .decode(hex)
            .map_err(|_| CustodyError::InvalidKey)?,
    );
    if bytes.len() != KEY_LEN {
        return Err(CustodyError::InvalidKey);
    }
    SigningKey::from_slice(&bytes).map_err(|_| CustodyError::InvalidKey)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signature::address_of_signer;

    pub const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    pub const DEV_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    /// Cheap KDF cost; the standard cost is exercised by `standard_cost_derives`.
    pub fn custodian() -> KeyCustodian {
        KeyCustodian::with_cost("test-master-secret", 4).unwrap()
    }

    #[test]
    fn standard_cost_derives() {
        let custodian = KeyCustodian::new("test-master-secret").unwrap();
        let blob = custodian.encrypt(DEV_KEY).unwrap();
        let address = custodian.with_signing_key(&blob, address_of_signer).unwrap();
        assert_eq!(address.to_string(), DEV_ADDRESS);
    }

    #[test]
    fn encrypt_then_sign() {
        let custodian = custodian();
        let blob = custodian.encrypt(DEV_KEY).unwrap();
        assert!(!blob.as_str().contains("ac0974"));

        let address = custodian
            .with_signing_key(&blob, |key| address_of_signer(key))
            .unwrap();
        assert_eq!(address.to_string(), DEV_ADDRESS);
    }

    #[test]
    fn blobs_use_fresh_ivs() {
        let custodian = custodian();
        let first = custodian.encrypt(DEV_KEY).unwrap();
        let second = custodian.encrypt(DEV_KEY).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_blobs() {
        let custodian = custodian();
        for (blob, expected) in [
            ("no separator", CustodyError::Malformed("missing separator")),
            ("00:00:00", CustodyError::Malformed("too many parts")),
            ("zz:00", CustodyError::Malformed("IV is not hex")),
            ("0011:00112233445566778899aabbccddeeff", CustodyError::Malformed("IV has the wrong length")),
            ("00112233445566778899aabbccddeeff:", CustodyError::Malformed("ciphertext is not whole blocks")),
            ("00112233445566778899aabbccddeeff:0011", CustodyError::Malformed("ciphertext is not whole blocks")),
        ] {
            let result = custodian.with_signing_key(&KeyBlob::from(blob.to_string()), |_| ());
            assert_eq!(result, Err(expected), "blob {blob:?}");
        }
    }

    #[test]
    fn wrong_master_secret_fails() {
        let blob = custodian().encrypt(DEV_KEY).unwrap();
        let other = KeyCustodian::with_cost("a different secret", 4).unwrap();
        // Without authentication, a wrong key usually fails the padding check
        // but may occasionally yield garbage; either way it must not sign.
        assert!(other.with_signing_key(&blob, |_| ()).is_err());
    }

    #[test]
    fn garbage_plaintext_is_rejected() {
        let custodian = custodian();
        let blob = custodian.encrypt("not a key").unwrap();
        assert_eq!(
            custodian.with_signing_key(&blob, |_| ()),
            Err(CustodyError::InvalidKey)
        );
    }

    #[test]
    fn signing_key_round_trip() {
        let custodian = custodian();
        let key = SigningKey::random(&mut rand::thread_rng());
        let blob = custodian.encrypt_signing_key(&key).unwrap();
        let recovered = custodian.with_signing_key(&blob, |k| k.to_bytes()).unwrap();
        assert_eq!(recovered, key.to_bytes());
    }
}
