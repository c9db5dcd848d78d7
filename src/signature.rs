//! Vote message digests and recoverable secp256k1 signatures.
//!
//! The digest and signature formats must match the ledger contract's verifier
//! exactly: the digest is the keccak-256 hash of the UTF-8 text
//! `"<checksummed address>:<candidate id>:<unix seconds>"`, and the signature
//! is an Ethereum personal-message signature over the 32 digest bytes.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use log::{debug, trace};
use sha3::{Digest, Keccak256};

use crate::model::{
    address::WalletAddress,
    candidate::CandidateId,
    hash::{Hash32, VoteSignature},
};

/// Prefix applied by the ledger verifier before recovering the signer.
const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// Offset added to the recovery id in the final signature byte.
const RECOVERY_ID_OFFSET: u8 = 27;

/// Hash arbitrary bytes with keccak-256.
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    Keccak256::digest(data.as_ref()).into()
}

/// Build the digest binding a voter to a candidate at a point in time.
///
/// The timestamp makes every attempt's digest unique, so a stale signature
/// can never be mistaken for a fresh one. It does not by itself prevent a
/// second vote; that is the authorization guard's job.
pub fn build_message_hash(
    voter: &WalletAddress,
    candidate_id: CandidateId,
    unix_timestamp: i64,
) -> Hash32 {
    let message = vote_message(voter, candidate_id, unix_timestamp);
    trace!("Built vote message {message}");
    Hash32::from(keccak256(message.as_bytes()))
}

/// The exact text that is hashed into a vote digest.
pub fn vote_message(voter: &WalletAddress, candidate_id: CandidateId, unix_timestamp: i64) -> String {
    format!("{voter}:{candidate_id}:{unix_timestamp}")
}

/// Sign a digest with the given key.
///
/// Signing a 32-byte prehash with a valid key cannot fail in practice; the
/// `Option` only guards against the backend rejecting the scalar.
pub fn sign(digest: &Hash32, key: &SigningKey) -> Option<VoteSignature> {
    let prehash = personal_message_hash(digest);
    let (signature, recovery_id) = key.sign_prehash_recoverable(&prehash).ok()?;

    let mut bytes = [0u8; 65];
    bytes[..64].copy_from_slice(&signature.to_bytes());
    bytes[64] = recovery_id.to_byte() + RECOVERY_ID_OFFSET;
    Some(VoteSignature::from(bytes))
}

/// Verify that `signature` over `digest` was produced by `claimed`.
///
/// Never fails: anything malformed simply does not verify.
pub fn verify(digest: &Hash32, signature: &VoteSignature, claimed: &WalletAddress) -> bool {
    match recover(digest, signature) {
        Some(recovered) => recovered == *claimed,
        None => {
            debug!("Could not recover a signer for digest {digest}");
            false
        }
    }
}

/// Recover the address that produced `signature` over `digest`.
pub fn recover(digest: &Hash32, signature: &VoteSignature) -> Option<WalletAddress> {
    let bytes = signature.as_bytes();
    let signature = Signature::from_slice(&bytes[..64]).ok()?;
    let v = bytes[64];
    let v = if v >= RECOVERY_ID_OFFSET {
        v - RECOVERY_ID_OFFSET
    } else {
        v
    };
    let recovery_id = RecoveryId::from_byte(v)?;

    let prehash = personal_message_hash(digest);
    let key = VerifyingKey::recover_from_prehash(&prehash, &signature, recovery_id).ok()?;
    Some(address_of(&key))
}

/// Derive the wallet address controlled by a public key.
pub fn address_of(key: &VerifyingKey) -> WalletAddress {
    let point = key.to_encoded_point(false);
    // Skip the SEC1 tag byte; the address is the low 20 bytes of the hash.
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    WalletAddress::from(address)
}

/// Derive the wallet address controlled by a signing key.
pub fn address_of_signer(key: &SigningKey) -> WalletAddress {
    address_of(key.verifying_key())
}

fn personal_message_hash(digest: &Hash32) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(PERSONAL_MESSAGE_PREFIX);
    hasher.update(digest.as_bytes());
    hasher.finalize().into()
}
