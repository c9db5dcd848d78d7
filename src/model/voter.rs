use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::custody::KeyBlob;
use crate::model::{address::WalletAddress, mongodb::Id};

/// Core voter identity data, as stored in the mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterCore {
    pub email: String,
    /// Immutable after registration.
    pub wallet_address: WalletAddress,
    /// The voter's signing key, encrypted at rest. Immutable after registration.
    pub encrypted_key: KeyBlob,
    /// Set once the voter has been registered on the ledger.
    pub verified: bool,
    /// Department partition; voters may only vote for candidates of their own prodi.
    pub prodi: String,
    /// Cached copy of the ledger's "has voted" flag. Only reconciliation writes this.
    #[serde(default)]
    pub has_voted: bool,
}

/// A voter from the mirror, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub voter: VoterCore,
}

impl Deref for Voter {
    type Target = VoterCore;

    fn deref(&self) -> &Self::Target {
        &self.voter
    }
}

impl DerefMut for Voter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.voter
    }
}
