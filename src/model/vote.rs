use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{
    address::WalletAddress,
    candidate::CandidateId,
    hash::{MessageDigest, TxHash, VoteSignature},
};

/// A vote confirmed on the ledger, as recorded in the mirror.
///
/// Created exactly once per successful vote and never modified. There is at
/// most one record per voter address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    #[serde(rename = "_id")]
    pub tx_hash: TxHash,
    pub voter_address: WalletAddress,
    pub candidate_id: CandidateId,
    /// The voter's prodi at the time of voting, for per-prodi reporting.
    pub voter_prodi: String,
    pub message_hash: MessageDigest,
    pub signature: VoteSignature,
    pub block_number: u64,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
}
