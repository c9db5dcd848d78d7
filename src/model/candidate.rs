use serde::{Deserialize, Serialize};

/// Ledger-assigned candidate identifier. Candidate IDs start at 1.
pub type CandidateId = u32;

/// A candidate as mirrored from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(rename = "_id")]
    pub candidate_id: CandidateId,
    pub name: String,
    pub prodi: String,
    pub active: bool,
    /// Advisory copy of the ledger tally. Only reconciliation writes this.
    pub vote_count: u64,
}
