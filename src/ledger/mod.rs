//! The ledger: the authoritative record of who voted and how many votes each
//! candidate holds.
//!
//! Reads are idempotent and may be retried (see [`retry`]). Vote submission is
//! never retried blindly: a failure after the transaction may have been
//! broadcast is ambiguous, and the caller must re-read the voter's state
//! before trying again.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::{
    address::WalletAddress,
    candidate::CandidateId,
    hash::{MessageDigest, TxHash, VoteSignature},
};

pub mod abi;
pub mod retry;
pub mod rpc;

#[cfg(test)]
pub(crate) mod scripted;

pub use retry::{retry_read, RetryPolicy};
pub use rpc::RpcLedger;

/// Revert reason emitted when the voter already has a vote on record.
pub const REVERT_ALREADY_VOTED: &str = "You have already voted";
/// Revert reason emitted outside the voting window.
pub const REVERT_NOT_ACTIVE: &str = "Voting is not active";
/// Revert reason emitted when the candidate belongs to another programme.
pub const REVERT_PRODI_MISMATCH: &str = "You can only vote for candidates in your prodi";
/// Revert reason emitted when the candidate has been deactivated.
pub const REVERT_CANDIDATE_INACTIVE: &str = "Candidate is not active";
/// Revert reason emitted when the sender is not a registered voter.
pub const REVERT_NOT_REGISTERED: &str = "Voter is not registered";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The ledger could not be reached or answered with a transport error.
    /// Reads failing this way are safe to retry.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
    /// Submission failed, and the transaction may or may not have been broadcast.
    #[error("Vote submission failed: {0}")]
    SubmissionFailed(String),
    /// The ledger executed and rejected the transaction.
    #[error("Ledger rejected the transaction: {0}")]
    Reverted(String),
    /// The transaction was broadcast but not confirmed in time.
    #[error("Timed out waiting for confirmation of {0}")]
    Timeout(TxHash),
    /// The ledger answered with something that could not be decoded.
    #[error("Unexpected ledger response: {0}")]
    BadResponse(String),
}

impl LedgerError {
    /// Whether a read that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A voter's state as recorded on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoterState {
    pub registered: bool,
    pub has_voted: bool,
}

/// A candidate as recorded on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerCandidate {
    /// Zero if the ledger has no candidate under the requested id.
    pub id: CandidateId,
    pub name: String,
    pub prodi: String,
    pub active: bool,
    pub vote_count: u64,
}

impl LedgerCandidate {
    pub fn exists(&self) -> bool {
        self.id != 0
    }
}

/// The voting window as recorded on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub active: bool,
}

impl SessionWindow {
    /// Is voting open at `now`? The window is half-open: `[start, end)`.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.active && self.start <= now && now < self.end
    }
}

/// Everything the ledger needs to record a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteSubmission {
    pub voter: WalletAddress,
    pub candidate_id: CandidateId,
    pub message_hash: MessageDigest,
    pub signature: VoteSignature,
}

/// Handle on a broadcast but not yet confirmed vote transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingVote {
    pub tx_hash: TxHash,
}

/// Proof that a vote transaction was included in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
}

/// Access to the voting ledger.
#[rocket::async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    async fn voter_state(&self, voter: &WalletAddress) -> Result<VoterState, LedgerError>;

    async fn candidate(&self, id: CandidateId) -> Result<LedgerCandidate, LedgerError>;

    /// Candidates are numbered `1..=candidate_count()`.
    async fn candidate_count(&self) -> Result<u32, LedgerError>;

    async fn session_window(&self) -> Result<SessionWindow, LedgerError>;

    /// Broadcast a vote transaction, returning as soon as it has a hash.
    async fn submit_vote(&self, submission: &VoteSubmission) -> Result<PendingVote, LedgerError>;

    /// Look for a transaction already carrying exactly this vote, pending or
    /// recently included. Used after an ambiguous submission failure.
    async fn find_submission(
        &self,
        submission: &VoteSubmission,
    ) -> Result<Option<PendingVote>, LedgerError>;

    /// Wait for a broadcast transaction to be included.
    async fn confirm(&self, pending: &PendingVote) -> Result<LedgerReceipt, LedgerError>;
}
