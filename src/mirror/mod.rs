//! The mirror: a queryable, non-authoritative copy of ledger state plus the
//! off-ledger data (voter identities, encrypted keys, the audit log).
//!
//! The ledger always wins. Nothing here is consulted for authorization; it is
//! only read for voter identities and for display.

use mongodb::error::Error as DbError;
use thiserror::Error;

use crate::model::{
    address::WalletAddress,
    audit::AuditEntry,
    candidate::CandidateRecord,
    hash::TxHash,
    mongodb::Id,
    session::VotingSession,
    vote::VoteRecord,
    voter::Voter,
};
use crate::reconcile::PendingWrite;

#[cfg(test)]
pub(crate) mod memory;
mod mongo;

pub use mongo::MongoMirror;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Db(#[from] DbError),
    /// A different vote is already recorded for this voter.
    #[error("A different vote is already recorded for voter {0}")]
    DuplicateVoter(WalletAddress),
    #[error("Mirror unavailable: {0}")]
    Unavailable(String),
}

/// How a vote commit should update the candidate's advisory count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountUpdate {
    /// Add one to the current count. Used on the live path.
    Increment,
    /// Overwrite with a count freshly read from the ledger. Used when
    /// retrying, so that a write which half-happened cannot double count.
    Set(u64),
}

/// The result of committing a vote to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The vote was recorded. The candidate's new count is known only if the
    /// candidate is already present in the mirror.
    Applied { vote_count: Option<u64> },
    /// A record with this transaction hash already exists; nothing changed.
    AlreadyApplied,
}

/// Storage for the mirror.
#[rocket::async_trait]
pub trait MirrorStore: Send + Sync + 'static {
    async fn voter(&self, id: &Id) -> Result<Option<Voter>, MirrorError>;

    async fn voters(&self) -> Result<Vec<Voter>, MirrorError>;

    async fn vote_by_voter(&self, voter: &WalletAddress) -> Result<Option<VoteRecord>, MirrorError>;

    async fn vote_by_tx(&self, tx_hash: &TxHash) -> Result<Option<VoteRecord>, MirrorError>;

    /// Atomically record `vote`, update its candidate's count, mark the
    /// voter as having voted, and append `audit`. Idempotent per transaction
    /// hash: replaying a committed vote returns [`CommitOutcome::AlreadyApplied`].
    async fn commit_vote(
        &self,
        vote: &VoteRecord,
        count: CountUpdate,
        audit: &AuditEntry,
    ) -> Result<CommitOutcome, MirrorError>;

    /// Insert or overwrite a candidate.
    async fn put_candidate(&self, candidate: &CandidateRecord) -> Result<(), MirrorError>;

    async fn set_voter_has_voted(
        &self,
        voter: &WalletAddress,
        has_voted: bool,
    ) -> Result<(), MirrorError>;

    /// Record the ledger's voting window, deactivating any other session.
    async fn put_session(&self, session: &VotingSession) -> Result<(), MirrorError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), MirrorError>;

    async fn save_pending(&self, pending: &PendingWrite) -> Result<(), MirrorError>;

    async fn remove_pending(&self, tx_hash: &TxHash) -> Result<(), MirrorError>;

    async fn pending_writes(&self) -> Result<Vec<PendingWrite>, MirrorError>;
}
