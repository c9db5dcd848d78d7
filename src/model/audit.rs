use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::hash::TxHash;

/// The kind of state-changing action an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// A vote was confirmed on the ledger and folded into the mirror.
    VoteCast,
    /// A confirmed vote's mirror write failed and was queued for retry.
    ReconciliationPending,
    /// A previously queued mirror write has now been applied.
    VoteReconciled,
    /// A queued vote was abandoned: the ledger reverted it, or the mirror
    /// already holds another vote from the same voter.
    VoteDropped,
    /// A submission failed ambiguously and no matching ledger transaction
    /// could be found for it.
    SubmissionUnresolved,
    /// The mirror was resynchronised from the ledger.
    LedgerSync,
}

/// An append-only audit record. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    /// Who performed the action, e.g. the voter's email or "system".
    pub actor: String,
    pub target_id: Option<String>,
    pub target_type: Option<String>,
    pub details: String,
    /// External proof, e.g. the ledger transaction hash.
    pub proof_hash: Option<TxHash>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
}
