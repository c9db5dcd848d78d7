use std::sync::Arc;

use chrono::Utc;
use log::trace;

use crate::mirror::{MirrorError, MirrorStore};
use crate::model::{
    audit::{AuditAction, AuditEntry},
    address::WalletAddress,
    hash::{MessageDigest, TxHash},
    vote::VoteRecord,
};
use crate::reconcile::{PendingWrite, ResyncReport};

/// Actor recorded for actions the server takes on its own.
pub const SYSTEM_ACTOR: &str = "system";

const TARGET_VOTE: &str = "vote";
const TARGET_VOTER: &str = "voter";
const TARGET_LEDGER: &str = "ledger";

/// Append-only audit trail. Entries are only ever inserted; nothing reads
/// them back to make a decision.
#[derive(Clone)]
pub struct AuditLogger {
    mirror: Arc<dyn MirrorStore>,
}

impl AuditLogger {
    pub fn new(mirror: Arc<dyn MirrorStore>) -> Self {
        Self { mirror }
    }

    pub async fn append(&self, entry: &AuditEntry) -> Result<(), MirrorError> {
        trace!("Audit {:?} by {}", entry.action, entry.actor);
        self.mirror.append_audit(entry).await
    }

    /// The entry written alongside a vote's mirror record.
    pub fn vote_cast(record: &VoteRecord, actor: &str) -> AuditEntry {
        AuditEntry {
            action: AuditAction::VoteCast,
            actor: actor.to_string(),
            target_id: Some(record.tx_hash.to_string()),
            target_type: Some(TARGET_VOTE.to_string()),
            details: format!(
                "Vote by {} for candidate {} included in block {}",
                record.voter_address, record.candidate_id, record.block_number
            ),
            proof_hash: Some(record.tx_hash),
            timestamp: Utc::now(),
        }
    }

    pub fn reconciliation_pending(pending: &PendingWrite) -> AuditEntry {
        AuditEntry {
            action: AuditAction::ReconciliationPending,
            actor: pending.actor.clone(),
            target_id: Some(pending.tx_hash.to_string()),
            target_type: Some(TARGET_VOTE.to_string()),
            details: format!(
                "Mirror update deferred after {} attempt(s): {}",
                pending.attempts, pending.last_error
            ),
            proof_hash: Some(pending.tx_hash),
            timestamp: Utc::now(),
        }
    }

    pub fn vote_reconciled(tx_hash: TxHash, attempts: u32) -> AuditEntry {
        AuditEntry {
            action: AuditAction::VoteReconciled,
            actor: SYSTEM_ACTOR.to_string(),
            target_id: Some(tx_hash.to_string()),
            target_type: Some(TARGET_VOTE.to_string()),
            details: format!("Deferred mirror update applied after {attempts} failed attempt(s)"),
            proof_hash: Some(tx_hash),
            timestamp: Utc::now(),
        }
    }

    pub fn vote_dropped(tx_hash: TxHash, reason: &str) -> AuditEntry {
        AuditEntry {
            action: AuditAction::VoteDropped,
            actor: SYSTEM_ACTOR.to_string(),
            target_id: Some(tx_hash.to_string()),
            target_type: Some(TARGET_VOTE.to_string()),
            details: format!("Vote will not be mirrored: {reason}"),
            proof_hash: Some(tx_hash),
            timestamp: Utc::now(),
        }
    }

    pub fn submission_unresolved(
        voter: &WalletAddress,
        message_hash: &MessageDigest,
        actor: &str,
    ) -> AuditEntry {
        AuditEntry {
            action: AuditAction::SubmissionUnresolved,
            actor: actor.to_string(),
            target_id: Some(voter.to_string()),
            target_type: Some(TARGET_VOTER.to_string()),
            details: format!(
                "Submission of digest {message_hash} failed ambiguously and the ledger \
                 already records a vote, but no matching transaction was found"
            ),
            proof_hash: None,
            timestamp: Utc::now(),
        }
    }

    pub fn ledger_sync(report: &ResyncReport) -> AuditEntry {
        AuditEntry {
            action: AuditAction::LedgerSync,
            actor: SYSTEM_ACTOR.to_string(),
            target_id: None,
            target_type: Some(TARGET_LEDGER.to_string()),
            details: format!(
                "Synced {} candidate(s), updated {} voter(s), reconciled {} pending write(s), {} failure(s)",
                report.candidates_synced,
                report.voters_updated,
                report.pending_reconciled,
                report.failures
            ),
            proof_hash: None,
            timestamp: Utc::now(),
        }
    }
}
