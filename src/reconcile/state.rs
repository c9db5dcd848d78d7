//! Per-vote reconciliation state.
//!
//! A vote confirmed on the ledger moves through
//! `ConfirmedOnLedger -> [PendingMirrorWrite ->] Reconciled`. The state is a
//! type parameter, so a vote can only be reconciled once, and only a vote
//! that has been confirmed can be reconciled at all.

use chrono::{DateTime, Utc};
use log::trace;
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::ledger::LedgerReceipt;
use crate::model::{
    address::WalletAddress,
    candidate::CandidateId,
    hash::{MessageDigest, TxHash, VoteSignature},
    vote::VoteRecord,
};

/// A signed vote, before the ledger has confirmed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteDraft {
    pub voter_address: WalletAddress,
    pub candidate_id: CandidateId,
    pub voter_prodi: String,
    pub message_hash: MessageDigest,
    pub signature: VoteSignature,
    /// The timestamp bound into `message_hash`.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub signed_at: DateTime<Utc>,
}

impl VoteDraft {
    /// The mirror record for this vote once the ledger has included it.
    pub fn into_record(self, receipt: &LedgerReceipt) -> VoteRecord {
        VoteRecord {
            tx_hash: receipt.tx_hash,
            voter_address: self.voter_address,
            candidate_id: self.candidate_id,
            voter_prodi: self.voter_prodi,
            message_hash: self.message_hash,
            signature: self.signature,
            block_number: receipt.block_number,
            timestamp: self.signed_at,
        }
    }
}

pub trait ReconciliationState {
    const NAME: &'static str;
}

/// States from which a vote may still be reconciled.
pub trait Unreconciled: ReconciliationState {}

/// The ledger has included the vote; the mirror has not been touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedOnLedger;

/// The mirror write failed at least once and is queued for retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMirrorWrite {
    pub attempts: u32,
    pub last_error: String,
}

/// The mirror reflects the vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// The candidate's mirror count after the write, if the candidate is mirrored.
    pub vote_count: Option<u64>,
}

impl ReconciliationState for ConfirmedOnLedger {
    const NAME: &'static str = "confirmed on ledger";
}
impl ReconciliationState for PendingMirrorWrite {
    const NAME: &'static str = "pending mirror write";
}
impl ReconciliationState for Reconciled {
    const NAME: &'static str = "reconciled";
}

impl Unreconciled for ConfirmedOnLedger {}
impl Unreconciled for PendingMirrorWrite {}

/// A ledger-confirmed vote in reconciliation state `S`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedVote<S: ReconciliationState> {
    pub record: VoteRecord,
    /// Who cast the vote, for the audit trail.
    pub actor: String,
    pub state: S,
}

impl<S: ReconciliationState> ConfirmedVote<S> {
    fn with_state<T: ReconciliationState>(self, state: T) -> ConfirmedVote<T> {
        trace!(
            "Vote {} moved from {} to {}",
            self.record.tx_hash,
            S::NAME,
            T::NAME
        );
        ConfirmedVote {
            record: self.record,
            actor: self.actor,
            state,
        }
    }
}

impl ConfirmedVote<ConfirmedOnLedger> {
    pub fn new(draft: VoteDraft, receipt: &LedgerReceipt, actor: String) -> Self {
        Self {
            record: draft.into_record(receipt),
            actor,
            state: ConfirmedOnLedger,
        }
    }

    /// The first mirror write failed.
    pub fn defer(self, error: String) -> ConfirmedVote<PendingMirrorWrite> {
        self.with_state(PendingMirrorWrite {
            attempts: 1,
            last_error: error,
        })
    }
}

impl ConfirmedVote<PendingMirrorWrite> {
    /// Another mirror write failed.
    pub fn failed_again(mut self, error: String) -> Self {
        self.state.attempts += 1;
        self.state.last_error = error;
        self
    }

    /// The form in which the write is queued and persisted.
    pub fn to_pending_write(&self, queued_at: DateTime<Utc>) -> PendingWrite {
        PendingWrite {
            tx_hash: self.record.tx_hash,
            actor: self.actor.clone(),
            stage: PendingStage::MirrorWrite {
                record: self.record.clone(),
            },
            attempts: self.state.attempts,
            last_error: self.state.last_error.clone(),
            queued_at,
        }
    }
}

impl<S: Unreconciled> ConfirmedVote<S> {
    pub fn reconciled(self, vote_count: Option<u64>) -> ConfirmedVote<Reconciled> {
        self.with_state(Reconciled { vote_count })
    }
}

/// Work left over for the reconciliation retry task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    #[serde(rename = "_id")]
    pub tx_hash: TxHash,
    pub actor: String,
    pub stage: PendingStage,
    pub attempts: u32,
    pub last_error: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingStage {
    /// Broadcast, but the caller stopped waiting before it was included.
    AwaitingConfirmation { draft: VoteDraft },
    /// Confirmed on the ledger; the mirror write failed.
    MirrorWrite { record: VoteRecord },
}

impl PendingWrite {
    /// Track a broadcast vote whose confirmation is still outstanding.
    pub fn awaiting_confirmation(
        draft: VoteDraft,
        tx_hash: TxHash,
        actor: String,
        error: String,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tx_hash,
            actor,
            stage: PendingStage::AwaitingConfirmation { draft },
            attempts: 1,
            last_error: error,
            queued_at,
        }
    }

    /// Resume a queued mirror write. Returns `None` if the vote is still
    /// awaiting confirmation.
    pub fn as_mirror_write(&self) -> Option<ConfirmedVote<PendingMirrorWrite>> {
        match &self.stage {
            PendingStage::MirrorWrite { record } => Some(ConfirmedVote {
                record: record.clone(),
                actor: self.actor.clone(),
                state: PendingMirrorWrite {
                    attempts: self.attempts,
                    last_error: self.last_error.clone(),
                },
            }),
            PendingStage::AwaitingConfirmation { .. } => None,
        }
    }
}
