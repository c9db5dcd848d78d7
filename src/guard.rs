//! Eligibility checks for a vote attempt.
//!
//! Every check is made against the ledger, never the mirror's cached copy.
//! The checks run in a fixed order and the first failure wins; none of them
//! has an external side effect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::{AuthorizationError, Result};
use crate::ledger::{retry_read, LedgerCandidate, LedgerClient, RetryPolicy};
use crate::model::{address::WalletAddress, candidate::CandidateId, voter::Voter};

/// What the guard saw on the ledger when it approved an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    pub candidate: LedgerCandidate,
}

pub struct AuthorizationGuard {
    ledger: Arc<dyn LedgerClient>,
    reads: RetryPolicy,
}

impl AuthorizationGuard {
    pub fn new(ledger: Arc<dyn LedgerClient>, reads: RetryPolicy) -> Self {
        Self { ledger, reads }
    }

    /// Decide whether `voter` may vote for `candidate_id` at `now`.
    ///
    /// `key_address` is the address derived from the voter's decrypted key.
    pub async fn check(
        &self,
        voter: &Voter,
        key_address: &WalletAddress,
        candidate_id: CandidateId,
        now: DateTime<Utc>,
    ) -> Result<Eligibility> {
        if !voter.verified {
            debug!("Voter {} is not verified", voter.wallet_address);
            return Err(AuthorizationError::NotRegistered.into());
        }

        // 1. The stored key belongs to this voter.
        if *key_address != voter.wallet_address {
            return Err(AuthorizationError::KeyMismatch.into());
        }

        // 2, 3. Registered and not yet voted.
        let address = voter.wallet_address;
        let state = retry_read(&self.reads, "getVoterInfo", || self.ledger.voter_state(&address)).await?;
        if !state.registered {
            return Err(AuthorizationError::NotRegistered.into());
        }
        if state.has_voted {
            return Err(AuthorizationError::AlreadyVoted.into());
        }

        // 4. Within the voting window.
        let window = retry_read(&self.reads, "getVotingStatus", || self.ledger.session_window()).await?;
        if !window.contains(now) {
            debug!("{now} is outside the voting window {} to {}", window.start, window.end);
            return Err(AuthorizationError::SessionInactive.into());
        }

        // 5. The candidate is active and in the voter's prodi.
        let candidate = retry_read(&self.reads, "getCandidate", || self.ledger.candidate(candidate_id)).await?;
        if !candidate.active {
            return Err(AuthorizationError::CandidateInactive.into());
        }
        if !candidate.prodi.eq_ignore_ascii_case(&voter.prodi) {
            return Err(AuthorizationError::ProdiMismatch.into());
        }

        Ok(Eligibility { candidate })
    }
}
