//! An in-memory mirror for tests, with failure injection.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{CommitOutcome, CountUpdate, MirrorError, MirrorStore};
use crate::model::{
    address::WalletAddress,
    audit::{AuditAction, AuditEntry},
    candidate::{CandidateId, CandidateRecord},
    hash::TxHash,
    mongodb::Id,
    session::VotingSession,
    vote::VoteRecord,
    voter::Voter,
};
use crate::reconcile::PendingWrite;

#[derive(Default)]
struct State {
    voters: Vec<Voter>,
    candidates: HashMap<CandidateId, CandidateRecord>,
    votes: HashMap<TxHash, VoteRecord>,
    sessions: HashMap<i64, VotingSession>,
    audit_log: Vec<AuditEntry>,
    pending: HashMap<TxHash, PendingWrite>,
    failing_commits: usize,
    down: bool,
}

#[derive(Default)]
pub struct MemoryMirror {
    state: Mutex<State>,
}

impl MemoryMirror {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn available(&self) -> Result<MutexGuard<'_, State>, MirrorError> {
        let state = self.state();
        if state.down {
            return Err(MirrorError::Unavailable("scripted outage".to_string()));
        }
        Ok(state)
    }

    pub fn insert_voter(&self, voter: Voter) {
        self.state().voters.push(voter);
    }

    pub fn insert_candidate(&self, candidate: CandidateRecord) {
        self.state()
            .candidates
            .insert(candidate.candidate_id, candidate);
    }

    /// The next `n` vote commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.state().failing_commits = n;
    }

    /// Fail every operation until set back.
    pub fn set_down(&self, down: bool) {
        self.state().down = down;
    }

    pub fn vote_count(&self, id: CandidateId) -> Option<u64> {
        self.state().candidates.get(&id).map(|c| c.vote_count)
    }

    pub fn votes(&self) -> Vec<VoteRecord> {
        self.state().votes.values().cloned().collect()
    }

    pub fn audit_actions(&self) -> Vec<AuditAction> {
        self.state().audit_log.iter().map(|e| e.action).collect()
    }

    pub fn persisted_pending(&self) -> Vec<PendingWrite> {
        self.state().pending.values().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<VotingSession> {
        self.state().sessions.values().cloned().collect()
    }

    pub fn voter_by_address(&self, address: &WalletAddress) -> Option<Voter> {
        self.state()
            .voters
            .iter()
            .find(|v| v.wallet_address == *address)
            .cloned()
    }
}

#[rocket::async_trait]
impl MirrorStore for MemoryMirror {
    async fn voter(&self, id: &Id) -> Result<Option<Voter>, MirrorError> {
        Ok(self.available()?.voters.iter().find(|v| v.id == *id).cloned())
    }

    async fn voters(&self) -> Result<Vec<Voter>, MirrorError> {
        Ok(self.available()?.voters.clone())
    }

    async fn vote_by_voter(&self, voter: &WalletAddress) -> Result<Option<VoteRecord>, MirrorError> {
        Ok(self
            .available()?
            .votes
            .values()
            .find(|v| v.voter_address == *voter)
            .cloned())
    }

    async fn vote_by_tx(&self, tx_hash: &TxHash) -> Result<Option<VoteRecord>, MirrorError> {
        Ok(self.available()?.votes.get(tx_hash).cloned())
    }

    async fn commit_vote(
        &self,
        vote: &VoteRecord,
        count: CountUpdate,
        audit: &AuditEntry,
    ) -> Result<CommitOutcome, MirrorError> {
        let mut state = self.available()?;
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(MirrorError::Unavailable("scripted commit failure".to_string()));
        }
        if state.votes.contains_key(&vote.tx_hash) {
            return Ok(CommitOutcome::AlreadyApplied);
        }
        if state
            .votes
            .values()
            .any(|v| v.voter_address == vote.voter_address)
        {
            return Err(MirrorError::DuplicateVoter(vote.voter_address));
        }

        state.votes.insert(vote.tx_hash, vote.clone());
        let vote_count = state.candidates.get_mut(&vote.candidate_id).map(|c| {
            c.vote_count = match count {
                CountUpdate::Increment => c.vote_count + 1,
                CountUpdate::Set(n) => n,
            };
            c.vote_count
        });
        if let Some(voter) = state
            .voters
            .iter_mut()
            .find(|v| v.wallet_address == vote.voter_address)
        {
            voter.has_voted = true;
        }
        state.audit_log.push(audit.clone());
        Ok(CommitOutcome::Applied { vote_count })
    }

    async fn put_candidate(&self, candidate: &CandidateRecord) -> Result<(), MirrorError> {
        self.available()?
            .candidates
            .insert(candidate.candidate_id, candidate.clone());
        Ok(())
    }

    async fn set_voter_has_voted(
        &self,
        voter: &WalletAddress,
        has_voted: bool,
    ) -> Result<(), MirrorError> {
        let mut state = self.available()?;
        if let Some(voter) = state.voters.iter_mut().find(|v| v.wallet_address == *voter) {
            voter.has_voted = has_voted;
        }
        Ok(())
    }

    async fn put_session(&self, session: &VotingSession) -> Result<(), MirrorError> {
        let mut state = self.available()?;
        for other in state.sessions.values_mut() {
            other.active = false;
        }
        state.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), MirrorError> {
        self.available()?.audit_log.push(entry.clone());
        Ok(())
    }

    async fn save_pending(&self, pending: &PendingWrite) -> Result<(), MirrorError> {
        self.available()?
            .pending
            .insert(pending.tx_hash, pending.clone());
        Ok(())
    }

    async fn remove_pending(&self, tx_hash: &TxHash) -> Result<(), MirrorError> {
        self.available()?.pending.remove(tx_hash);
        Ok(())
    }

    async fn pending_writes(&self) -> Result<Vec<PendingWrite>, MirrorError> {
        Ok(self.available()?.pending.values().cloned().collect())
    }
}
