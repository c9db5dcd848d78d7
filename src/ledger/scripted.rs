//! An in-process ledger for tests, with knobs for injecting failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rocket::tokio::time::sleep;

use super::{
    LedgerCandidate, LedgerClient, LedgerError, LedgerReceipt, PendingVote, SessionWindow,
    VoteSubmission, VoterState, REVERT_ALREADY_VOTED, REVERT_NOT_ACTIVE,
};
use crate::model::{address::WalletAddress, candidate::CandidateId, hash::TxHash};
use crate::signature;
use crate::test_support::{VOTER_A_ADDRESS, VOTER_B_ADDRESS};

#[derive(Default)]
struct State {
    voters: HashMap<WalletAddress, VoterState>,
    candidates: HashMap<CandidateId, LedgerCandidate>,
    window: Option<SessionWindow>,
    in_flight: HashMap<TxHash, VoteSubmission>,
    /// Included transactions whose submission was reported as failed.
    landed: HashMap<TxHash, (VoteSubmission, u64)>,
    block_number: u64,
    failing_reads: usize,
    /// Fail the next submission ambiguously; `true` if it lands anyway.
    ambiguous_submit: Option<bool>,
    timeouts: usize,
    confirm_delay: Option<std::time::Duration>,
    submit_delay: Option<std::time::Duration>,
    hide_transactions: bool,
}

#[derive(Default)]
pub struct ScriptedLedger {
    state: Mutex<State>,
    reads: AtomicUsize,
    submissions: AtomicUsize,
    next_tx: AtomicUsize,
}

impl ScriptedLedger {
    /// Voters A and B registered; candidates 7 and 9 in "CS" and 8 in "EE";
    /// voting open from an hour ago to an hour from now.
    pub fn standard() -> Arc<Self> {
        let ledger = Self::default();
        for address in [VOTER_A_ADDRESS, VOTER_B_ADDRESS] {
            let address: WalletAddress = address.parse().unwrap();
            ledger.set_voter(&address, true, false);
        }
        ledger.add_candidate(7, "Alice", "CS");
        ledger.add_candidate(8, "Budi", "EE");
        ledger.add_candidate(9, "Citra", "CS");
        let now = Utc::now();
        ledger.set_window(now - Duration::hours(1), now + Duration::hours(1), true);
        Arc::new(ledger)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_voter(&self, address: &WalletAddress, registered: bool, has_voted: bool) {
        self.state().voters.insert(
            *address,
            VoterState {
                registered,
                has_voted,
            },
        );
    }

    pub fn add_candidate(&self, id: CandidateId, name: &str, prodi: &str) {
        self.state().candidates.insert(
            id,
            LedgerCandidate {
                id,
                name: name.to_string(),
                prodi: prodi.to_string(),
                active: true,
                vote_count: 0,
            },
        );
    }

    pub fn deactivate_candidate(&self, id: CandidateId) {
        if let Some(candidate) = self.state().candidates.get_mut(&id) {
            candidate.active = false;
        }
    }

    pub fn set_vote_count(&self, id: CandidateId, vote_count: u64) {
        if let Some(candidate) = self.state().candidates.get_mut(&id) {
            candidate.vote_count = vote_count;
        }
    }

    pub fn vote_count(&self, id: CandidateId) -> u64 {
        self.state().candidates.get(&id).map_or(0, |c| c.vote_count)
    }

    pub fn has_voted(&self, address: &WalletAddress) -> bool {
        self.state().voters.get(address).map_or(false, |v| v.has_voted)
    }

    pub fn set_window(&self, start: DateTime<Utc>, end: DateTime<Utc>, active: bool) {
        self.state().window = Some(SessionWindow { start, end, active });
    }

    /// The next `n` reads fail with a transient error.
    pub fn fail_next_reads(&self, n: usize) {
        self.state().failing_reads = n;
    }

    /// The next submission reports an ambiguous failure. If `lands`, the
    /// vote is recorded anyway.
    pub fn fail_next_submit(&self, lands: bool) {
        self.state().ambiguous_submit = Some(lands);
    }

    /// The next `n` confirmations time out; the transactions stay in flight.
    pub fn time_out_next_confirms(&self, n: usize) {
        self.state().timeouts = n;
    }

    pub fn delay_confirmations(&self, delay: std::time::Duration) {
        self.state().confirm_delay = Some(delay);
    }

    /// Searches for a submission find nothing, as if the transaction had
    /// fallen out of the searched blocks.
    pub fn hide_transactions(&self) {
        self.state().hide_transactions = true;
    }

    /// Submissions are broadcast at once but their hash comes back late.
    pub fn delay_submissions(&self, delay: std::time::Duration) {
        self.state().submit_delay = Some(delay);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<MutexGuard<'_, State>, LedgerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(LedgerError::Unavailable("scripted outage".to_string()));
        }
        Ok(state)
    }

    fn tx_hash(&self) -> TxHash {
        let n = self.next_tx.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        TxHash::from(bytes)
    }

    /// Execute a vote as the contract would.
    fn apply(state: &mut State, vote: &VoteSubmission) -> Result<u64, LedgerError> {
        let now = Utc::now();
        if !state.window.map_or(false, |w| w.contains(now)) {
            return Err(LedgerError::Reverted(REVERT_NOT_ACTIVE.to_string()));
        }
        let voter = state.voters.entry(vote.voter).or_default();
        if voter.has_voted {
            return Err(LedgerError::Reverted(REVERT_ALREADY_VOTED.to_string()));
        }
        voter.has_voted = true;
        if let Some(candidate) = state.candidates.get_mut(&vote.candidate_id) {
            candidate.vote_count += 1;
        }
        state.block_number += 1;
        Ok(state.block_number)
    }
}

#[rocket::async_trait]
impl LedgerClient for ScriptedLedger {
    async fn voter_state(&self, voter: &WalletAddress) -> Result<VoterState, LedgerError> {
        Ok(self.read()?.voters.get(voter).copied().unwrap_or_default())
    }

    async fn candidate(&self, id: CandidateId) -> Result<LedgerCandidate, LedgerError> {
        Ok(self
            .read()?
            .candidates
            .get(&id)
            .cloned()
            .unwrap_or(LedgerCandidate {
                id: 0,
                name: String::new(),
                prodi: String::new(),
                active: false,
                vote_count: 0,
            }))
    }

    async fn candidate_count(&self) -> Result<u32, LedgerError> {
        Ok(self.read()?.candidates.keys().copied().max().unwrap_or(0))
    }

    async fn session_window(&self) -> Result<SessionWindow, LedgerError> {
        self.read()?
            .window
            .ok_or_else(|| LedgerError::BadResponse("no voting session".to_string()))
    }

    async fn submit_vote(&self, submission: &VoteSubmission) -> Result<PendingVote, LedgerError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if !signature::verify(&submission.message_hash, &submission.signature, &submission.voter) {
            return Err(LedgerError::Reverted("execution reverted: Invalid signature".to_string()));
        }
        let tx_hash = self.tx_hash();
        let (result, delay) = {
            let mut state = self.state();
            if state.voters.get(&submission.voter).map_or(false, |v| v.has_voted) {
                return Err(LedgerError::Reverted(REVERT_ALREADY_VOTED.to_string()));
            }
            let result = match state.ambiguous_submit.take() {
                Some(true) => {
                    let block_number = Self::apply(&mut state, submission)?;
                    state.landed.insert(tx_hash, (submission.clone(), block_number));
                    Err(LedgerError::SubmissionFailed("connection reset".to_string()))
                }
                Some(false) => Err(LedgerError::SubmissionFailed("connection reset".to_string())),
                None => {
                    state.in_flight.insert(tx_hash, submission.clone());
                    Ok(PendingVote { tx_hash })
                }
            };
            (result, state.submit_delay)
        };
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        result
    }

    async fn find_submission(
        &self,
        submission: &VoteSubmission,
    ) -> Result<Option<PendingVote>, LedgerError> {
        let state = self.read()?;
        if state.hide_transactions {
            return Ok(None);
        }
        let found = state
            .in_flight
            .iter()
            .chain(state.landed.iter().map(|(tx_hash, (vote, _))| (tx_hash, vote)))
            .find(|(_, vote)| *vote == submission)
            .map(|(tx_hash, _)| PendingVote { tx_hash: *tx_hash });
        Ok(found)
    }

    async fn confirm(&self, pending: &PendingVote) -> Result<LedgerReceipt, LedgerError> {
        let delay = self.state().confirm_delay;
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let mut state = self.state();
        if state.timeouts > 0 {
            state.timeouts -= 1;
            return Err(LedgerError::Timeout(pending.tx_hash));
        }
        if let Some((_, block_number)) = state.landed.get(&pending.tx_hash) {
            return Ok(LedgerReceipt {
                tx_hash: pending.tx_hash,
                block_number: *block_number,
            });
        }
        let submission = state
            .in_flight
            .remove(&pending.tx_hash)
            .ok_or_else(|| LedgerError::BadResponse(format!("unknown transaction {}", pending.tx_hash)))?;
        let block_number = Self::apply(&mut state, &submission)?;
        Ok(LedgerReceipt {
            tx_hash: pending.tx_hash,
            block_number,
        })
    }
}
