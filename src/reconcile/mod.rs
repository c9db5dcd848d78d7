//! Folding ledger outcomes into the mirror.
//!
//! The live path commits each confirmed vote with an increment. When that
//! fails, the vote is queued and retried later with the candidate's count
//! *set* from a fresh ledger read, so a write that half-happened can never be
//! counted twice. A full resync sets every mirrored count and flag from the
//! ledger and is safe to run at any time, concurrently with live voting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use log::{debug, error, info, warn};
use rocket::tokio::{self, task::JoinHandle, time::Duration};
use serde::Serialize;

use crate::audit::AuditLogger;
use crate::error::Result;
use crate::ledger::{retry_read, LedgerClient, LedgerError, PendingVote, RetryPolicy};
use crate::mirror::{CommitOutcome, CountUpdate, MirrorError, MirrorStore};
use crate::model::{candidate::CandidateRecord, hash::TxHash, session::VotingSession};
use crate::scheduled_task::ScheduledTask;

mod state;

pub use state::{
    ConfirmedOnLedger, ConfirmedVote, PendingMirrorWrite, PendingStage, PendingWrite, Reconciled,
    ReconciliationState, Unreconciled, VoteDraft,
};

/// What happened to the mirror after a vote was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    Reconciled { vote_count: Option<u64> },
    /// The mirror write failed and will be retried; the vote itself stands.
    Deferred,
}

/// Summary of one pass over the pending queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub reconciled: usize,
    /// Entries dropped because the ledger rejected the vote after all.
    pub dropped: usize,
    pub remaining: usize,
}

/// Summary of a full resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub candidates_synced: usize,
    /// Voters whose cached `has_voted` flag changed.
    pub voters_updated: usize,
    pub pending_reconciled: usize,
    pub pending_remaining: usize,
    pub failures: usize,
}

enum RetryOutcome {
    Reconciled,
    Dropped(String),
    StillPending(PendingWrite),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Reconciler {
    ledger: Arc<dyn LedgerClient>,
    mirror: Arc<dyn MirrorStore>,
    audit: AuditLogger,
    reads: RetryPolicy,
    retry_interval: Duration,
    queue: Mutex<HashMap<TxHash, PendingWrite>>,
    retry_task: Mutex<Option<ScheduledTask<()>>>,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        mirror: Arc<dyn MirrorStore>,
        reads: RetryPolicy,
        retry_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            audit: AuditLogger::new(mirror.clone()),
            mirror,
            reads,
            retry_interval,
            queue: Default::default(),
            retry_task: Default::default(),
        }
    }

    /// Load writes left pending by a previous run and schedule their retry.
    pub async fn load_pending(self: &Arc<Self>) -> Result<usize> {
        let pending = self.mirror.pending_writes().await?;
        let count = pending.len();
        {
            let mut queue = lock(&self.queue);
            for write in pending {
                queue.insert(write.tx_hash, write);
            }
        }
        if count > 0 {
            warn!("Loaded {count} pending mirror write(s) from a previous run");
            self.schedule_retry();
        }
        Ok(count)
    }

    /// Transaction hashes of every write still waiting to be reconciled.
    pub fn pending(&self) -> Vec<TxHash> {
        lock(&self.queue).keys().copied().collect()
    }

    /// Commit a freshly confirmed vote to the mirror. Never fails: if the
    /// mirror cannot be written the vote is queued for retry.
    pub async fn reconcile(self: &Arc<Self>, vote: ConfirmedVote<ConfirmedOnLedger>) -> MirrorOutcome {
        match self.try_commit(vote, CountUpdate::Increment).await {
            Ok(vote) => MirrorOutcome::Reconciled {
                vote_count: vote.state.vote_count,
            },
            Err((vote, MirrorError::DuplicateVoter(voter))) => {
                // The ledger accepted a second vote from one voter. A retry
                // cannot fix that; resync will still correct the counts.
                error!(
                    "Ledger confirmed {} but the mirror already holds a different vote for {voter}",
                    vote.record.tx_hash
                );
                let reason = format!("mirror already holds a vote for {voter}");
                self.audit_dropped(vote.record.tx_hash, &reason).await;
                MirrorOutcome::Deferred
            }
            Err((vote, e)) => {
                warn!(
                    "Mirror update for confirmed vote {} failed, queueing for retry: {e}",
                    vote.record.tx_hash
                );
                let pending = vote.defer(e.to_string());
                self.enqueue(pending.to_pending_write(Utc::now())).await;
                MirrorOutcome::Deferred
            }
        }
    }

    /// Track a vote that was broadcast but whose confirmation was not seen.
    pub async fn track_unconfirmed(
        self: &Arc<Self>,
        draft: VoteDraft,
        tx_hash: TxHash,
        actor: String,
        error: &LedgerError,
    ) {
        warn!("Vote {tx_hash} was broadcast but not confirmed; tracking it for reconciliation");
        let pending =
            PendingWrite::awaiting_confirmation(draft, tx_hash, actor, error.to_string(), Utc::now());
        self.enqueue(pending).await;
    }

    async fn try_commit<S: Unreconciled>(
        &self,
        vote: ConfirmedVote<S>,
        count: CountUpdate,
    ) -> std::result::Result<ConfirmedVote<Reconciled>, (ConfirmedVote<S>, MirrorError)> {
        let audit = AuditLogger::vote_cast(&vote.record, &vote.actor);
        match self.mirror.commit_vote(&vote.record, count, &audit).await {
            Ok(CommitOutcome::Applied { vote_count }) => {
                debug!("Mirror updated for vote {}", vote.record.tx_hash);
                Ok(vote.reconciled(vote_count))
            }
            Ok(CommitOutcome::AlreadyApplied) => {
                debug!("Vote {} was already in the mirror", vote.record.tx_hash);
                Ok(vote.reconciled(None))
            }
            Err(e) => Err((vote, e)),
        }
    }

    /// Queue a write, persist it if the mirror allows, and make sure a retry
    /// is scheduled.
    async fn enqueue(self: &Arc<Self>, pending: PendingWrite) {
        lock(&self.queue).insert(pending.tx_hash, pending.clone());
        if let Err(e) = self.mirror.save_pending(&pending).await {
            warn!(
                "Could not persist pending write {}; it is held in memory only: {e}",
                pending.tx_hash
            );
        }
        if let Err(e) = self
            .audit
            .append(&AuditLogger::reconciliation_pending(&pending))
            .await
        {
            warn!("Could not audit pending write {}: {e}", pending.tx_hash);
        }
        self.schedule_retry();
    }

    /// Schedule a retry pass unless one is already waiting.
    ///
    /// A running pass clears its own slot before it finishes, so a task found
    /// here will still look at the queue after this write was added.
    fn schedule_retry(self: &Arc<Self>) {
        let mut slot = lock(&self.retry_task);
        if matches!(&*slot, Some(task) if !task.is_finished()) {
            return;
        }
        *slot = Some(Self::retry_task_after(Arc::downgrade(self), self.retry_interval));
    }

    fn retry_task_after(reconciler: Weak<Self>, delay: Duration) -> ScheduledTask<()> {
        ScheduledTask::after(delay, async move {
            let Some(reconciler) = reconciler.upgrade() else {
                return;
            };
            let report = reconciler.retry_pending().await;
            debug!("Retry pass finished: {report:?}");
            // Count the queue rather than the report: writes queued during
            // the pass were not part of it. The slot stays locked until it is
            // replaced or cleared so `schedule_retry` cannot see this task as
            // still waiting once the count is taken.
            let mut slot = lock(&reconciler.retry_task);
            let remaining = lock(&reconciler.queue).len();
            *slot = if remaining > 0 {
                let interval = reconciler.retry_interval;
                warn!("{remaining} mirror write(s) still pending, retrying in {interval:?}");
                Some(Self::retry_task_after(Arc::downgrade(&reconciler), interval))
            } else {
                None
            };
        })
    }

    /// Make one attempt at every queued write.
    pub async fn retry_pending(&self) -> RetryReport {
        let pending: Vec<PendingWrite> = lock(&self.queue).values().cloned().collect();
        let mut report = RetryReport::default();
        for write in pending {
            let tx_hash = write.tx_hash;
            let attempts = write.attempts;
            match self.retry_one(write).await {
                RetryOutcome::Reconciled => {
                    info!("Deferred mirror write for {tx_hash} reconciled");
                    self.forget(tx_hash).await;
                    if let Err(e) = self
                        .audit
                        .append(&AuditLogger::vote_reconciled(tx_hash, attempts))
                        .await
                    {
                        warn!("Could not audit reconciliation of {tx_hash}: {e}");
                    }
                    report.reconciled += 1;
                }
                RetryOutcome::Dropped(reason) => {
                    self.forget(tx_hash).await;
                    self.audit_dropped(tx_hash, &reason).await;
                    report.dropped += 1;
                }
                RetryOutcome::StillPending(write) => {
                    if let Err(e) = self.mirror.save_pending(&write).await {
                        debug!("Could not persist pending write {tx_hash}: {e}");
                    }
                    lock(&self.queue).insert(tx_hash, write);
                    report.remaining += 1;
                }
            }
        }
        report
    }

    async fn retry_one(&self, mut write: PendingWrite) -> RetryOutcome {
        // Finish confirmation first if the caller never saw it.
        if let PendingStage::AwaitingConfirmation { draft } = &write.stage {
            let pending = PendingVote {
                tx_hash: write.tx_hash,
            };
            match self.ledger.confirm(&pending).await {
                Ok(receipt) => {
                    info!(
                        "Previously unconfirmed vote {} was included in block {}",
                        receipt.tx_hash, receipt.block_number
                    );
                    let record = draft.clone().into_record(&receipt);
                    write.stage = PendingStage::MirrorWrite { record };
                }
                Err(LedgerError::Reverted(reason)) => {
                    warn!("Unconfirmed vote {} was rejected by the ledger: {reason}", write.tx_hash);
                    return RetryOutcome::Dropped(format!("rejected by the ledger: {reason}"));
                }
                Err(e) => {
                    write.attempts += 1;
                    write.last_error = e.to_string();
                    return RetryOutcome::StillPending(write);
                }
            }
        }

        let Some(vote) = write.as_mirror_write() else {
            return RetryOutcome::StillPending(write);
        };
        let candidate_id = vote.record.candidate_id;
        let count = match retry_read(&self.reads, "getCandidate", || self.ledger.candidate(candidate_id)).await {
            Ok(candidate) => candidate.vote_count,
            Err(e) => {
                return RetryOutcome::StillPending(vote.failed_again(e.to_string()).to_pending_write(write.queued_at));
            }
        };
        match self.try_commit(vote, CountUpdate::Set(count)).await {
            Ok(_) => RetryOutcome::Reconciled,
            Err((vote, MirrorError::DuplicateVoter(voter))) => {
                error!(
                    "Dropping deferred write {}: the mirror already holds a different vote for {voter}",
                    vote.record.tx_hash
                );
                RetryOutcome::Dropped(format!("mirror already holds a vote for {voter}"))
            }
            Err((vote, e)) => {
                RetryOutcome::StillPending(vote.failed_again(e.to_string()).to_pending_write(write.queued_at))
            }
        }
    }

    async fn audit_dropped(&self, tx_hash: TxHash, reason: &str) {
        if let Err(e) = self.audit.append(&AuditLogger::vote_dropped(tx_hash, reason)).await {
            warn!("Could not audit dropped vote {tx_hash}: {e}");
        }
    }

    async fn forget(&self, tx_hash: TxHash) {
        lock(&self.queue).remove(&tx_hash);
        if let Err(e) = self.mirror.remove_pending(&tx_hash).await {
            debug!("Could not remove persisted pending write {tx_hash}: {e}");
        }
    }

    /// Set every mirrored count, voting flag and the session window from the
    /// ledger. Idempotent; failures on individual items are counted and
    /// skipped.
    pub async fn resync(&self) -> Result<ResyncReport> {
        info!("Resynchronising mirror from ledger...");
        let retried = self.retry_pending().await;
        let mut report = ResyncReport {
            pending_reconciled: retried.reconciled,
            pending_remaining: retried.remaining,
            ..Default::default()
        };

        // Candidates.
        let count = retry_read(&self.reads, "candidateCount", || self.ledger.candidate_count()).await?;
        for id in 1..=count {
            let candidate = match retry_read(&self.reads, "getCandidate", || self.ledger.candidate(id)).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!("Resync: could not read candidate {id}: {e}");
                    report.failures += 1;
                    continue;
                }
            };
            if !candidate.exists() {
                debug!("Resync: no candidate {id} on the ledger");
                continue;
            }
            let record = CandidateRecord {
                candidate_id: id,
                name: candidate.name,
                prodi: candidate.prodi,
                active: candidate.active,
                vote_count: candidate.vote_count,
            };
            match self.mirror.put_candidate(&record).await {
                Ok(()) => report.candidates_synced += 1,
                Err(e) => {
                    warn!("Resync: could not write candidate {id}: {e}");
                    report.failures += 1;
                }
            }
        }

        // Voters.
        for voter in self.mirror.voters().await? {
            if !voter.verified {
                continue;
            }
            let address = voter.wallet_address;
            match retry_read(&self.reads, "getVoterInfo", || self.ledger.voter_state(&address)).await {
                Ok(state) if state.has_voted != voter.has_voted => {
                    match self.mirror.set_voter_has_voted(&address, state.has_voted).await {
                        Ok(()) => report.voters_updated += 1,
                        Err(e) => {
                            warn!("Resync: could not update voter {address}: {e}");
                            report.failures += 1;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Resync: could not read voter {address}: {e}");
                    report.failures += 1;
                }
            }
        }

        // Session window.
        match retry_read(&self.reads, "getVotingStatus", || self.ledger.session_window()).await {
            Ok(window) => {
                let session = VotingSession {
                    id: window.start.timestamp(),
                    start_time: window.start,
                    end_time: window.end,
                    active: window.active,
                };
                if let Err(e) = self.mirror.put_session(&session).await {
                    warn!("Resync: could not record the session window: {e}");
                    report.failures += 1;
                }
            }
            Err(e) => {
                warn!("Resync: could not read the session window: {e}");
                report.failures += 1;
            }
        }

        if let Err(e) = self.audit.append(&AuditLogger::ledger_sync(&report)).await {
            warn!("Could not audit resync: {e}");
        }
        info!("...resync complete: {report:?}");
        Ok(report)
    }
}

/// Run a resync every `interval` for as long as the server is up.
/// An interval of zero disables periodic resync.
pub fn spawn_periodic_resync(
    reconciler: Arc<Reconciler>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        info!("Periodic resync disabled");
        return None;
    }
    info!("Resyncing from the ledger every {interval:?}");
    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = reconciler.resync().await {
                error!("Periodic resync failed: {e}");
            }
        }
    }))
}
