//! Casting votes.
//!
//! One vote is: decrypt the voter's key, check eligibility on the ledger,
//! sign, submit, await confirmation, fold the result into the mirror. Once
//! the vote is signed, the rest runs on a spawned task that owns the voter's
//! lock, so a caller that stops waiting neither abandons a broadcast vote nor
//! lets a second attempt for the same voter start early.

use std::sync::Arc;

use chrono::{Timelike, Utc};
use log::{debug, error, info, warn};
use mongodb::{Client, Database};
use rocket::{
    fairing::{Fairing, Info, Kind},
    tokio::{self, time::Duration},
    Build, Orbit, Rocket,
};
use serde::Serialize;

use crate::audit::AuditLogger;
use crate::config::{Config, LedgerConfig};
use crate::custody::{CustodyError, KeyCustodian};
use crate::error::{AuthorizationError, Error, Result};
use crate::guard::AuthorizationGuard;
use crate::ledger::{
    retry_read, LedgerClient, LedgerError, LedgerReceipt, PendingVote, RetryPolicy, VoteSubmission,
};
use crate::mirror::{MirrorStore, MongoMirror};
use crate::model::{
    candidate::CandidateId,
    hash::{MessageDigest, TxHash},
    mongodb::Id,
    vote::VoteRecord,
};
use crate::reconcile::{spawn_periodic_resync, ConfirmedVote, MirrorOutcome, Reconciler, VoteDraft};
use crate::signature;

mod locks;

pub use locks::{VoterLock, VoterLocks};

/// Tunables for the voting engine.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// Retry policy for ledger reads.
    pub reads: RetryPolicy,
    /// Submissions per attempt, counting the first. Each resubmission is
    /// preceded by a re-read of the voter's state on the ledger.
    pub max_submit_attempts: u32,
    /// Delay between retries of deferred mirror writes.
    pub retry_interval: Duration,
}

/// Proof of a successful vote, returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub candidate_id: CandidateId,
    pub candidate_name: String,
    /// The candidate's tally after this vote, if it could be determined.
    pub new_vote_count: Option<u64>,
}

/// A stored vote and whether it still checks out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteVerification {
    pub vote: VoteRecord,
    /// The stored digest is the one this vote's fields produce.
    pub digest_matches: bool,
    /// The signature over the stored digest recovers the voter's address.
    pub signature_valid: bool,
}

pub struct VotingService {
    custodian: KeyCustodian,
    ledger: Arc<dyn LedgerClient>,
    mirror: Arc<dyn MirrorStore>,
    guard: AuthorizationGuard,
    reconciler: Arc<Reconciler>,
    audit: AuditLogger,
    locks: VoterLocks,
    reads: RetryPolicy,
    max_submit_attempts: u32,
}

/// Everything needed to see a signed vote through to the mirror, owned by
/// the task that does it.
struct Settlement {
    ledger: Arc<dyn LedgerClient>,
    reconciler: Arc<Reconciler>,
    audit: AuditLogger,
    reads: RetryPolicy,
    max_submit_attempts: u32,
}

impl VotingService {
    pub fn new(
        custodian: KeyCustodian,
        ledger: Arc<dyn LedgerClient>,
        mirror: Arc<dyn MirrorStore>,
        settings: ServiceSettings,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            ledger.clone(),
            mirror.clone(),
            settings.reads,
            settings.retry_interval,
        ));
        Self {
            custodian,
            guard: AuthorizationGuard::new(ledger.clone(), settings.reads),
            ledger,
            audit: AuditLogger::new(mirror.clone()),
            mirror,
            reconciler,
            locks: VoterLocks::default(),
            reads: settings.reads,
            max_submit_attempts: settings.max_submit_attempts.max(1),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn locks(&self) -> &VoterLocks {
        &self.locks
    }

    /// Cast `voter_id`'s vote for `candidate_id`.
    ///
    /// Fails before submission on any eligibility problem. Once the ledger
    /// has confirmed the vote the call succeeds, whether or not the mirror
    /// could be updated.
    pub async fn cast_vote(&self, voter_id: &Id, candidate_id: CandidateId) -> Result<VoteReceipt> {
        if candidate_id == 0 {
            return Err(Error::Validation("Candidate IDs start at 1".to_string()));
        }
        let voter = self
            .mirror
            .voter(voter_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No voter with ID {voter_id}")))?;

        let lock = self
            .locks
            .try_acquire(voter.wallet_address)
            .ok_or(AuthorizationError::VoteInFlight)?;

        let key_address = self
            .custodian
            .with_signing_key(&voter.encrypted_key, signature::address_of_signer)?;

        // Whole seconds, since that is the precision bound into the digest.
        let now = Utc::now();
        let signed_at = now.with_nanosecond(0).unwrap_or(now);
        let eligibility = self
            .guard
            .check(&voter, &key_address, candidate_id, signed_at)
            .await?;

        let message_hash =
            signature::build_message_hash(&voter.wallet_address, candidate_id, signed_at.timestamp());
        let vote_signature = self
            .custodian
            .with_signing_key(&voter.encrypted_key, |key| signature::sign(&message_hash, key))?
            .ok_or(Error::Decryption(CustodyError::InvalidKey))?;

        let submission = VoteSubmission {
            voter: voter.wallet_address,
            candidate_id,
            message_hash,
            signature: vote_signature,
        };
        let draft = VoteDraft {
            voter_address: voter.wallet_address,
            candidate_id,
            voter_prodi: voter.prodi.clone(),
            message_hash,
            signature: vote_signature,
            signed_at,
        };
        let settlement = Settlement {
            ledger: self.ledger.clone(),
            reconciler: self.reconciler.clone(),
            audit: self.audit.clone(),
            reads: self.reads,
            max_submit_attempts: self.max_submit_attempts,
        };
        let task = tokio::spawn(settlement.run(lock, submission, draft, voter.email.clone()));
        let (receipt, outcome) = match task.await {
            Ok(result) => result?,
            Err(e) => {
                error!("Vote task for {} failed: {e}", voter.wallet_address);
                return Err(LedgerError::SubmissionFailed(format!("vote task failed: {e}")).into());
            }
        };

        let new_vote_count = match outcome {
            MirrorOutcome::Reconciled {
                vote_count: Some(count),
            } => Some(count),
            _ => retry_read(&self.reads, "getCandidate", || self.ledger.candidate(candidate_id))
                .await
                .map(|candidate| candidate.vote_count)
                .map_err(|e| debug!("Could not read the new tally for candidate {candidate_id}: {e}"))
                .ok(),
        };

        Ok(VoteReceipt {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            candidate_id,
            candidate_name: eligibility.candidate.name,
            new_vote_count,
        })
    }

    /// The voter's recorded vote, if the mirror has one.
    pub async fn vote_of(&self, voter_id: &Id) -> Result<Option<VoteRecord>> {
        let voter = self
            .mirror
            .voter(voter_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No voter with ID {voter_id}")))?;
        Ok(self.mirror.vote_by_voter(&voter.wallet_address).await?)
    }

    /// Re-check a stored vote's digest and signature.
    pub async fn verify_vote(&self, tx_hash: &TxHash) -> Result<VoteVerification> {
        let vote = self
            .mirror
            .vote_by_tx(tx_hash)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No vote with transaction {tx_hash}")))?;
        let expected: MessageDigest = signature::build_message_hash(
            &vote.voter_address,
            vote.candidate_id,
            vote.timestamp.timestamp(),
        );
        let digest_matches = expected == vote.message_hash;
        let signature_valid = signature::verify(&vote.message_hash, &vote.signature, &vote.voter_address);
        if !(digest_matches && signature_valid) {
            warn!("Stored vote {tx_hash} failed verification");
        }
        Ok(VoteVerification {
            vote,
            digest_matches,
            signature_valid,
        })
    }
}

impl Settlement {
    /// Submit, confirm and reconcile. The voter's lock is released when
    /// this returns.
    async fn run(
        self,
        _lock: VoterLock,
        submission: VoteSubmission,
        draft: VoteDraft,
        actor: String,
    ) -> Result<(LedgerReceipt, MirrorOutcome)> {
        let pending = self.submit(&submission, &actor).await?;
        info!(
            "Voter {} submitted a vote for candidate {} in {}",
            submission.voter, submission.candidate_id, pending.tx_hash
        );

        match self.ledger.confirm(&pending).await {
            Ok(receipt) => {
                info!(
                    "Vote {} confirmed in block {}",
                    receipt.tx_hash, receipt.block_number
                );
                let vote = ConfirmedVote::new(draft, &receipt, actor);
                let outcome = self.reconciler.reconcile(vote).await;
                Ok((receipt, outcome))
            }
            Err(LedgerError::Reverted(reason)) => {
                warn!("Vote {} was rejected by the ledger: {reason}", pending.tx_hash);
                Err(LedgerError::Reverted(reason).into())
            }
            Err(e) => {
                // Still broadcast; it may land later.
                self.reconciler
                    .track_unconfirmed(draft, pending.tx_hash, actor, &e)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Submit, resubmitting after an ambiguous failure only once the ledger
    /// shows neither a matching transaction nor a recorded vote.
    async fn submit(&self, submission: &VoteSubmission, actor: &str) -> Result<PendingVote> {
        let mut attempt = 1;
        loop {
            let reason = match self.ledger.submit_vote(submission).await {
                Ok(pending) => return Ok(pending),
                Err(LedgerError::SubmissionFailed(reason)) if attempt < self.max_submit_attempts => {
                    reason
                }
                Err(e) => return Err(e.into()),
            };
            warn!(
                "Submission for {} failed ({reason}), re-checking the ledger before resubmitting",
                submission.voter
            );
            match retry_read(&self.reads, "findSubmission", || {
                self.ledger.find_submission(submission)
            })
            .await
            {
                Ok(Some(pending)) => {
                    info!(
                        "Failed submission for {} reached the ledger as {}",
                        submission.voter, pending.tx_hash
                    );
                    return Ok(pending);
                }
                Ok(None) => {}
                Err(e) => warn!("Could not search the ledger for {}'s vote: {e}", submission.voter),
            }
            let state = retry_read(&self.reads, "getVoterInfo", || {
                self.ledger.voter_state(&submission.voter)
            })
            .await?;
            if state.has_voted {
                error!(
                    "Ledger already records a vote for {} but no transaction matches this submission",
                    submission.voter
                );
                let entry =
                    AuditLogger::submission_unresolved(&submission.voter, &submission.message_hash, actor);
                if let Err(e) = self.audit.append(&entry).await {
                    warn!("Could not audit unresolved submission for {}: {e}", submission.voter);
                }
                return Err(AuthorizationError::AlreadyVoted.into());
            }
            attempt += 1;
        }
    }
}

/// A fairing that builds the [`VotingService`], reloads writes left pending
/// by a previous run, and places the service into managed state. Once the
/// server is up, it starts the periodic resync.
///
/// This fairing depends on the config, database and ledger being available
/// in managed state, and so must be attached after the fairings responsible
/// for those.
pub struct VotingServiceFairing;

#[rocket::async_trait]
impl Fairing for VotingServiceFairing {
    fn info(&self) -> Info {
        Info {
            name: "Voting Service",
            kind: Kind::Ignite | Kind::Liftoff,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        info!("Starting voting service...");
        let (Some(config), Some(ledger_config), Some(ledger), Some(client), Some(db)) = (
            rocket.state::<Config>(),
            rocket.state::<LedgerConfig>(),
            rocket.state::<Arc<dyn LedgerClient>>(),
            rocket.state::<Client>(),
            rocket.state::<Database>(),
        ) else {
            error!("Config, database and ledger must be available before the voting service");
            return Err(rocket);
        };

        let custodian = match KeyCustodian::new(config.key_encryption_secret()) {
            Ok(custodian) => custodian,
            Err(e) => {
                error!("Failed to set up key custody: {e}");
                return Err(rocket);
            }
        };
        let mirror: Arc<dyn MirrorStore> = Arc::new(MongoMirror::new(client.clone(), db));
        let settings = ServiceSettings {
            reads: ledger_config.read_policy(),
            max_submit_attempts: config.max_submit_attempts(),
            retry_interval: config.reconcile_retry_interval(),
        };
        let service = VotingService::new(custodian, ledger.clone(), mirror, settings);

        if let Err(e) = service.reconciler().load_pending().await {
            error!("Failed to load pending mirror writes: {e}");
            return Err(rocket);
        }
        info!("...voting service ready!");

        rocket = rocket.manage(Arc::new(service));
        Ok(rocket)
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        match (rocket.state::<Arc<VotingService>>(), rocket.state::<Config>()) {
            (Some(service), Some(config)) => {
                spawn_periodic_resync(service.reconciler().clone(), config.resync_interval());
            }
            _ => error!("Voting service was not available at liftoff"),
        }
    }
}
