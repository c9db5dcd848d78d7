use mongodb::{
    bson::doc,
    options::{FindOneAndUpdateOptions, ReplaceOptions, ReturnDocument},
    Client, Database,
};
use rocket::futures::TryStreamExt;

use super::{CommitOutcome, CountUpdate, MirrorError, MirrorStore};
use crate::model::{
    address::WalletAddress,
    audit::AuditEntry,
    candidate::CandidateRecord,
    hash::TxHash,
    mongodb::{is_duplicate_key_error, Coll, Id},
    session::VotingSession,
    vote::VoteRecord,
    voter::Voter,
};
use crate::reconcile::PendingWrite;

/// The mirror, stored in MongoDB.
#[derive(Clone)]
pub struct MongoMirror {
    client: Client,
    voters: Coll<Voter>,
    candidates: Coll<CandidateRecord>,
    votes: Coll<VoteRecord>,
    sessions: Coll<VotingSession>,
    audit_log: Coll<AuditEntry>,
    pending: Coll<PendingWrite>,
}

impl MongoMirror {
    pub fn new(client: Client, db: &Database) -> Self {
        Self {
            client,
            voters: Coll::from_db(db),
            candidates: Coll::from_db(db),
            votes: Coll::from_db(db),
            sessions: Coll::from_db(db),
            audit_log: Coll::from_db(db),
            pending: Coll::from_db(db),
        }
    }
}

#[rocket::async_trait]
impl MirrorStore for MongoMirror {
    async fn voter(&self, id: &Id) -> Result<Option<Voter>, MirrorError> {
        Ok(self.voters.find_one(id.as_doc(), None).await?)
    }

    async fn voters(&self) -> Result<Vec<Voter>, MirrorError> {
        Ok(self.voters.find(None, None).await?.try_collect().await?)
    }

    async fn vote_by_voter(&self, voter: &WalletAddress) -> Result<Option<VoteRecord>, MirrorError> {
        Ok(self
            .votes
            .find_one(doc! {"voter_address": *voter}, None)
            .await?)
    }

    async fn vote_by_tx(&self, tx_hash: &TxHash) -> Result<Option<VoteRecord>, MirrorError> {
        Ok(self.votes.find_one(doc! {"_id": *tx_hash}, None).await?)
    }

    async fn commit_vote(
        &self,
        vote: &VoteRecord,
        count: CountUpdate,
        audit: &AuditEntry,
    ) -> Result<CommitOutcome, MirrorError> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        // The transaction hash is the `_id`, so a replay fails here.
        if let Err(e) = self
            .votes
            .insert_one_with_session(vote, None, &mut session)
            .await
        {
            session.abort_transaction().await?;
            if !is_duplicate_key_error(&e) {
                return Err(e.into());
            }
            return match self.vote_by_tx(&vote.tx_hash).await? {
                Some(_) => Ok(CommitOutcome::AlreadyApplied),
                None => Err(MirrorError::DuplicateVoter(vote.voter_address)),
            };
        }

        let update = match count {
            CountUpdate::Increment => doc! {"$inc": {"vote_count": 1_i64}},
            CountUpdate::Set(n) => doc! {"$set": {"vote_count": n as i64}},
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let candidate = self
            .candidates
            .find_one_and_update_with_session(
                doc! {"_id": vote.candidate_id},
                update,
                options,
                &mut session,
            )
            .await?;

        self.voters
            .update_one_with_session(
                doc! {"wallet_address": vote.voter_address},
                doc! {"$set": {"has_voted": true}},
                None,
                &mut session,
            )
            .await?;

        self.audit_log
            .insert_one_with_session(audit, None, &mut session)
            .await?;

        session.commit_transaction().await?;
        Ok(CommitOutcome::Applied {
            vote_count: candidate.map(|c| c.vote_count),
        })
    }

    async fn put_candidate(&self, candidate: &CandidateRecord) -> Result<(), MirrorError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.candidates
            .replace_one(doc! {"_id": candidate.candidate_id}, candidate, options)
            .await?;
        Ok(())
    }

    async fn set_voter_has_voted(
        &self,
        voter: &WalletAddress,
        has_voted: bool,
    ) -> Result<(), MirrorError> {
        self.voters
            .update_one(
                doc! {"wallet_address": *voter},
                doc! {"$set": {"has_voted": has_voted}},
                None,
            )
            .await?;
        Ok(())
    }

    async fn put_session(&self, session: &VotingSession) -> Result<(), MirrorError> {
        let mut db_session = self.client.start_session(None).await?;
        db_session.start_transaction(None).await?;
        self.sessions
            .update_many_with_session(
                doc! {"_id": {"$ne": session.id}},
                doc! {"$set": {"active": false}},
                None,
                &mut db_session,
            )
            .await?;
        let options = ReplaceOptions::builder().upsert(true).build();
        self.sessions
            .replace_one_with_session(doc! {"_id": session.id}, session, options, &mut db_session)
            .await?;
        db_session.commit_transaction().await?;
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), MirrorError> {
        self.audit_log.insert_one(entry, None).await?;
        Ok(())
    }

    async fn save_pending(&self, pending: &PendingWrite) -> Result<(), MirrorError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.pending
            .replace_one(doc! {"_id": pending.tx_hash}, pending, options)
            .await?;
        Ok(())
    }

    async fn remove_pending(&self, tx_hash: &TxHash) -> Result<(), MirrorError> {
        self.pending.delete_one(doc! {"_id": *tx_hash}, None).await?;
        Ok(())
    }

    async fn pending_writes(&self) -> Result<Vec<PendingWrite>, MirrorError> {
        Ok(self.pending.find(None, None).await?.try_collect().await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use mongodb::{Client, Database};

    use super::*;
    use crate::audit::AuditLogger;
    use crate::model::candidate::CandidateId;

    fn record(tx: u8, voter: &str, candidate_id: CandidateId) -> VoteRecord {
        VoteRecord {
            tx_hash: [tx; 32].into(),
            voter_address: voter.parse().unwrap(),
            candidate_id,
            voter_prodi: "CS".to_string(),
            message_hash: [tx; 32].into(),
            signature: crate::model::hash::VoteSignature::from([tx; 65]),
            block_number: 1,
            timestamp: Utc::now(),
        }
    }

    fn candidate(id: CandidateId, vote_count: u64) -> CandidateRecord {
        CandidateRecord {
            candidate_id: id,
            name: format!("Candidate {id}"),
            prodi: "CS".to_string(),
            active: true,
            vote_count,
        }
    }

    async fn stored_count(mirror: &MongoMirror, id: CandidateId) -> u64 {
        mirror
            .candidates
            .find_one(doc! {"_id": id}, None)
            .await
            .unwrap()
            .unwrap()
            .vote_count
    }

    const VOTER_A: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
    const VOTER_B: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";

    #[backend_test]
    async fn commit_is_idempotent_per_transaction(client: Client, db: Database) {
        let mirror = MongoMirror::new(client, &db);
        mirror.put_candidate(&candidate(7, 4)).await.unwrap();

        let vote = record(1, VOTER_A, 7);
        let audit = AuditLogger::vote_cast(&vote, "a@example.com");
        let first = mirror
            .commit_vote(&vote, CountUpdate::Increment, &audit)
            .await
            .unwrap();
        assert_eq!(first, CommitOutcome::Applied { vote_count: Some(5) });

        let replay = mirror
            .commit_vote(&vote, CountUpdate::Increment, &audit)
            .await
            .unwrap();
        assert_eq!(replay, CommitOutcome::AlreadyApplied);
        assert_eq!(stored_count(&mirror, 7).await, 5);

        let audit_entries = Coll::<AuditEntry>::from_db(&db)
            .count_documents(None, None)
            .await
            .unwrap();
        assert_eq!(audit_entries, 1);
    }

    #[backend_test]
    async fn one_vote_per_voter(client: Client, db: Database) {
        let mirror = MongoMirror::new(client, &db);
        mirror.put_candidate(&candidate(7, 0)).await.unwrap();
        mirror.put_candidate(&candidate(9, 0)).await.unwrap();

        let first = record(1, VOTER_A, 7);
        let audit = AuditLogger::vote_cast(&first, "a@example.com");
        mirror
            .commit_vote(&first, CountUpdate::Increment, &audit)
            .await
            .unwrap();

        let second = record(2, VOTER_A, 9);
        let result = mirror
            .commit_vote(&second, CountUpdate::Increment, &audit)
            .await;
        assert!(matches!(result, Err(MirrorError::DuplicateVoter(_))));
        assert_eq!(stored_count(&mirror, 9).await, 0);

        let other = record(3, VOTER_B, 9);
        let set = mirror
            .commit_vote(&other, CountUpdate::Set(6), &audit)
            .await
            .unwrap();
        assert_eq!(set, CommitOutcome::Applied { vote_count: Some(6) });
    }

    #[backend_test]
    async fn only_one_session_is_active(client: Client, db: Database) {
        let mirror = MongoMirror::new(client, &db);
        let start = Utc::now();
        let first = VotingSession {
            id: start.timestamp(),
            start_time: start,
            end_time: start + Duration::hours(1),
            active: true,
        };
        let second = VotingSession {
            id: first.id + 7200,
            start_time: start + Duration::hours(2),
            end_time: start + Duration::hours(3),
            active: true,
        };
        mirror.put_session(&first).await.unwrap();
        mirror.put_session(&second).await.unwrap();

        let active = Coll::<VotingSession>::from_db(&db)
            .count_documents(doc! {"active": true}, None)
            .await
            .unwrap();
        assert_eq!(active, 1);
    }
}
