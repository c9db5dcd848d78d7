use std::ops::Deref;

use log::debug;
use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::{
    audit::AuditEntry,
    candidate::CandidateRecord,
    session::VotingSession,
    vote::VoteRecord,
    voter::Voter,
};
use crate::reconcile::PendingWrite;

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Voter collections
const VOTERS: &str = "voters";
impl MongoCollection for Voter {
    const NAME: &'static str = VOTERS;
}

// Candidate collection
const CANDIDATES: &str = "candidates";
impl MongoCollection for CandidateRecord {
    const NAME: &'static str = CANDIDATES;
}

// Vote collection
const VOTES: &str = "votes";
impl MongoCollection for VoteRecord {
    const NAME: &'static str = VOTES;
}

// Session collection
const SESSIONS: &str = "voting_sessions";
impl MongoCollection for VotingSession {
    const NAME: &'static str = SESSIONS;
}

// Audit collection
const AUDIT_LOG: &str = "audit_log";
impl MongoCollection for AuditEntry {
    const NAME: &'static str = AUDIT_LOG;
}

// Reconciliation queue
const PENDING_WRITES: &str = "pending_reconciliations";
impl MongoCollection for PendingWrite {
    const NAME: &'static str = PENDING_WRITES;
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // Voter collection.
    let voter_index = IndexModel::builder()
        .keys(doc! {"wallet_address": 1})
        .options(unique.clone())
        .build();
    Coll::<Voter>::from_db(db)
        .create_index(voter_index, None)
        .await?;
    let email_index = IndexModel::builder()
        .keys(doc! {"email": 1})
        .options(unique.clone())
        .build();
    Coll::<Voter>::from_db(db)
        .create_index(email_index, None)
        .await?;

    // Vote collection: one vote per voter, ever. The transaction hash is the `_id`.
    let vote_index = IndexModel::builder()
        .keys(doc! {"voter_address": 1})
        .options(unique.clone())
        .build();
    Coll::<VoteRecord>::from_db(db)
        .create_index(vote_index, None)
        .await?;

    // Audit log, queried by target.
    let audit_index = IndexModel::builder()
        .keys(doc! {"target_type": 1, "target_id": 1})
        .build();
    Coll::<AuditEntry>::from_db(db)
        .create_index(audit_index, None)
        .await?;

    Ok(())
}
