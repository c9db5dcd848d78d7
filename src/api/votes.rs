use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::{http::Status, serde::json::Json, Route, State};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    address::WalletAddress,
    candidate::CandidateId,
    hash::{MessageDigest, TxHash, VoteSignature},
    mongodb::Id,
    vote::VoteRecord,
};
use crate::voting::{VoteReceipt, VoteVerification, VotingService};

pub fn routes() -> Vec<Route> {
    routes![cast_vote, vote_history, verify_vote]
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_id: CandidateId,
}

/// A stored vote, as returned to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteView {
    pub tx_hash: TxHash,
    pub voter_address: WalletAddress,
    pub candidate_id: CandidateId,
    pub voter_prodi: String,
    pub message_hash: MessageDigest,
    pub signature: VoteSignature,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

impl From<VoteRecord> for VoteView {
    fn from(vote: VoteRecord) -> Self {
        Self {
            tx_hash: vote.tx_hash,
            voter_address: vote.voter_address,
            candidate_id: vote.candidate_id,
            voter_prodi: vote.voter_prodi,
            message_hash: vote.message_hash,
            signature: vote.signature,
            block_number: vote.block_number,
            timestamp: vote.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationView {
    #[serde(flatten)]
    pub vote: VoteView,
    pub digest_matches: bool,
    pub signature_valid: bool,
}

impl From<VoteVerification> for VerificationView {
    fn from(verification: VoteVerification) -> Self {
        Self {
            vote: verification.vote.into(),
            digest_matches: verification.digest_matches,
            signature_valid: verification.signature_valid,
        }
    }
}

#[post("/voters/<voter_id>/vote", data = "<request>", format = "json")]
async fn cast_vote(
    voter_id: Id,
    request: Json<VoteRequest>,
    service: &State<Arc<VotingService>>,
) -> Result<(Status, Json<VoteReceipt>)> {
    let receipt = service.cast_vote(&voter_id, request.candidate_id).await?;
    Ok((Status::Created, Json(receipt)))
}

#[get("/voters/<voter_id>/vote")]
async fn vote_history(
    voter_id: Id,
    service: &State<Arc<VotingService>>,
) -> Result<Json<Vec<VoteView>>> {
    let votes = service.vote_of(&voter_id).await?;
    Ok(Json(votes.into_iter().map(VoteView::from).collect()))
}

#[get("/votes/<tx_hash>/verify")]
async fn verify_vote(
    tx_hash: TxHash,
    service: &State<Arc<VotingService>>,
) -> Result<Json<VerificationView>> {
    let verification = service.verify_vote(&tx_hash).await?;
    Ok(Json(verification.into()))
}
