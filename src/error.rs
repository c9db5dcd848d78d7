use std::io::Cursor;

use log::{error, warn};
use rocket::{
    http::{ContentType, Status, StatusClass},
    response::{Responder, Response},
    serde::json::serde_json,
    Request,
};
use serde::Serialize;
use thiserror::Error;

use crate::custody::CustodyError;
use crate::ledger::{
    LedgerError, REVERT_ALREADY_VOTED, REVERT_CANDIDATE_INACTIVE, REVERT_NOT_ACTIVE,
    REVERT_NOT_REGISTERED, REVERT_PRODI_MISMATCH,
};
use crate::mirror::MirrorError;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a voter may not cast this vote. Raised before anything is submitted,
/// or mapped from a recognised ledger revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationError {
    #[error("Voter is not registered on the ledger")]
    NotRegistered,
    #[error("Voter has already voted")]
    AlreadyVoted,
    #[error("A vote for this voter is already in flight")]
    VoteInFlight,
    #[error("Voting is not open")]
    SessionInactive,
    #[error("Candidate is not active")]
    CandidateInactive,
    #[error("Candidate belongs to a different prodi")]
    ProdiMismatch,
    #[error("Stored signing key does not match the voter's wallet address")]
    KeyMismatch,
}

impl AuthorizationError {
    /// Map a ledger revert reason onto the authorization taxonomy. The
    /// reason may still carry the node's prefix, e.g. `execution reverted: `.
    pub fn from_revert_reason(reason: &str) -> Option<Self> {
        [
            (REVERT_ALREADY_VOTED, Self::AlreadyVoted),
            (REVERT_NOT_ACTIVE, Self::SessionInactive),
            (REVERT_PRODI_MISMATCH, Self::ProdiMismatch),
            (REVERT_CANDIDATE_INACTIVE, Self::CandidateInactive),
            (REVERT_NOT_REGISTERED, Self::NotRegistered),
        ]
        .into_iter()
        .find_map(|(known, auth)| reason.contains(known).then_some(auth))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    Ledger(LedgerError),
    /// Only produced by maintenance operations; a deferred mirror write
    /// after a confirmed vote is never reported as a failure.
    #[error("Mirror write failed: {0}")]
    Reconciliation(#[from] MirrorError),
    #[error("Could not decrypt signing key: {0}")]
    Decryption(#[from] CustodyError),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Recognised reverts become authorization failures, so callers see the
/// same error whether the guard or the ledger caught the problem.
impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        if let LedgerError::Reverted(reason) = &err {
            if let Some(auth) = AuthorizationError::from_revert_reason(reason) {
                return Self::Authorization(auth);
            }
        }
        Self::Ledger(err)
    }
}

/// The JSON body of an error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    reason: Option<String>,
    message: String,
}

impl Error {
    fn status(&self) -> Status {
        match self {
            Self::Validation(_) => Status::BadRequest,
            Self::Authorization(AuthorizationError::VoteInFlight) => Status::Conflict,
            Self::Authorization(_) => Status::Forbidden,
            Self::Ledger(LedgerError::Timeout(_)) => Status::GatewayTimeout,
            Self::Ledger(_) => Status::BadGateway,
            Self::Reconciliation(_) | Self::Decryption(_) => Status::InternalServerError,
            Self::NotFound(_) => Status::NotFound,
        }
    }

    fn body(&self) -> ErrorBody {
        let (kind, reason) = match self {
            Self::Validation(_) => ("validation", None),
            Self::Authorization(auth) => (
                "authorization",
                serde_json::to_value(auth)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string)),
            ),
            Self::Ledger(ledger) => (
                "ledger",
                Some(
                    match ledger {
                        LedgerError::Unavailable(_) => "unavailable",
                        LedgerError::SubmissionFailed(_) => "submission_failed",
                        LedgerError::Reverted(_) => "reverted",
                        LedgerError::Timeout(_) => "timeout",
                        LedgerError::BadResponse(_) => "bad_response",
                    }
                    .to_string(),
                ),
            ),
            Self::Reconciliation(_) => ("reconciliation", None),
            Self::Decryption(_) => ("decryption", None),
            Self::NotFound(_) => ("not_found", None),
        };
        // Internal details stay in the log.
        let message = match self {
            Self::Decryption(_) | Self::Reconciliation(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            kind,
            reason,
            message,
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, _: &'r Request<'_>) -> rocket::response::Result<'o> {
        let status = self.status();
        match status.class() {
            StatusClass::ServerError => error!("{self}"),
            _ => warn!("{self}"),
        }
        let body = serde_json::to_string(&self.body()).map_err(|_| Status::InternalServerError)?;
        Response::build()
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
