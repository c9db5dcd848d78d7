use std::sync::Arc;

use rocket::{serde::json::Json, Route, State};

use crate::error::Result;
use crate::model::hash::TxHash;
use crate::reconcile::ResyncReport;
use crate::voting::VotingService;

pub fn routes() -> Vec<Route> {
    routes![resync, pending_writes]
}

/// Rebuild the mirror's counts and flags from the ledger.
#[post("/admin/resync")]
async fn resync(service: &State<Arc<VotingService>>) -> Result<Json<ResyncReport>> {
    let report = service.reconciler().resync().await?;
    Ok(Json(report))
}

/// Votes confirmed on the ledger but not yet reflected in the mirror.
#[get("/admin/pending")]
async fn pending_writes(service: &State<Arc<VotingService>>) -> Json<Vec<TxHash>> {
    let mut pending = service.reconciler().pending();
    pending.sort();
    Json(pending)
}
