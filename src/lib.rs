#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

use crate::config::{ConfigFairing, DatabaseFairing, LedgerFairing};
use crate::logging::LoggerFairing;
use crate::voting::VotingServiceFairing;

pub mod api;
pub mod audit;
pub mod config;
pub mod custody;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod logging;
pub mod mirror;
pub mod model;
pub mod reconcile;
pub mod scheduled_task;
pub mod signature;
pub mod voting;

#[cfg(test)]
mod test_support;

/// Assemble the server. Configuration, the database and ledger connections
/// and the voting service are set up by fairings at ignition.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(DatabaseFairing)
        .attach(LedgerFairing)
        .attach(VotingServiceFairing)
        .mount("/", api::routes())
}
