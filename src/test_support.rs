//! Shared fixtures for unit tests.

use std::sync::Arc;

use rocket::tokio::time::Duration;

use crate::custody::{KeyBlob, KeyCustodian};
use crate::ledger::{scripted::ScriptedLedger, RetryPolicy};
use crate::mirror::memory::MemoryMirror;
use crate::model::{
    candidate::{CandidateId, CandidateRecord},
    mongodb::Id,
    voter::{Voter, VoterCore},
};
use crate::voting::{ServiceSettings, VotingService};

/// The first two development accounts of a local Hardhat node.
pub const VOTER_A_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const VOTER_A_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
pub const VOTER_B_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
pub const VOTER_B_ADDRESS: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

/// A verified voter who has not voted, with a placeholder key blob.
pub fn voter(address: &str, prodi: &str) -> Voter {
    Voter {
        id: Id::new(),
        voter: VoterCore {
            email: format!("{}@example.com", &address[2..8].to_ascii_lowercase()),
            wallet_address: address.parse().unwrap(),
            encrypted_key: KeyBlob::from("00:00".to_string()),
            verified: true,
            prodi: prodi.to_string(),
            has_voted: false,
        },
    }
}

pub fn candidate(id: CandidateId, name: &str, prodi: &str) -> CandidateRecord {
    CandidateRecord {
        candidate_id: id,
        name: name.to_string(),
        prodi: prodi.to_string(),
        active: true,
        vote_count: 0,
    }
}

/// Cheap KDF cost so tests stay fast.
pub fn custodian() -> KeyCustodian {
    KeyCustodian::with_cost("test-master-secret", 4).unwrap()
}

pub fn fast_settings() -> ServiceSettings {
    ServiceSettings {
        reads: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        },
        max_submit_attempts: 2,
        retry_interval: Duration::from_millis(100),
    }
}

/// A voting service over a scripted ledger and an in-memory mirror, with
/// voters A and B (both in "CS") and the standard candidates mirrored.
pub struct Fixture {
    pub ledger: Arc<ScriptedLedger>,
    pub mirror: Arc<MemoryMirror>,
    pub service: Arc<VotingService>,
    pub voter_a: Voter,
    pub voter_b: Voter,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: ServiceSettings) -> Self {
        let custodian = custodian();
        let ledger = ScriptedLedger::standard();
        let mirror = Arc::new(MemoryMirror::default());

        let mut voter_a = voter(VOTER_A_ADDRESS, "CS");
        voter_a.encrypted_key = custodian.encrypt(VOTER_A_KEY).unwrap();
        let mut voter_b = voter(VOTER_B_ADDRESS, "CS");
        voter_b.encrypted_key = custodian.encrypt(VOTER_B_KEY).unwrap();
        mirror.insert_voter(voter_a.clone());
        mirror.insert_voter(voter_b.clone());

        mirror.insert_candidate(candidate(7, "Alice", "CS"));
        mirror.insert_candidate(candidate(8, "Budi", "EE"));
        mirror.insert_candidate(candidate(9, "Citra", "CS"));

        let service = Arc::new(VotingService::new(
            custodian,
            ledger.clone(),
            mirror.clone(),
            settings,
        ));

        Self {
            ledger,
            mirror,
            service,
            voter_a,
            voter_b,
        }
    }
}
