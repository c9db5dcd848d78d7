use std::sync::Arc;

use log::{error, info};
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    tokio::time::Duration,
    Build, Rocket,
};
use serde::Deserialize;

use crate::ledger::{LedgerClient, RetryPolicy, RpcLedger};
use crate::model::{address::WalletAddress, mongodb::ensure_indexes_exist};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Deserialize)]
pub struct Config {
    // non-secrets
    resync_interval_secs: u64,
    reconcile_retry_secs: u64,
    max_submit_attempts: u32,
    // secrets
    key_encryption_secret: String,
}

impl Config {
    /// Time between full resyncs of the mirror from the ledger.
    /// Zero disables periodic resync.
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Time between retries of deferred mirror writes.
    pub fn reconcile_retry_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_retry_secs)
    }

    /// How many times one vote may be submitted after ambiguous failures.
    pub fn max_submit_attempts(&self) -> u32 {
        self.max_submit_attempts
    }

    /// Master secret from which the key-blob cipher key is derived.
    pub fn key_encryption_secret(&self) -> &str {
        &self.key_encryption_secret
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
}

/// A fairing that loads the MongoDB config, connects to the database,
/// performs any setup necessary, and places both a `Client` and a `Database`
/// into managed state.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");
        // Construct the connection.
        let client = match MongoClient::with_uri_str(config.db_uri).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        let db = client.database(&get_database_name());

        // Ensure the required indexes exist.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        // Manage the state.
        rocket = rocket.manage(client).manage(db);
        Ok(rocket)
    }
}

/// Get the name of the database to use (production version).
#[cfg(not(test))]
fn get_database_name() -> String {
    "evote".to_string()
}

/// Get the name of the database to use (test version).
/// Use a random name to avoid collisions between tests.
#[cfg(test)]
fn get_database_name() -> String {
    let random: u32 = rand::random();
    let db = format!("test{random}");
    info!("Using database {db}");
    db
}

/// Configuration for the ledger connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub ledger_rpc_url: String,
    pub ledger_contract_address: WalletAddress,
    /// Per-request HTTP timeout.
    pub ledger_request_timeout_ms: u64,
    /// Retries for a failed read, after the first attempt.
    pub ledger_read_retries: u32,
    /// Delay before the first read retry; doubles each time.
    pub ledger_retry_base_ms: u64,
    /// Delay before the first receipt poll; doubles each time.
    pub ledger_confirmation_poll_ms: u64,
    /// Receipt polls before a broadcast vote is reported as timed out.
    pub ledger_confirmation_max_polls: u32,
}

impl LedgerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_request_timeout_ms)
    }

    pub fn confirmation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ledger_confirmation_poll_ms)
    }

    pub fn read_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.ledger_read_retries,
            base_delay: Duration::from_millis(self.ledger_retry_base_ms),
        }
    }
}

/// A local development node with the contract at its first deployment address.
impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ledger_rpc_url: "http://127.0.0.1:8545".to_string(),
            ledger_contract_address: WalletAddress::from([
                0x5f, 0xbd, 0xb2, 0x31, 0x56, 0x78, 0xaf, 0xec, 0xb3, 0x67, 0xf0, 0x32, 0xd9, 0x3f,
                0x64, 0x2f, 0x64, 0x18, 0x0a, 0xa3,
            ]),
            ledger_request_timeout_ms: 10_000,
            ledger_read_retries: 3,
            ledger_retry_base_ms: 200,
            ledger_confirmation_poll_ms: 500,
            ledger_confirmation_max_polls: 30,
        }
    }
}

/// A fairing that loads the ledger config and places both it and a
/// JSON-RPC [`LedgerClient`] into managed state.
pub struct LedgerFairing;

#[rocket::async_trait]
impl Fairing for LedgerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Ledger",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<LedgerConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load ledger config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        // Construct the client.
        let ledger = match RpcLedger::new(&config) {
            Ok(ledger) => ledger,
            Err(e) => {
                error!("Failed to set up ledger client: {e}");
                return Err(rocket);
            }
        };
        info!(
            "Using ledger at {} with contract {}",
            config.ledger_rpc_url, config.ledger_contract_address
        );

        // Manage the state.
        let ledger: Arc<dyn LedgerClient> = Arc::new(ledger);
        rocket = rocket.manage(ledger).manage(config);
        Ok(rocket)
    }
}
