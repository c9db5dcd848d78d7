//! [`LedgerClient`] over an Ethereum-style JSON-RPC endpoint.
//!
//! Votes are sent with `eth_sendTransaction` from the voter's own account,
//! which the node holds unlocked; the contract checks that the recovered
//! signer of the vote digest matches the sender.

use chrono::{DateTime, TimeZone, Utc};
use data_encoding::HEXLOWER_PERMISSIVE;
use log::{debug, trace, warn};
use rocket::serde::json::{json, Value};
use rocket::tokio::time::{sleep, Duration};

use super::{
    abi::{encode_call, selector, Decoder, Token},
    LedgerCandidate, LedgerClient, LedgerError, LedgerReceipt, PendingVote, SessionWindow,
    VoteSubmission, VoterState, REVERT_ALREADY_VOTED, REVERT_CANDIDATE_INACTIVE, REVERT_NOT_ACTIVE,
    REVERT_NOT_REGISTERED, REVERT_PRODI_MISMATCH,
};
use crate::config::LedgerConfig;
use crate::model::{
    address::WalletAddress,
    candidate::CandidateId,
    hash::{encode_prefixed, TxHash},
};

/// Ways a single JSON-RPC call can fail.
#[derive(Debug)]
enum RpcFailure {
    /// The request may not have reached the node, or the answer was lost.
    Transport(String),
    /// The node answered with a JSON-RPC error object.
    Node(String),
    /// The node answered with something unexpected.
    Decode(String),
}

impl RpcFailure {
    /// Classify a failed read.
    fn into_read_error(self) -> LedgerError {
        match self {
            Self::Transport(e) => LedgerError::Unavailable(e),
            Self::Node(e) => match revert_reason(&e) {
                Some(reason) => LedgerError::Reverted(reason),
                None => LedgerError::BadResponse(e),
            },
            Self::Decode(e) => LedgerError::BadResponse(e),
        }
    }

    /// Classify a failed submission. Anything short of an explicit revert is
    /// ambiguous: the transaction may have been broadcast.
    fn into_submit_error(self) -> LedgerError {
        match self {
            Self::Node(e) => match revert_reason(&e) {
                Some(reason) => LedgerError::Reverted(reason),
                None => LedgerError::SubmissionFailed(e),
            },
            Self::Transport(e) | Self::Decode(e) => LedgerError::SubmissionFailed(e),
        }
    }
}

/// Extract a revert reason from a node error message, normalising the
/// contract's known reasons.
fn revert_reason(message: &str) -> Option<String> {
    for known in [
        REVERT_ALREADY_VOTED,
        REVERT_NOT_ACTIVE,
        REVERT_PRODI_MISMATCH,
        REVERT_CANDIDATE_INACTIVE,
        REVERT_NOT_REGISTERED,
    ] {
        if message.contains(known) {
            return Some(known.to_string());
        }
    }
    message.contains("revert").then(|| message.to_string())
}

/// Parse a `0x`-prefixed hex quantity.
fn parse_quantity(value: &Value) -> Result<u64, RpcFailure> {
    let text = value
        .as_str()
        .ok_or_else(|| RpcFailure::Decode(format!("expected a hex quantity, got {value}")))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|_| RpcFailure::Decode(format!("invalid hex quantity {text:?}")))
}

/// Parse `0x`-prefixed hex data of any length.
fn parse_data(value: &Value) -> Result<Vec<u8>, RpcFailure> {
    let text = value
        .as_str()
        .ok_or_else(|| RpcFailure::Decode(format!("expected hex data, got {value}")))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    HEXLOWER_PERMISSIVE
        .decode(digits.as_bytes())
        .map_err(|e| RpcFailure::Decode(format!("invalid hex data: {e}")))
}

fn timestamp(seconds: u64) -> Result<DateTime<Utc>, LedgerError> {
    i64::try_from(seconds)
        .ok()
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
        .ok_or_else(|| LedgerError::BadResponse(format!("timestamp {seconds} out of range")))
}

/// Receipt polling backs off exponentially up to this interval.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How many recent blocks to scan when looking for a lost submission.
const SEARCH_DEPTH: u64 = 256;

/// Calldata for `vote(uint256,bytes32,bytes)`.
fn vote_calldata(submission: &VoteSubmission) -> Vec<u8> {
    encode_call(
        selector("vote(uint256,bytes32,bytes)"),
        &[
            Token::Uint(submission.candidate_id.into()),
            Token::FixedBytes(*submission.message_hash.as_bytes()),
            Token::Bytes(submission.signature.as_bytes().to_vec()),
        ],
    )
}

fn same_address(value: &Value, address: &WalletAddress) -> bool {
    value
        .as_str()
        .map_or(false, |s| s.eq_ignore_ascii_case(&address.to_string()))
}

/// Find the transaction in a full block (as returned by
/// `eth_getBlockByNumber(_, true)`) sent `from` to `to` with calldata `data`.
fn matching_transaction(
    block: &Value,
    from: &WalletAddress,
    to: &WalletAddress,
    data: &[u8],
) -> Result<Option<TxHash>, RpcFailure> {
    let Some(transactions) = block.get("transactions").and_then(Value::as_array) else {
        return Ok(None);
    };
    for tx in transactions {
        let sender = tx.get("from").unwrap_or(&Value::Null);
        let recipient = tx.get("to").unwrap_or(&Value::Null);
        if !(same_address(sender, from) && same_address(recipient, to)) {
            continue;
        }
        let input = tx.get("input").unwrap_or(&Value::Null);
        if parse_data(input)? != data {
            continue;
        }
        let hash = tx.get("hash").unwrap_or(&Value::Null);
        return hash
            .as_str()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| RpcFailure::Decode(format!("transaction without a valid hash: {hash}")));
    }
    Ok(None)
}

/// JSON-RPC client for the voting contract.
pub struct RpcLedger {
    client: reqwest::Client,
    rpc_url: String,
    contract: WalletAddress,
    poll_interval: Duration,
    max_polls: u32,
}

impl RpcLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| LedgerError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            rpc_url: config.ledger_rpc_url.clone(),
            contract: config.ledger_contract_address,
            poll_interval: config.confirmation_poll_interval(),
            max_polls: config.ledger_confirmation_max_polls,
        })
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });
        trace!("JSON-RPC {method}");

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcFailure::Transport(format!("{method}: request timed out"))
                } else {
                    RpcFailure::Transport(format!("{method}: {e}"))
                }
            })?;

        if !resp.status().is_success() {
            return Err(RpcFailure::Transport(format!(
                "{method}: HTTP {}",
                resp.status()
            )));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("{method}: invalid JSON response: {e}")))?;

        if let Some(error) = json.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(RpcFailure::Node(format!("{method}: {message}")));
        }

        json.get("result")
            .cloned()
            .ok_or_else(|| RpcFailure::Decode(format!("{method}: response has no result")))
    }

    /// Look through one block for the vote transaction. Unknown blocks read
    /// as `null` and match nothing.
    async fn search_block(
        &self,
        block: Value,
        submission: &VoteSubmission,
        data: &[u8],
    ) -> Result<Option<TxHash>, LedgerError> {
        let block = self
            .rpc_call("eth_getBlockByNumber", json!([block, true]))
            .await
            .map_err(RpcFailure::into_read_error)?;
        matching_transaction(&block, &submission.voter, &self.contract, data)
            .map_err(RpcFailure::into_read_error)
    }

    /// Run a read-only contract call, returning the raw return data.
    async fn call(&self, data: Vec<u8>) -> Result<Vec<u8>, LedgerError> {
        let params = json!([
            {"to": self.contract.to_string(), "data": encode_prefixed(&data)},
            "latest"
        ]);
        let result = self
            .rpc_call("eth_call", params)
            .await
            .map_err(RpcFailure::into_read_error)?;
        parse_data(&result).map_err(RpcFailure::into_read_error)
    }
}

#[rocket::async_trait]
impl LedgerClient for RpcLedger {
    /// `getVoterInfo(address)` returns
    /// `(string, string, string, string prodi, bool isRegistered, bool hasVoted, uint256, uint256)`.
    async fn voter_state(&self, voter: &WalletAddress) -> Result<VoterState, LedgerError> {
        let data = encode_call(selector("getVoterInfo(address)"), &[Token::Address(*voter)]);
        let ret = self.call(data).await?;
        let decoder = Decoder::new(&ret);
        Ok(VoterState {
            registered: decoder.boolean(4).map_err(LedgerError::BadResponse)?,
            has_voted: decoder.boolean(5).map_err(LedgerError::BadResponse)?,
        })
    }

    /// `getCandidate(uint256)` returns
    /// `(uint256 id, string name, string, string, string prodi, uint256 voteCount, bool isActive)`.
    async fn candidate(&self, id: CandidateId) -> Result<LedgerCandidate, LedgerError> {
        let data = encode_call(selector("getCandidate(uint256)"), &[Token::Uint(id.into())]);
        let ret = self.call(data).await?;
        let decoder = Decoder::new(&ret);
        let decoded = (|| {
            Ok::<_, String>((
                decoder.uint(0)?,
                decoder.string(1)?,
                decoder.string(4)?,
                decoder.uint(5)?,
                decoder.boolean(6)?,
            ))
        })();
        let (stored_id, name, prodi, vote_count, active) =
            decoded.map_err(LedgerError::BadResponse)?;
        // Unknown ids read back as an all-zero record.
        Ok(LedgerCandidate {
            id: if stored_id == 0 { 0 } else { id },
            name,
            prodi,
            active: active && stored_id != 0,
            vote_count,
        })
    }

    async fn candidate_count(&self) -> Result<u32, LedgerError> {
        let ret = self.call(encode_call(selector("candidateCount()"), &[])).await?;
        let count = Decoder::new(&ret).uint(0).map_err(LedgerError::BadResponse)?;
        u32::try_from(count)
            .map_err(|_| LedgerError::BadResponse(format!("candidate count {count} out of range")))
    }

    /// `getVotingStatus()` returns `(bool isActive, uint256 startTime, uint256 endTime)`.
    async fn session_window(&self) -> Result<SessionWindow, LedgerError> {
        let ret = self.call(encode_call(selector("getVotingStatus()"), &[])).await?;
        let decoder = Decoder::new(&ret);
        let active = decoder.boolean(0).map_err(LedgerError::BadResponse)?;
        let start = decoder.uint(1).map_err(LedgerError::BadResponse)?;
        let end = decoder.uint(2).map_err(LedgerError::BadResponse)?;
        Ok(SessionWindow {
            start: timestamp(start)?,
            end: timestamp(end)?,
            active,
        })
    }

    async fn submit_vote(&self, submission: &VoteSubmission) -> Result<PendingVote, LedgerError> {
        let data = vote_calldata(submission);
        let params = json!([{
            "from": submission.voter.to_string(),
            "to": self.contract.to_string(),
            "data": encode_prefixed(&data),
        }]);
        let result = self
            .rpc_call("eth_sendTransaction", params)
            .await
            .map_err(RpcFailure::into_submit_error)?;
        let tx_hash: TxHash = result
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                LedgerError::SubmissionFailed(format!("node returned no transaction hash: {result}"))
            })?;
        debug!("Broadcast vote transaction {tx_hash}");
        Ok(PendingVote { tx_hash })
    }

    /// Scans the pending block, then the most recent [`SEARCH_DEPTH`] blocks.
    async fn find_submission(
        &self,
        submission: &VoteSubmission,
    ) -> Result<Option<PendingVote>, LedgerError> {
        let data = vote_calldata(submission);
        if let Some(tx_hash) = self.search_block(json!("pending"), submission, &data).await? {
            debug!("Found vote transaction {tx_hash} in the pending block");
            return Ok(Some(PendingVote { tx_hash }));
        }
        let latest = self
            .rpc_call("eth_blockNumber", json!([]))
            .await
            .and_then(|n| parse_quantity(&n))
            .map_err(RpcFailure::into_read_error)?;
        let oldest = latest.saturating_sub(SEARCH_DEPTH - 1);
        for number in (oldest..=latest).rev() {
            let tag = json!(format!("0x{number:x}"));
            if let Some(tx_hash) = self.search_block(tag, submission, &data).await? {
                debug!("Found vote transaction {tx_hash} in block {number}");
                return Ok(Some(PendingVote { tx_hash }));
            }
        }
        Ok(None)
    }

    async fn confirm(&self, pending: &PendingVote) -> Result<LedgerReceipt, LedgerError> {
        let tx_hash = pending.tx_hash;
        let mut interval = self.poll_interval;
        for poll in 0..self.max_polls {
            match self
                .rpc_call("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
                .await
            {
                Ok(Value::Null) => trace!("Transaction {tx_hash} not yet included (poll {poll})"),
                Ok(receipt) => {
                    let status = receipt.get("status").unwrap_or(&Value::Null);
                    if parse_quantity(status).map_err(RpcFailure::into_read_error)? == 0 {
                        return Err(LedgerError::Reverted(format!(
                            "transaction {tx_hash} reverted"
                        )));
                    }
                    let block = receipt.get("blockNumber").unwrap_or(&Value::Null);
                    let block_number = parse_quantity(block).map_err(RpcFailure::into_read_error)?;
                    return Ok(LedgerReceipt {
                        tx_hash,
                        block_number,
                    });
                }
                Err(RpcFailure::Transport(e)) => {
                    warn!("Polling for receipt of {tx_hash} failed, will poll again: {e}")
                }
                Err(other) => return Err(other.into_read_error()),
            }
            sleep(interval).await;
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
        Err(LedgerError::Timeout(tx_hash))
    }
}
