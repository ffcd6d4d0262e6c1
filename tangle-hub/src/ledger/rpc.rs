//! JSON-RPC ledger client with endpoint failover.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use tracing::{debug, warn};

use super::{LedgerClient, TransactionHandle, Transfer, TransferOptions};
use crate::error::LedgerClientError;
use crate::types::SecurityLevel;

/// Confirmation threshold (percent) used for balance queries.
const BALANCE_THRESHOLD: u32 = 100;

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Connection settings for [`JsonRpcLedger`].
#[derive(Debug, Clone)]
pub struct RpcLedgerConfig {
    /// Endpoints tried in order; the last one that answered is tried first.
    pub endpoints: Vec<String>,
    /// Tip-selection depth for transfer submission.
    pub depth: u32,
    /// Minimum weight magnitude for proof of work.
    pub min_weight_magnitude: u32,
    pub timeout: Duration,
}

impl Default for RpcLedgerConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:14265".to_string()],
            depth: 3,
            min_weight_magnitude: 15,
            timeout: Duration::from_secs(30),
        }
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AddressResult {
    address: String,
}

#[derive(Debug, Deserialize)]
struct BalancesResult {
    balances: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct StatesResult {
    states: Vec<bool>,
}

#[derive(Debug, Deserialize)]
struct TransferResult {
    hash: String,
}

/// Ledger client speaking JSON-RPC to a node or signing daemon.
///
/// Requests go to the preferred endpoint first; on a transport failure the
/// remaining endpoints are tried in order and the first one that answers
/// becomes preferred. RPC-level errors are returned without failover since
/// another node would give the same answer. Transfer submission only fails
/// over when the connection itself could not be made.
pub struct JsonRpcLedger {
    client: reqwest::Client,
    config: RpcLedgerConfig,
    preferred: AtomicUsize,
}

impl JsonRpcLedger {
    /// Build a client for `config`. Fails when no endpoint is configured.
    pub fn new(config: RpcLedgerConfig) -> Result<Self, LedgerClientError> {
        if config.endpoints.is_empty() {
            return Err(LedgerClientError::Transport(
                "no RPC endpoints configured".into(),
            ));
        }
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config,
            preferred: AtomicUsize::new(0),
        })
    }

    async fn call_endpoint<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: &str,
        params: &Value,
    ) -> Result<T, LedgerClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: REQUEST_ID.fetch_add(1, Ordering::SeqCst),
        };

        let response = self
            .client
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(LedgerClientError::Ambiguous(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let body: JsonRpcResponse<T> = response.json().await.map_err(|e| {
            if e.is_decode() {
                LedgerClientError::MalformedResponse(e.to_string())
            } else {
                LedgerClientError::Ambiguous(e.to_string())
            }
        })?;

        if let Some(error) = body.error {
            return Err(LedgerClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        body.result
            .ok_or_else(|| LedgerClientError::MalformedResponse("missing result".into()))
    }

    /// Read-only call: fails over on any transport failure, including ones
    /// where the request may have reached the node.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerClientError> {
        self.call_with_failover(method, params, |e| {
            matches!(
                e,
                LedgerClientError::Transport(_) | LedgerClientError::Ambiguous(_)
            )
        })
        .await
        .map_err(|e| match e {
            LedgerClientError::Ambiguous(reason) => LedgerClientError::Transport(reason),
            other => other,
        })
    }

    /// Call with side effects on the node. Only requests that never left the
    /// client are retried elsewhere; once a node may have received the
    /// request, any failure is reported as [`LedgerClientError::Ambiguous`].
    async fn submit<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerClientError> {
        self.call_with_failover(method, params, |e| {
            matches!(e, LedgerClientError::Transport(_))
        })
        .await
        .map_err(|e| match e {
            LedgerClientError::MalformedResponse(reason) => LedgerClientError::Ambiguous(reason),
            other => other,
        })
    }

    async fn call_with_failover<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        can_fail_over: impl Fn(&LedgerClientError) -> bool,
    ) -> Result<T, LedgerClientError> {
        let count = self.config.endpoints.len();
        let start = self.preferred.load(Ordering::Relaxed) % count;
        let mut last_error = None;

        for offset in 0..count {
            let slot = (start + offset) % count;
            let endpoint = &self.config.endpoints[slot];

            match self.call_endpoint(endpoint, method, &params).await {
                Ok(result) => {
                    if slot != start {
                        debug!("Switching preferred RPC endpoint to {}", endpoint);
                        self.preferred.store(slot, Ordering::Relaxed);
                    }
                    return Ok(result);
                }
                Err(e) if can_fail_over(&e) => {
                    warn!("RPC endpoint {} failed on {}: {}", endpoint, method, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| LedgerClientError::Transport("all endpoints failed".into())))
    }
}

/// Connection failures mean the request never reached the node. Any later
/// failure leaves the outcome open.
fn classify(err: reqwest::Error) -> LedgerClientError {
    if err.is_connect() || err.is_builder() {
        LedgerClientError::Transport(err.to_string())
    } else {
        LedgerClientError::Ambiguous(err.to_string())
    }
}

/// Balances may arrive as JSON numbers or decimal strings.
fn parse_balance(value: &Value) -> Result<u64, LedgerClientError> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| LedgerClientError::MalformedResponse(format!("invalid balance {}", value)))
}

fn expect_len<T>(items: Vec<T>, expected: usize, what: &str) -> Result<Vec<T>, LedgerClientError> {
    if items.len() != expected {
        return Err(LedgerClientError::MalformedResponse(format!(
            "expected {} {}, got {}",
            expected,
            what,
            items.len()
        )));
    }
    Ok(items)
}

#[async_trait]
impl LedgerClient for JsonRpcLedger {
    async fn derive_address(
        &self,
        seed: &str,
        key_index: u64,
        security: SecurityLevel,
    ) -> Result<String, LedgerClientError> {
        if !self.is_valid_seed(seed) {
            return Err(LedgerClientError::InvalidSeed);
        }
        let result: AddressResult = self
            .call(
                "newAddress",
                json!({ "seed": seed, "index": key_index, "security": security.value() }),
            )
            .await?;
        Ok(result.address)
    }

    async fn get_balances(&self, addresses: &[String]) -> Result<Vec<u64>, LedgerClientError> {
        let result: BalancesResult = self
            .call(
                "getBalances",
                json!({ "addresses": addresses, "threshold": BALANCE_THRESHOLD }),
            )
            .await?;
        let balances = result
            .balances
            .iter()
            .map(parse_balance)
            .collect::<Result<Vec<_>, _>>()?;
        expect_len(balances, addresses.len(), "balances")
    }

    async fn get_inclusion_states(
        &self,
        hashes: &[String],
    ) -> Result<Vec<bool>, LedgerClientError> {
        let result: StatesResult = self
            .call("getInclusionStates", json!({ "transactions": hashes }))
            .await?;
        expect_len(result.states, hashes.len(), "inclusion states")
    }

    async fn send_transfer(
        &self,
        seed: &str,
        transfers: &[Transfer],
        options: &TransferOptions,
    ) -> Result<TransactionHandle, LedgerClientError> {
        if !self.is_valid_seed(seed) {
            return Err(LedgerClientError::InvalidSeed);
        }
        let result: TransferResult = self
            .submit(
                "sendTransfer",
                json!({
                    "seed": seed,
                    "depth": self.config.depth,
                    "minWeightMagnitude": self.config.min_weight_magnitude,
                    "transfers": transfers,
                    "inputs": options.inputs,
                    "remainderAddress": options.remainder_address,
                }),
            )
            .await?;
        Ok(TransactionHandle { hash: result.hash })
    }

    async fn was_spent_from(&self, address: &str) -> Result<bool, LedgerClientError> {
        let result: StatesResult = self
            .call("wereAddressesSpentFrom", json!({ "addresses": [address] }))
            .await?;
        result
            .states
            .first()
            .copied()
            .ok_or_else(|| LedgerClientError::MalformedResponse("empty spent states".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    const TRANSFER_REPLY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"hash":"TAIL"}}"#;
    const STATES_REPLY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"states":[true]}}"#;

    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    /// Local node that counts requests. With `stall` set it holds every
    /// request for that long and never answers.
    async fn node(reply: &'static str, stall: Option<Duration>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    read_request(&mut socket).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    if let Some(stall) = stall {
                        tokio::time::sleep(stall).await;
                        return;
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        reply.len(),
                        reply
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        (url, requests)
    }

    /// URL of a port nobody listens on.
    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    }

    fn ledger(endpoints: Vec<String>) -> JsonRpcLedger {
        JsonRpcLedger::new(RpcLedgerConfig {
            endpoints,
            timeout: Duration::from_millis(300),
            ..Default::default()
        })
        .unwrap()
    }

    async fn send(ledger: &JsonRpcLedger) -> Result<TransactionHandle, LedgerClientError> {
        let options = TransferOptions {
            inputs: vec![],
            remainder_address: None,
        };
        ledger
            .send_transfer("SEED", &[Transfer::new("A".repeat(81), 1)], &options)
            .await
    }

    #[test]
    fn test_parse_balance_accepts_numbers_and_strings() {
        assert_eq!(parse_balance(&json!(42)).unwrap(), 42);
        assert_eq!(parse_balance(&json!("1000")).unwrap(), 1000);
        assert!(parse_balance(&json!(-1)).is_err());
        assert!(parse_balance(&json!(null)).is_err());
    }

    #[test]
    fn test_response_with_error() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}}"#;
        let response: JsonRpcResponse<StatesResult> = serde_json::from_str(raw).unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, -32000);
    }

    #[test]
    fn test_expect_len() {
        assert!(expect_len(vec![true], 1, "states").is_ok());
        assert!(expect_len(vec![true], 2, "states").is_err());
    }

    #[test]
    fn test_requires_endpoint() {
        let config = RpcLedgerConfig {
            endpoints: vec![],
            ..Default::default()
        };
        assert!(JsonRpcLedger::new(config).is_err());
    }

    #[tokio::test]
    async fn test_stalled_transfer_is_not_resubmitted() {
        let (slow, slow_requests) = node(TRANSFER_REPLY, Some(Duration::from_secs(3))).await;
        let (fast, fast_requests) = node(TRANSFER_REPLY, None).await;
        let ledger = ledger(vec![slow, fast]);

        let result = send(&ledger).await;

        assert!(matches!(result, Err(LedgerClientError::Ambiguous(_))));
        assert_eq!(slow_requests.load(Ordering::SeqCst), 1);
        assert_eq!(fast_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refused_transfer_fails_over() {
        let (fast, fast_requests) = node(TRANSFER_REPLY, None).await;
        let ledger = ledger(vec![closed_port().await, fast]);

        let handle = send(&ledger).await.unwrap();

        assert_eq!(handle.hash, "TAIL");
        assert_eq!(fast_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stalled_read_fails_over() {
        let (slow, _) = node(STATES_REPLY, Some(Duration::from_secs(3))).await;
        let (fast, fast_requests) = node(STATES_REPLY, None).await;
        let ledger = ledger(vec![slow, fast]);

        let states = ledger
            .get_inclusion_states(&["TX".to_string()])
            .await
            .unwrap();

        assert_eq!(states, vec![true]);
        assert_eq!(fast_requests.load(Ordering::SeqCst), 1);
    }
}
