use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Maximum retry attempts for transient errors.
const MAX_RETRIES: u32 = 3;

/// Base backoff delay for retries (doubles each attempt).
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Lamports per SOL.
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WithContext<T> {
    value: T,
}

/// Status of a submitted transaction as reported by `getSignatureStatuses`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    pub confirmations: Option<u64>,
    /// Set when the transaction executed and failed.
    pub err: Option<Value>,
    pub confirmation_status: Option<String>,
}

impl SignatureStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self.confirmation_status.as_deref(),
            Some("confirmed") | Some("finalized")
        )
    }
}

/// Minimal JSON-RPC client for the ledger used to gate feed access on payment.
pub struct LedgerClient {
    http: reqwest::Client,
    rpc_url: String,
    next_id: AtomicU64,
}

/// Check if an error message indicates a transient/retryable failure.
fn is_transient_error(err_str: &str) -> bool {
    let lower = err_str.to_lowercase();
    lower.contains("429")
        || lower.contains("too many requests")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
        || lower.contains("service unavailable")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
}

impl LedgerClient {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            rpc_url: rpc_url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call_once<T: DeserializeOwned>(&self, method: &str, params: &Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{method}: request failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("{method}: HTTP {status}");
        }

        let decoded: RpcResponse<T> = response
            .json()
            .await
            .with_context(|| format!("{method}: malformed response"))?;
        if let Some(err) = decoded.error {
            bail!("{method}: RPC error {}: {}", err.code, err.message);
        }
        decoded
            .result
            .ok_or_else(|| anyhow!("{method}: response has no result"))
    }

    /// Issue a JSON-RPC call with exponential backoff retry for transient errors.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..MAX_RETRIES {
            match self.call_once(method, &params).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let err_str = format!("{e:#}");
                    if is_transient_error(&err_str) && attempt + 1 < MAX_RETRIES {
                        let delay = BASE_BACKOFF * 2u32.pow(attempt);
                        warn!(
                            "Transient RPC error (attempt {}/{}): {err_str}, retrying in {:?}",
                            attempt + 1,
                            MAX_RETRIES,
                            delay,
                        );
                        tokio::time::sleep(delay).await;
                        last_err = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("retry exhausted")))
    }

    /// Balance of `address` in lamports.
    pub async fn get_balance(&self, address: &str) -> Result<u64> {
        let balance: WithContext<u64> = self.call("getBalance", json!([address])).await?;
        debug!("Balance of {address}: {} lamports", balance.value);
        Ok(balance.value)
    }

    /// Submit an already-signed, base64-encoded transaction. Returns its signature.
    pub async fn send_transaction(&self, encoded: &str) -> Result<String> {
        let signature: String = self
            .call(
                "sendTransaction",
                json!([encoded, { "encoding": "base64" }]),
            )
            .await?;
        info!("Submitted transaction {signature}");
        Ok(signature)
    }

    /// Current status of a signature, or `None` if the ledger has not seen it yet.
    pub async fn signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>> {
        let statuses: WithContext<Vec<Option<SignatureStatus>>> = self
            .call(
                "getSignatureStatuses",
                json!([[signature], { "searchTransactionHistory": true }]),
            )
            .await?;
        Ok(statuses.value.into_iter().next().flatten())
    }

    /// Poll until `signature` is confirmed or finalized.
    ///
    /// Fails if the transaction executed with an error or `timeout` elapses first.
    pub async fn wait_for_confirmation(
        &self,
        signature: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<SignatureStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.signature_status(signature).await? {
                Some(status) if status.err.is_some() => {
                    bail!("transaction {signature} failed: {}", status.err.unwrap_or_default());
                }
                Some(status) if status.is_confirmed() => {
                    info!(
                        "Transaction {signature} {} at slot {}",
                        status.confirmation_status.as_deref().unwrap_or("confirmed"),
                        status.slot
                    );
                    return Ok(status);
                }
                Some(status) => debug!(
                    "Transaction {signature} pending ({})",
                    status.confirmation_status.as_deref().unwrap_or("processed")
                ),
                None => debug!("Transaction {signature} not yet visible"),
            }

            if Instant::now() + poll > deadline {
                bail!("timed out after {timeout:?} waiting for {signature} to confirm");
            }
            tokio::time::sleep(poll).await;
        }
    }
}
