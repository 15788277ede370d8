//! Chain anchor client
//!
//! The core's only view of the distributed ledger: submit a state-changing
//! call, get a transaction reference, and later a confirmation with a block
//! reference. No wire-format encoding happens here; operations are named
//! semantically and the RPC node's signing proxy does the rest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Anchor interaction errors
#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("Submission rejected: {0}")]
    Submit(String),

    /// No confirmation arrived inside the deadline. Treated as failure with
    /// no local effect; the chain may still have committed, which the
    /// reconciliation pass resolves by tx ref.
    #[error("Confirmation timed out: {0}")]
    Timeout(String),

    #[error("Transaction reverted on chain: {0}")]
    Reverted(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl AnchorError {
    /// Whether the chain outcome is unknown after this error. A timeout,
    /// transport or protocol failure during confirmation says nothing about
    /// whether the transaction committed; such intents must stay open for
    /// the reconciliation pass instead of being marked failed.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            AnchorError::Timeout(_) | AnchorError::Transport(_) | AnchorError::Protocol(_)
        )
    }
}

/// Reference to a submitted chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef(pub String);

impl std::fmt::Display for TxRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confirmation of an anchored transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorReceipt {
    pub tx_ref: TxRef,
    pub block_ref: String,
    pub success: bool,
    pub revert_reason: Option<String>,
}

/// Semantic custody operation to anchor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AnchorOp {
    /// Transfer receipt custody to the financier for the pledge leg.
    PledgeTransfer {
        receipt_id: Uuid,
        endorsement_id: Uuid,
        from_address: String,
        to_address: String,
        amount: i64,
    },
    /// Revert receipt custody to the owner for the release leg.
    ReleaseTransfer {
        receipt_id: Uuid,
        endorsement_id: Uuid,
        from_address: String,
        to_address: String,
        amount: i64,
    },
}

/// The chain anchor contract the core consumes.
///
/// Implementations may succeed, fail fast, or fail after unknown delay; the
/// caller treats a timeout as failure and never assumes the chain did not
/// commit.
#[async_trait]
pub trait ChainAnchor: Send + Sync {
    /// Submit a state-changing call, returning its transaction reference.
    async fn submit(&self, op: &AnchorOp) -> Result<TxRef, AnchorError>;

    /// Wait for the confirmation of a previously submitted transaction.
    /// Idempotent: may be called again for the same tx ref, e.g. by the
    /// reconciliation pass.
    async fn await_receipt(&self, tx_ref: &TxRef) -> Result<AnchorReceipt, AnchorError>;
}

#[derive(Debug, Deserialize)]
struct SendTransactionResult {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct GetTransactionResult {
    status: String,
    #[serde(default)]
    ledger: Option<i64>,
    #[serde(rename = "resultError", default)]
    result_error: Option<String>,
}

/// JSON-RPC anchor against a Soroban RPC node.
pub struct SorobanAnchor {
    client: Client,
    rpc_url: String,
    contract_id: String,
    receipt_timeout: Duration,
    poll_interval: Duration,
}

impl SorobanAnchor {
    pub fn new(
        rpc_url: String,
        contract_id: String,
        receipt_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            rpc_url,
            contract_id,
            receipt_timeout,
            poll_interval,
        }
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AnchorError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        if let Some(err) = resp.get("error") {
            return Err(AnchorError::Protocol(format!("RPC error: {:?}", err)));
        }

        resp.get("result")
            .cloned()
            .ok_or_else(|| AnchorError::Protocol("no result in RPC response".to_string()))
    }
}

#[async_trait]
impl ChainAnchor for SorobanAnchor {
    async fn submit(&self, op: &AnchorOp) -> Result<TxRef, AnchorError> {
        tracing::info!(contract = %self.contract_id, ?op, "Submitting anchor operation");

        let result = self
            .rpc_call(
                "sendTransaction",
                json!({
                    "contractId": self.contract_id,
                    "invocation": op,
                }),
            )
            .await?;

        let sent: SendTransactionResult = serde_json::from_value(result)
            .map_err(|e| AnchorError::Submit(format!("malformed submit response: {}", e)))?;

        tracing::info!(tx_ref = %sent.hash, "Anchor submission accepted");
        Ok(TxRef(sent.hash))
    }

    async fn await_receipt(&self, tx_ref: &TxRef) -> Result<AnchorReceipt, AnchorError> {
        let deadline = tokio::time::Instant::now() + self.receipt_timeout;

        loop {
            let result = self
                .rpc_call("getTransaction", json!({ "hash": tx_ref.0 }))
                .await?;

            let tx: GetTransactionResult = serde_json::from_value(result)
                .map_err(|e| AnchorError::Protocol(format!("malformed receipt: {}", e)))?;

            match tx.status.as_str() {
                "SUCCESS" => {
                    let block_ref = tx
                        .ledger
                        .map(|l| l.to_string())
                        .ok_or_else(|| {
                            AnchorError::Protocol("confirmed without ledger ref".to_string())
                        })?;
                    return Ok(AnchorReceipt {
                        tx_ref: tx_ref.clone(),
                        block_ref,
                        success: true,
                        revert_reason: None,
                    });
                }
                "FAILED" => {
                    return Err(AnchorError::Reverted(
                        tx.result_error
                            .unwrap_or_else(|| "transaction failed".to_string()),
                    ));
                }
                // NOT_FOUND / PENDING: keep polling until the deadline.
                _ => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(AnchorError::Timeout(format!(
                            "no confirmation for {} within {:?}",
                            tx_ref, self.receipt_timeout
                        )));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_op_serializes_tagged() {
        let op = AnchorOp::PledgeTransfer {
            receipt_id: Uuid::nil(),
            endorsement_id: Uuid::nil(),
            from_address: "GAOWNER".to_string(),
            to_address: "GAFIN".to_string(),
            amount: 100_000,
        };
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["op"], "pledge_transfer");
        assert_eq!(v["amount"], 100_000);
    }

    #[test]
    fn test_timeout_is_distinct_from_revert() {
        let timeout = AnchorError::Timeout("t".to_string());
        let revert = AnchorError::Reverted("r".to_string());
        assert!(timeout.to_string().contains("timed out"));
        assert!(revert.to_string().contains("reverted"));
    }

    #[test]
    fn test_only_definitive_rejections_are_determinate() {
        assert!(AnchorError::Timeout("t".to_string()).is_indeterminate());
        assert!(AnchorError::Protocol("p".to_string()).is_indeterminate());
        assert!(!AnchorError::Reverted("r".to_string()).is_indeterminate());
        assert!(!AnchorError::Submit("s".to_string()).is_indeterminate());
    }
}
