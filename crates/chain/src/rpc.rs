use std::sync::atomic::{AtomicU64, Ordering};

use ethereum_types::{Address, H256};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::trace;

use crate::ChainError;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum RpcResponse {
    Success { result: Value },
    Error { error: RpcErrorBody },
}

#[derive(Deserialize, Debug)]
struct RpcErrorBody {
    message: String,
}

/// Minimal fields read off `eth_getTransactionReceipt`.
#[derive(Deserialize, Debug, Clone)]
pub struct TxReceipt {
    status: Option<String>,
}

impl TxReceipt {
    pub fn succeeded(&self) -> bool {
        matches!(self.status.as_deref(), Some("0x1") | None)
    }
}

/// Thin JSON-RPC client for the handful of eth_ methods the registry flow
/// needs. Transport failures surface as [`ChainError::Transient`]; RPC error
/// objects are classified by [`RpcClient::classify_rpc_error`].
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    pub url: Url,
}

impl RpcClient {
    pub fn new(url: &str) -> Result<Self, ChainError> {
        let url = Url::parse(url)
            .map_err(|_| ChainError::InvalidConfig(format!("unparseable rpc url {url:?}")))?;
        Ok(Self {
            client: Client::new(),
            url,
        })
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Vec<Value>>,
    ) -> Result<Value, ChainError> {
        let id = REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_default(),
        });
        trace!(endpoint = %self.url, method, id, "sending rpc request");

        let response = self
            .client
            .post(self.url.as_str())
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if response.status().is_server_error() {
            return Err(ChainError::Transient(format!(
                "rpc endpoint answered {}",
                response.status()
            )));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|err| ChainError::Transient(format!("undecodable rpc body: {err}")))?;

        match parsed {
            RpcResponse::Success { result } => Ok(result),
            RpcResponse::Error { error } => Err(Self::classify_rpc_error(error.message)),
        }
    }

    /// Revert-shaped error messages become [`ChainError::Revert`], anything
    /// else stays a generic RPC error.
    fn classify_rpc_error(message: String) -> ChainError {
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("revert") || lowered.contains("already registered") {
            ChainError::Revert(message)
        } else {
            ChainError::Rpc(message)
        }
    }

    pub async fn call(&self, to: Address, calldata: &[u8]) -> Result<String, ChainError> {
        let params = vec![
            json!({
                "to": format!("{to:#x}"),
                "input": format!("0x{}", hex::encode(calldata)),
            }),
            json!("latest"),
        ];
        let result = self.send_request("eth_call", Some(params)).await?;
        decode_string(result)
    }

    pub async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        calldata: &[u8],
    ) -> Result<u64, ChainError> {
        let params = vec![
            json!({
                "from": format!("{from:#x}"),
                "to": format!("{to:#x}"),
                "input": format!("0x{}", hex::encode(calldata)),
            }),
            json!("latest"),
        ];
        let result = self.send_request("eth_estimateGas", Some(params)).await?;
        decode_quantity(result)
    }

    pub async fn get_nonce(&self, address: Address) -> Result<u64, ChainError> {
        let params = vec![json!(format!("{address:#x}")), json!("latest")];
        let result = self
            .send_request("eth_getTransactionCount", Some(params))
            .await?;
        decode_quantity(result)
    }

    pub async fn get_chain_id(&self) -> Result<u64, ChainError> {
        let result = self.send_request("eth_chainId", None).await?;
        decode_quantity(result)
    }

    pub async fn get_gas_price(&self) -> Result<u64, ChainError> {
        let result = self.send_request("eth_gasPrice", None).await?;
        decode_quantity(result)
    }

    pub async fn get_max_priority_fee(&self) -> Result<u64, ChainError> {
        match self.send_request("eth_maxPriorityFeePerGas", None).await {
            Ok(result) => decode_quantity(result),
            // Not every endpoint implements the fee-history surface.
            Err(ChainError::Rpc(_)) => Ok(1_000_000_000),
            Err(err) => Err(err),
        }
    }

    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<H256, ChainError> {
        let params = vec![json!(format!("0x{}", hex::encode(raw)))];
        let result = self
            .send_request("eth_sendRawTransaction", Some(params))
            .await?;
        let text = decode_string(result)?;
        parse_h256(&text)
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TxReceipt>, ChainError> {
        let params = vec![json!(format!("{tx_hash:#x}"))];
        let result = self
            .send_request("eth_getTransactionReceipt", Some(params))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|err| ChainError::InvalidResponse(err.to_string()))
    }
}

fn decode_string(value: Value) -> Result<String, ChainError> {
    serde_json::from_value(value).map_err(|err| ChainError::InvalidResponse(err.to_string()))
}

/// Parses a `0x`-prefixed hex quantity.
fn decode_quantity(value: Value) -> Result<u64, ChainError> {
    let text = decode_string(value)?;
    let stripped = text
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::InvalidResponse(format!("quantity without 0x: {text:?}")))?;
    u64::from_str_radix(stripped, 16)
        .map_err(|err| ChainError::InvalidResponse(format!("bad quantity {text:?}: {err}")))
}

fn parse_h256(text: &str) -> Result<H256, ChainError> {
    let stripped = text.strip_prefix("0x").unwrap_or(text);
    let bytes = hex::decode(stripped)
        .map_err(|_| ChainError::InvalidResponse(format!("bad hash {text:?}")))?;
    if bytes.len() != 32 {
        return Err(ChainError::InvalidResponse(format!(
            "hash has {} bytes",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_decoding() {
        assert_eq!(decode_quantity(json!("0x0")).unwrap(), 0);
        assert_eq!(decode_quantity(json!("0x1b4")).unwrap(), 436);
        assert!(decode_quantity(json!("1b4")).is_err());
        assert!(decode_quantity(json!(12)).is_err());
    }

    #[test]
    fn hash_parsing() {
        let h = parse_h256(&format!("0x{}", "22".repeat(32))).unwrap();
        assert_eq!(h, H256::repeat_byte(0x22));
        assert!(parse_h256("0x1234").is_err());
    }

    #[test]
    fn rpc_error_classification() {
        assert!(matches!(
            RpcClient::classify_rpc_error("execution reverted: no".to_string()),
            ChainError::Revert(_)
        ));
        assert!(matches!(
            RpcClient::classify_rpc_error("method not found".to_string()),
            ChainError::Rpc(_)
        ));
    }

    #[test]
    fn receipt_status_interpretation() {
        assert!(TxReceipt { status: Some("0x1".into()) }.succeeded());
        assert!(!TxReceipt { status: Some("0x0".into()) }.succeeded());
        // pre-Byzantium receipts carry no status; treat as success
        assert!(TxReceipt { status: None }.succeeded());
    }

    #[test]
    fn invalid_url_is_config_error() {
        assert!(matches!(
            RpcClient::new("not a url"),
            Err(ChainError::InvalidConfig(_))
        ));
    }
}
