//! JSON-RPC implementation of [`ChainApi`] over per-chain endpoint pools.
//!
//! Each request picks a random endpoint from the chain's pool. Transport and
//! malformed-response failures surface as `Error::Transient`; a JSON-RPC error
//! object becomes a `TxError` whose code leads with the revert data so the
//! retry policy table can match on the selector prefix.

use crate::config::Config;
use crate::error::{Error, Result, StoreError, TxError};
use crate::rpc::{ChainApi, FeeEstimate, ReadCall, TxIntent};
use ethers_core::types::{Address, Bytes, H256, U256};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Receipt polling cadence.
const RECEIPT_POLL: Duration = Duration::from_secs(3);

pub struct HttpRpc {
    http: reqwest::Client,
    pools: HashMap<String, Vec<String>>,
    gwei_multiplier: f64,
}

impl HttpRpc {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            pools: config.rpcs.clone(),
            gwei_multiplier: config.gwei_multiplier,
        }
    }

    fn endpoint(&self, chain: &str) -> Result<String> {
        let pool = self.pools.get(chain).ok_or_else(|| {
            Error::Store(StoreError::Config(format!(
                "no RPC endpoints configured for chain '{chain}'"
            )))
        })?;
        pool.choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                Error::Store(StoreError::Config(format!(
                    "empty RPC endpoint pool for chain '{chain}'"
                )))
            })
    }

    async fn request(&self, chain: &str, method: &str, params: Value) -> Result<Value> {
        let endpoint = self.endpoint(chain)?;
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: Value = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|err| Error::Transient(format!("{method} via {endpoint}: {err}")))?
            .json()
            .await
            .map_err(|err| Error::Transient(format!("{method} via {endpoint}: {err}")))?;

        extract_result(response, method)
    }
}

/// Pull `result` out of a JSON-RPC response, mapping error objects to a
/// classifiable transaction error.
fn extract_result(response: Value, method: &str) -> Result<Value> {
    if let Some(error) = response.get("error") {
        return Err(rpc_error(error, method));
    }
    match response.get("result") {
        Some(Value::Null) | None => Err(Error::Transient(format!("{method}: empty result"))),
        Some(result) => Ok(result.clone()),
    }
}

fn rpc_error(error: &Value, method: &str) -> Error {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown rpc error");
    // Revert data leads so policy prefixes like "0xe450d38c" match directly.
    let code = match error.get("data").and_then(Value::as_str) {
        Some(data) if data.starts_with("0x") => format!("{data} {message}"),
        _ => message.to_string(),
    };
    Error::Transaction(TxError {
        label: method.to_string(),
        code,
        encoded_tx: String::new(),
    })
}

fn parse_u256(value: &Value) -> Result<U256> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::Transient(format!("expected hex quantity, got {value}")))?;
    U256::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|err| Error::Transient(format!("bad hex quantity {raw}: {err}")))
}

fn parse_bytes(value: &Value) -> Result<Bytes> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::Transient(format!("expected hex data, got {value}")))?;
    let decoded = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|err| Error::Transient(format!("bad hex data: {err}")))?;
    Ok(decoded.into())
}

fn call_object(from: Option<Address>, to: Address, data: &Bytes, value: U256) -> Value {
    let mut object = json!({
        "to": format!("{to:?}"),
        "data": format!("0x{}", hex::encode(data)),
        "value": format!("0x{value:x}"),
    });
    if let Some(from) = from {
        object["from"] = json!(format!("{from:?}"));
    }
    object
}

impl ChainApi for HttpRpc {
    async fn batch_read(
        &self,
        chain: &str,
        calls: &[ReadCall],
    ) -> Result<HashMap<&'static str, Bytes>> {
        let endpoint = self.endpoint(chain)?;
        let payload: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(id, call)| {
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": "eth_call",
                    "params": [call_object(None, call.to, &call.data, U256::zero()), "latest"],
                })
            })
            .collect();

        let responses: Vec<Value> = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|err| Error::Transient(format!("batch eth_call via {endpoint}: {err}")))?
            .json()
            .await
            .map_err(|err| Error::Transient(format!("batch eth_call via {endpoint}: {err}")))?;

        if responses.len() != calls.len() {
            return Err(Error::Transient(format!(
                "batch eth_call: expected {} responses, got {}",
                calls.len(),
                responses.len()
            )));
        }

        let mut results = HashMap::with_capacity(calls.len());
        for response in responses {
            let id = response
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::Transient("batch eth_call: response without id".into()))?;
            let call = calls
                .get(id as usize)
                .ok_or_else(|| Error::Transient(format!("batch eth_call: unknown id {id}")))?;
            let result = extract_result(response, "eth_call")?;
            results.insert(call.name, parse_bytes(&result)?);
        }
        Ok(results)
    }

    async fn call(&self, chain: &str, to: Address, data: Bytes) -> Result<Bytes> {
        let result = self
            .request(
                chain,
                "eth_call",
                json!([call_object(None, to, &data, U256::zero()), "latest"]),
            )
            .await?;
        parse_bytes(&result)
    }

    async fn chain_id(&self, chain: &str) -> Result<u64> {
        let result = self.request(chain, "eth_chainId", json!([])).await?;
        Ok(parse_u256(&result)?.as_u64())
    }

    async fn nonce(&self, chain: &str, address: Address) -> Result<U256> {
        let result = self
            .request(
                chain,
                "eth_getTransactionCount",
                json!([format!("{address:?}"), "pending"]),
            )
            .await?;
        parse_u256(&result)
    }

    async fn gas_price(&self, chain: &str) -> Result<U256> {
        let result = self.request(chain, "eth_gasPrice", json!([])).await?;
        parse_u256(&result)
    }

    async fn fee_estimate(&self, chain: &str, bump: f64) -> Result<FeeEstimate> {
        let (priority, block, gas_price) = tokio::try_join!(
            self.request(chain, "eth_maxPriorityFeePerGas", json!([])),
            self.request(chain, "eth_getBlockByNumber", json!(["latest", false])),
            self.request(chain, "eth_gasPrice", json!([])),
        )?;

        let priority = parse_u256(&priority)?;
        let gas_price = parse_u256(&gas_price)?;
        let base_fee = parse_u256(
            block
                .get("baseFeePerGas")
                .unwrap_or(&Value::String("0x0".into())),
        )?;
        let gas_used = parse_u256(block.get("gasUsed").unwrap_or(&Value::String("0x0".into())))?;
        let gas_limit = parse_u256(
            block
                .get("gasLimit")
                .unwrap_or(&Value::String("0x1".into())),
        )?;

        let mut base = scale(base_fee.max(gas_price), self.gwei_multiplier + bump);
        // Busy blocks get an extra surcharge so the bid clears quickly.
        if !gas_limit.is_zero() && gas_used * 100u64 / gas_limit > U256::from(50u64) {
            base = scale(base, 1.127);
        }
        let max_fee = base + priority;
        Ok(FeeEstimate {
            max_fee,
            priority_fee: max_fee,
        })
    }

    async fn estimate_gas(&self, chain: &str, from: Address, intent: &TxIntent) -> Result<U256> {
        let result = self
            .request(
                chain,
                "eth_estimateGas",
                json!([call_object(Some(from), intent.to, &intent.data, intent.value)]),
            )
            .await?;
        parse_u256(&result)
    }

    async fn send_raw(&self, chain: &str, raw: Bytes) -> Result<H256> {
        let result = self
            .request(
                chain,
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(&raw))]),
            )
            .await?;
        let raw_hash = result
            .as_str()
            .ok_or_else(|| Error::Transient(format!("bad tx hash: {result}")))?;
        raw_hash
            .parse()
            .map_err(|err| Error::Transient(format!("bad tx hash {raw_hash}: {err}")))
    }

    async fn wait_receipt(&self, chain: &str, hash: H256, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self
                .request(chain, "eth_getTransactionReceipt", json!([format!("{hash:?}")]))
                .await
            {
                Ok(receipt) => {
                    let status = receipt.get("status").and_then(Value::as_str).unwrap_or("0x0");
                    return Ok(status == "0x1");
                }
                Err(Error::Transient(reason)) => {
                    // Pending or the node flaked; keep polling until the
                    // ceiling.
                    tracing::debug!(%hash, %reason, "receipt not available yet");
                }
                Err(other) => return Err(other),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Transient(format!(
                    "no receipt for {hash:?} within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(RECEIPT_POLL).await;
        }
    }

    async fn native_balance(&self, chain: &str, address: Address) -> Result<U256> {
        let result = self
            .request(
                chain,
                "eth_getBalance",
                json!([format!("{address:?}"), "latest"]),
            )
            .await?;
        parse_u256(&result)
    }
}

fn scale(value: U256, factor: f64) -> U256 {
    let scaled = (value.as_u128() as f64 * factor) as u128;
    U256::from(scaled)
}
