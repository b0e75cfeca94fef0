//! DEX-aggregator quoting and assembly.
//!
//! The pipeline talks to [`SwapApi`]; the production implementation is the
//! Odos HTTP API. Quotes and assembled call data come back ready for the
//! wallet to price and sign, so the aggregator never sees a key.

use crate::error::{Error, Result};
use ethers_core::types::{Address, Bytes, U256};
use serde_json::{json, Value};
use std::future::Future;
use std::str::FromStr;

const ODOS_API: &str = "https://api.odos.xyz";
const ODOS_APP: &str = "https://app.odos.xyz";

/// Aggregator's placeholder address for the native coin.
pub const NATIVE_TOKEN: Address = Address::zero();

/// A priced route. `path_id` is redeemed once via [`SwapApi::assemble`].
#[derive(Debug, Clone)]
pub struct Quote {
    pub path_id: String,
    /// Expected output in whole native units.
    pub amount_out: f64,
}

/// Call data for a quoted route, simulated by the aggregator before return.
#[derive(Debug, Clone)]
pub struct AssembledTx {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas: Option<u64>,
}

pub trait SwapApi: Send + Sync {
    fn router_address(&self, chain_id: u64) -> impl Future<Output = Result<Address>> + Send;

    fn quote(
        &self,
        chain_id: u64,
        token_in: Address,
        token_out: Address,
        value: U256,
        slippage: f64,
    ) -> impl Future<Output = Result<Quote>> + Send;

    fn assemble(&self, path_id: &str) -> impl Future<Output = Result<AssembledTx>> + Send;
}

/// Odos client bound to one account: requests carry the account's address and
/// go out through its proxy when it has one.
pub struct OdosClient {
    http: reqwest::Client,
    address: Address,
}

impl OdosClient {
    pub fn new(address: Address, proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|err| Error::Soft(format!("bad proxy {proxy}: {err}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
            )
            .build()
            .map_err(|err| Error::Soft(format!("http client: {err}")))?;
        Ok(Self { http, address })
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.http
            .get(format!("{ODOS_API}{path}"))
            .header("Origin", ODOS_APP)
            .header("Referer", format!("{ODOS_APP}/"))
            .send()
            .await
            .map_err(|err| Error::Transient(format!("odos GET {path}: {err}")))?
            .json()
            .await
            .map_err(|err| Error::Transient(format!("odos GET {path}: {err}")))
    }

    async fn post(&self, path: &str, payload: Value) -> Result<Value> {
        self.http
            .post(format!("{ODOS_API}{path}"))
            .header("Origin", ODOS_APP)
            .header("Referer", format!("{ODOS_APP}/"))
            .json(&payload)
            .send()
            .await
            .map_err(|err| Error::Transient(format!("odos POST {path}: {err}")))?
            .json()
            .await
            .map_err(|err| Error::Transient(format!("odos POST {path}: {err}")))
    }
}

impl SwapApi for OdosClient {
    async fn router_address(&self, chain_id: u64) -> Result<Address> {
        let info = self.get(&format!("/info/contract-info/v3/{chain_id}")).await?;
        let router = info
            .get("routerAddress")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Transient(format!("odos contract info missing router: {info}")))?;
        Address::from_str(router)
            .map_err(|err| Error::Transient(format!("bad router address {router}: {err}")))
    }

    async fn quote(
        &self,
        chain_id: u64,
        token_in: Address,
        token_out: Address,
        value: U256,
        slippage: f64,
    ) -> Result<Quote> {
        let payload = json!({
            "chainId": chain_id,
            "compact": true,
            "inputTokens": [{
                "amount": value.to_string(),
                "tokenAddress": format!("{token_in:?}"),
            }],
            "outputTokens": [{
                "proportion": 1,
                "tokenAddress": format!("{token_out:?}"),
            }],
            "slippageLimitPercent": slippage,
            "userAddr": format!("{:?}", self.address),
        });
        let response = self.post("/sor/quote/v3", payload).await?;

        let path_id = response
            .get("pathId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Transient(format!("odos quote failed: {response}")))?
            .to_string();
        let amount_out = response
            .get("outAmounts")
            .and_then(|amounts| amounts.get(0))
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<f64>().ok())
            .map(|raw| raw / 1e18)
            .ok_or_else(|| Error::Transient(format!("odos quote without output: {response}")))?;
        Ok(Quote { path_id, amount_out })
    }

    async fn assemble(&self, path_id: &str) -> Result<AssembledTx> {
        let payload = json!({
            "userAddr": format!("{:?}", self.address),
            "pathId": path_id,
            "simulate": true,
        });
        let response = self.post("/sor/assemble", payload).await?;

        if let Some(simulation) = response.get("simulation") {
            let ok = simulation
                .get("isSuccess")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !ok {
                return Err(Error::Transient(format!(
                    "odos simulation failed: {simulation}"
                )));
            }
        }

        let tx = response
            .get("transaction")
            .ok_or_else(|| Error::Transient(format!("odos assemble without tx: {response}")))?;
        let to = tx
            .get("to")
            .and_then(Value::as_str)
            .and_then(|raw| Address::from_str(raw).ok())
            .ok_or_else(|| Error::Transient(format!("odos assemble bad `to`: {tx}")))?;
        let data = tx
            .get("data")
            .and_then(Value::as_str)
            .and_then(|raw| hex::decode(raw.trim_start_matches("0x")).ok())
            .ok_or_else(|| Error::Transient(format!("odos assemble bad `data`: {tx}")))?;
        let value = match tx.get("value") {
            Some(Value::String(raw)) => U256::from_dec_str(raw)
                .or_else(|_| U256::from_str_radix(raw.trim_start_matches("0x"), 16))
                .map_err(|err| Error::Transient(format!("odos assemble bad `value` {raw}: {err}")))?,
            Some(Value::Number(raw)) => U256::from(raw.as_u64().unwrap_or(0)),
            _ => U256::zero(),
        };
        let gas = tx.get("gas").and_then(Value::as_u64);

        Ok(AssembledTx {
            to,
            data: data.into(),
            value,
            gas,
        })
    }
}
