//! On-chain read/write interface.
//!
//! The pipeline only sees [`ChainApi`]; the production implementation is a
//! JSON-RPC client in [`http`]. Keeping the seam here lets the pipeline and
//! scheduler tests run against an in-memory chain.

pub mod http;

pub use http::HttpRpc;

use crate::error::Result;
use ethers_core::abi::{self, ParamType, Token};
use ethers_core::types::{Address, Bytes, H256, U256};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// One read-only view call inside a batch, keyed for the response map.
#[derive(Debug, Clone)]
pub struct ReadCall {
    pub name: &'static str,
    pub to: Address,
    pub data: Bytes,
}

/// An unsigned transaction the wallet still has to price, sign, and submit.
#[derive(Debug, Clone)]
pub struct TxIntent {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Fixed gas limit; `None` asks the node to estimate.
    pub gas: Option<u64>,
}

impl TxIntent {
    pub fn call(to: Address, data: Bytes) -> Self {
        Self {
            to,
            data,
            value: U256::zero(),
            gas: None,
        }
    }
}

/// EIP-1559 fee pair for one submission attempt.
#[derive(Debug, Clone, Copy)]
pub struct FeeEstimate {
    pub max_fee: U256,
    pub priority_fee: U256,
}

/// Per-chain RPC surface the pipeline depends on.
pub trait ChainApi: Send + Sync + 'static {
    /// Aggregate several view calls into one network round trip; the result
    /// maps each call's name to its raw return data.
    fn batch_read(
        &self,
        chain: &str,
        calls: &[ReadCall],
    ) -> impl Future<Output = Result<HashMap<&'static str, Bytes>>> + Send;

    fn call(&self, chain: &str, to: Address, data: Bytes)
        -> impl Future<Output = Result<Bytes>> + Send;

    fn chain_id(&self, chain: &str) -> impl Future<Output = Result<u64>> + Send;

    fn nonce(&self, chain: &str, address: Address) -> impl Future<Output = Result<U256>> + Send;

    fn gas_price(&self, chain: &str) -> impl Future<Output = Result<U256>> + Send;

    /// Fee pair for submission; `bump` raises the bid on retry attempts.
    fn fee_estimate(
        &self,
        chain: &str,
        bump: f64,
    ) -> impl Future<Output = Result<FeeEstimate>> + Send;

    fn estimate_gas(
        &self,
        chain: &str,
        from: Address,
        intent: &TxIntent,
    ) -> impl Future<Output = Result<U256>> + Send;

    fn send_raw(&self, chain: &str, raw: Bytes) -> impl Future<Output = Result<H256>> + Send;

    /// Wait for the receipt. `Ok(true)` = confirmed, `Ok(false)` = reverted;
    /// exceeding `timeout` is a transient RPC error, not a transaction
    /// failure.
    fn wait_receipt(
        &self,
        chain: &str,
        hash: H256,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn native_balance(
        &self,
        chain: &str,
        address: Address,
    ) -> impl Future<Output = Result<U256>> + Send;
}

/// Selector + ABI-encoded arguments for a function call.
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = ethers_core::utils::id(signature).to_vec();
    data.extend(abi::encode(args));
    data.into()
}

pub fn decode_uint(output: &Bytes) -> Result<U256> {
    let tokens = abi::decode(&[ParamType::Uint(256)], output)
        .map_err(|err| crate::Error::Transient(format!("bad uint256 return data: {err}")))?;
    match tokens.into_iter().next() {
        Some(Token::Uint(value)) => Ok(value),
        _ => Err(crate::Error::Transient("bad uint256 return data".into())),
    }
}

pub fn decode_bool(output: &Bytes) -> Result<bool> {
    let tokens = abi::decode(&[ParamType::Bool], output)
        .map_err(|err| crate::Error::Transient(format!("bad bool return data: {err}")))?;
    match tokens.into_iter().next() {
        Some(Token::Bool(value)) => Ok(value),
        _ => Err(crate::Error::Transient("bad bool return data".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_call_prefixes_the_selector() {
        let data = encode_call("claim()", &[]);
        assert_eq!(data.len(), 4);

        let address: Address = "0x1111111111111111111111111111111111111111"
            .parse()
            .expect("address");
        let data = encode_call("hasClaimed(address)", &[Token::Address(address)]);
        assert_eq!(data.len(), 4 + 32);
    }

    #[test]
    fn uint_and_bool_roundtrip() {
        let encoded: Bytes = abi::encode(&[Token::Uint(U256::from(42u64))]).into();
        assert_eq!(decode_uint(&encoded).expect("uint"), U256::from(42u64));

        let encoded: Bytes = abi::encode(&[Token::Bool(true)]).into();
        assert!(decode_bool(&encoded).expect("bool"));
    }
}
