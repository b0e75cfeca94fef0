//! Per-account signing and transaction submission on top of [`ChainApi`].
//!
//! Every confirmed or reverted transaction is appended to the account's
//! report here, so callers only deal with success or a classifiable error.
//! Balance and gas-price waits retry indefinitely — the bounded retry policy
//! lives one layer up, around whole pipeline attempts.

use crate::config::Config;
use crate::db::{Outcome, ReportStore};
use crate::error::{Error, Result, StoreError, TxError};
use crate::rpc::{encode_call, decode_uint, ChainApi, TxIntent};
use ethers_core::abi::Token;
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Eip1559TransactionRequest, H256, U256};
use ethers_signers::{LocalWallet, Signer as _};
use rand::Rng;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Delay between polls in the unbounded balance/gas wait loops.
const POLL_DELAY: Duration = Duration::from_secs(5);

/// Public address for a raw private key, checksummed. Used at record-creation
/// time before any [`Wallet`] exists.
pub fn derive_address(private_key: &str) -> Result<String> {
    let signer = parse_signer(private_key)?;
    Ok(ethers_core::utils::to_checksum(&signer.address(), None))
}

fn parse_signer(private_key: &str) -> Result<LocalWallet> {
    LocalWallet::from_str(private_key.trim_start_matches("0x"))
        .map_err(|_| Error::Store(StoreError::Config("invalid private key".into())))
}

pub struct Wallet<C> {
    signer: LocalWallet,
    pub address: Address,
    pub encoded_key: String,
    pub recipient: Option<Address>,
    chain: Arc<C>,
    reports: ReportStore,
    config: Arc<Config>,
}

impl<C: ChainApi> Wallet<C> {
    pub fn new(
        private_key: &str,
        encoded_key: String,
        recipient: Option<&str>,
        chain: Arc<C>,
        reports: ReportStore,
        config: Arc<Config>,
    ) -> Result<Self> {
        let signer = parse_signer(private_key)?;
        let address = signer.address();
        let recipient = recipient
            .map(|raw| {
                Address::from_str(raw).map_err(|_| {
                    Error::Store(StoreError::Config(format!("invalid recipient address {raw}")))
                })
            })
            .transpose()?;
        Ok(Self {
            signer,
            address,
            encoded_key,
            recipient,
            chain,
            reports,
            config,
        })
    }

    pub fn checksummed(&self) -> String {
        ethers_core::utils::to_checksum(&self.address, None)
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// Price, sign, submit, and confirm one transaction. Reports the outcome
    /// against the account. Failures other than receipt-wait timeouts come
    /// back as [`TxError`] carrying the chain's error code.
    pub async fn send_tx(
        &self,
        chain: &str,
        intent: TxIntent,
        label: &str,
        bump: f64,
    ) -> Result<H256> {
        match self.try_send(chain, &intent, label, bump).await {
            Ok(hash) => Ok(hash),
            // Receipt-wait ceilings and fatal store conditions keep their
            // class; everything else is a transaction failure.
            Err(err @ (Error::Transient(_) | Error::Store(_))) => Err(err),
            Err(Error::Transaction(tx)) => Err(Error::Transaction(TxError {
                label: label.to_string(),
                code: tx.code,
                encoded_tx: format!("0x{}", hex::encode(&intent.data)),
            })),
            Err(other) => Err(Error::Transaction(TxError {
                label: label.to_string(),
                code: other.to_string(),
                encoded_tx: format!("0x{}", hex::encode(&intent.data)),
            })),
        }
    }

    async fn try_send(
        &self,
        chain: &str,
        intent: &TxIntent,
        label: &str,
        bump: f64,
    ) -> Result<H256> {
        let (chain_id, nonce, fees) = tokio::try_join!(
            self.chain.chain_id(chain),
            self.chain.nonce(chain, self.address),
            self.chain.fee_estimate(chain, bump),
        )?;
        let gas = match intent.gas {
            Some(fixed) => U256::from(fixed),
            None => self.chain.estimate_gas(chain, self.address, intent).await?,
        };

        let request = Eip1559TransactionRequest::new()
            .from(self.address)
            .to(intent.to)
            .data(intent.data.clone())
            .value(intent.value)
            .chain_id(chain_id)
            .nonce(nonce)
            .gas(gas)
            .max_fee_per_gas(fees.max_fee)
            .max_priority_fee_per_gas(fees.priority_fee);
        let typed: TypedTransaction = request.into();

        let signature = self
            .signer
            .sign_transaction_sync(&typed)
            .map_err(|err| Error::Soft(format!("signing failed: {err}")))?;
        let raw = typed.rlp_signed(&signature);

        let hash = self.chain.send_raw(chain, raw).await?;
        tracing::debug!(address = %self.checksummed(), %hash, "{label} tx sent");

        let timeout = Duration::from_secs(self.config.tx_wait_minutes * 60);
        if self.chain.wait_receipt(chain, hash, timeout).await? {
            tracing::info!(address = %self.checksummed(), "{label} tx confirmed");
            self.reports
                .append(&self.encoded_key, label, Outcome::Success)
                .await?;
            Ok(hash)
        } else {
            self.reports
                .append(
                    &self.encoded_key,
                    &format!("{label} | tx reverted {hash:?}"),
                    Outcome::Failure,
                )
                .await?;
            Err(Error::Transaction(TxError {
                label: label.to_string(),
                code: format!("transaction reverted: {hash:?}"),
                encoded_tx: String::new(),
            }))
        }
    }

    /// ERC-20 balance. Transient RPC failures retry indefinitely.
    pub async fn token_balance(&self, chain: &str, token: Address) -> Result<U256> {
        let data = encode_call("balanceOf(address)", &[Token::Address(self.address)]);
        loop {
            match self.chain.call(chain, token, data.clone()).await {
                Ok(output) => return decode_uint(&output),
                Err(Error::Transient(reason)) => {
                    tracing::warn!(address = %self.checksummed(), %reason, "balance query failed, retrying");
                    tokio::time::sleep(POLL_DELAY).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    pub async fn token_decimals(&self, chain: &str, token: Address) -> Result<u32> {
        let output = self
            .chain
            .call(chain, token, encode_call("decimals()", &[]))
            .await?;
        Ok(decode_uint(&output)?.as_u32())
    }

    /// Approve `spender` for `value` unless the current allowance already
    /// covers it. Returns whether an approval transaction was sent.
    pub async fn approve_if_needed(
        &self,
        chain: &str,
        token: Address,
        symbol: &str,
        spender: Address,
        value: U256,
    ) -> Result<bool> {
        let allowance_data = encode_call(
            "allowance(address,address)",
            &[Token::Address(self.address), Token::Address(spender)],
        );
        let allowance = decode_uint(&self.chain.call(chain, token, allowance_data).await?)?;
        if allowance >= value {
            return Ok(false);
        }

        let decimals = self.token_decimals(chain, token).await?;
        let label = format!("approve {} {symbol}", human_amount(value, decimals));
        let data = encode_call(
            "approve(address,uint256)",
            &[Token::Address(spender), Token::Uint(value)],
        );
        self.send_tx(chain, TxIntent::call(token, data), &label, 0.0)
            .await?;
        Ok(true)
    }

    /// Transfer the full token `value` to the account's recipient.
    pub async fn transfer_token(
        &self,
        chain: &str,
        token: Address,
        symbol: &str,
        value: U256,
    ) -> Result<()> {
        let recipient = self
            .recipient
            .ok_or_else(|| Error::Soft("no recipient configured for token transfer".into()))?;
        let decimals = self.token_decimals(chain, token).await?;
        let label = format!("transfer {} {symbol}", human_amount(value, decimals));
        let data = encode_call(
            "transfer(address,uint256)",
            &[Token::Address(recipient), Token::Uint(value)],
        );
        self.send_tx(chain, TxIntent::call(token, data), &label, 0.0)
            .await?;
        Ok(())
    }

    /// Send the native balance to the recipient, keeping a randomized amount
    /// within the configured range. Recomputes with a growing reserve when the
    /// node reports the bid does not fit.
    pub async fn transfer_native(&self, chain: &str) -> Result<()> {
        let recipient = self
            .recipient
            .ok_or_else(|| Error::Soft("no recipient configured for native transfer".into()))?;
        let [keep_min, keep_max] = self.config.after_claim.keep_eth;
        // An inverted configured range degrades to its lower bound.
        let keep_max = keep_max.max(keep_min);
        let mut decrease = 0.0f64;

        loop {
            let balance = self.chain.native_balance(chain, self.address).await?;
            let available = balance.as_u128() as f64 / 1e18 - decrease;
            if available < keep_min {
                return Err(Error::Soft(format!(
                    "not enough ETH ({available:.5}) for the minimal keep balance ({keep_min})"
                )));
            }

            let keep_ceiling = keep_max.min(available);
            let keep = rand::thread_rng().gen_range(keep_min..=keep_ceiling);
            let digits: u32 = rand::thread_rng().gen_range(5..=7);
            let precision = 10f64.powi(digits as i32);
            let amount = ((available - keep) * precision).floor() / precision;
            let value = U256::from((amount * 1e18) as u128);
            let label = format!("transfer {amount:.5} ETH");

            let intent = TxIntent {
                to: recipient,
                data: Default::default(),
                value,
                gas: None,
            };
            match self.send_tx(chain, intent, &label, 0.0).await {
                Ok(_) => return Ok(()),
                Err(Error::Transaction(tx))
                    if tx.code.contains("insufficient funds")
                        || tx.code.contains("gas required exceeds allowance") =>
                {
                    decrease += 0.00001;
                    tracing::warn!(
                        address = %self.checksummed(),
                        decrease,
                        "insufficient funds for native transfer, recomputing"
                    );
                }
                Err(Error::Transaction(tx)) => {
                    return Err(Error::Soft(format!("failed to {label}: {}", tx.code)))
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Block until the Ethereum gas price drops below the configured ceiling.
    /// Retries indefinitely; only errors surface as log lines.
    pub async fn wait_for_gwei(&self) {
        let max_gwei = self.config.eth_max_gwei;
        let mut announced = false;
        loop {
            match self.chain.gas_price("ethereum").await {
                Ok(price) => {
                    let gwei = price.as_u128() as f64 / 1e9;
                    if gwei < max_gwei {
                        if announced {
                            tracing::debug!(address = %self.checksummed(), gwei, "gas price acceptable again");
                        }
                        return;
                    }
                    if !announced {
                        announced = true;
                        tracing::debug!(
                            address = %self.checksummed(),
                            gwei,
                            max_gwei,
                            "waiting for the gas price to drop"
                        );
                    }
                    tokio::time::sleep(POLL_DELAY).await;
                }
                Err(err) => {
                    tracing::warn!(address = %self.checksummed(), %err, "gas price query failed");
                    tokio::time::sleep(POLL_DELAY * 2).await;
                }
            }
        }
    }
}

/// Render a token value with its decimals for labels, trimmed to 5 places.
pub fn human_amount(value: U256, decimals: u32) -> String {
    let scale = 10f64.powi(decimals as i32);
    let amount = value.as_u128() as f64 / scale;
    let text = format!("{amount:.5}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_a_checksummed_address() {
        // Address of the secp256k1 generator-point key, a well-known vector.
        let address = derive_address(
            "0x0000000000000000000000000000000000000000000000000000000000000001",
        )
        .expect("derive");
        assert_eq!(address, "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf");
    }

    #[test]
    fn rejects_garbage_keys() {
        assert!(derive_address("not-a-key").is_err());
        assert!(derive_address("0x1234").is_err());
    }

    #[test]
    fn human_amount_trims_trailing_zeroes() {
        assert_eq!(human_amount(U256::from(1_500_000u64), 6), "1.5");
        // Below the display precision the value collapses to a bare zero.
        assert_eq!(human_amount(U256::from(1u64), 6), "0");
        assert_eq!(
            human_amount(U256::from(120_500_000_000_000_000_000u128), 18),
            "120.5"
        );
    }

    mod native_transfer {
        use super::*;
        use crate::config::Config;
        use crate::db::ReportStore;
        use crate::error::Result;
        use crate::rpc::{ChainApi, FeeEstimate, ReadCall, TxIntent};
        use ethers_core::types::{Address, Bytes, H256};
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::time::Duration;
        use tempfile::TempDir;

        const PK: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";
        const RECIPIENT: &str = "0x1111111111111111111111111111111111111111";

        struct MockChain {
            balance: U256,
            sent: AtomicUsize,
        }

        impl ChainApi for MockChain {
            async fn batch_read(
                &self,
                _chain: &str,
                _calls: &[ReadCall],
            ) -> Result<HashMap<&'static str, Bytes>> {
                Ok(HashMap::new())
            }

            async fn call(&self, _chain: &str, _to: Address, _data: Bytes) -> Result<Bytes> {
                Ok(Bytes::new())
            }

            async fn chain_id(&self, _chain: &str) -> Result<u64> {
                Ok(59144)
            }

            async fn nonce(&self, _chain: &str, _address: Address) -> Result<U256> {
                Ok(U256::zero())
            }

            async fn gas_price(&self, _chain: &str) -> Result<U256> {
                Ok(U256::from(1_000_000_000u64))
            }

            async fn fee_estimate(&self, _chain: &str, _bump: f64) -> Result<FeeEstimate> {
                let fee = U256::from(1_000_000_000u64);
                Ok(FeeEstimate { max_fee: fee, priority_fee: fee })
            }

            async fn estimate_gas(
                &self,
                _chain: &str,
                _from: Address,
                _intent: &TxIntent,
            ) -> Result<U256> {
                Ok(U256::from(21_000u64))
            }

            async fn send_raw(&self, _chain: &str, _raw: Bytes) -> Result<H256> {
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(H256::repeat_byte(0x22))
            }

            async fn wait_receipt(
                &self,
                _chain: &str,
                _hash: H256,
                _timeout: Duration,
            ) -> Result<bool> {
                Ok(true)
            }

            async fn native_balance(&self, _chain: &str, _address: Address) -> Result<U256> {
                Ok(self.balance)
            }
        }

        fn wallet_with_keep_range(
            dir: &TempDir,
            chain: Arc<MockChain>,
            keep_eth: [f64; 2],
        ) -> Wallet<MockChain> {
            let mut config = Config::default();
            config.after_claim.keep_eth = keep_eth;
            let reports = ReportStore::new(dir.path().join("report.json"));
            Wallet::new(PK, "k".into(), Some(RECIPIENT), chain, reports, Arc::new(config))
                .expect("wallet")
        }

        #[tokio::test]
        async fn inverted_keep_range_still_transfers() {
            let dir = TempDir::new().expect("tempdir");
            let chain = Arc::new(MockChain {
                balance: U256::from(1_000_000_000_000_000_000u128),
                sent: AtomicUsize::new(0),
            });
            let wallet = wallet_with_keep_range(&dir, chain.clone(), [0.0008, 0.0003]);

            wallet.transfer_native("linea").await.expect("transfer");
            assert_eq!(chain.sent.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn balance_below_keep_floor_is_soft() {
            let dir = TempDir::new().expect("tempdir");
            let chain = Arc::new(MockChain {
                balance: U256::from(100_000_000_000_000u128),
                sent: AtomicUsize::new(0),
            });
            let wallet = wallet_with_keep_range(&dir, chain.clone(), [0.0003, 0.0008]);

            let err = wallet.transfer_native("linea").await.unwrap_err();
            assert!(matches!(err, Error::Soft(_)));
            assert_eq!(chain.sent.load(Ordering::SeqCst), 0);
        }
    }
}
