//! One account's claim pipeline.
//!
//! Eligibility check, the claim transaction itself, then the configured
//! post-claim actions (swap to native, token transfer, native sweep). Every
//! step reports through the account's report entry; classification of what is
//! retryable happens in the retry layer above.

use crate::config::Config;
use crate::db::{Outcome, ReportStore};
use crate::error::{Result, StoreError};
use crate::rpc::{decode_bool, decode_uint, encode_call, ChainApi, ReadCall, TxIntent};
use crate::swap::{SwapApi, NATIVE_TOKEN};
use crate::wallet::Wallet;
use ethers_core::abi::Token;
use ethers_core::types::{Address, U256};
use rand::Rng;
use std::str::FromStr;
use std::time::Duration;

/// Terminal state of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Eligibility {
    NotEligible,
    AlreadyClaimed { amount: f64 },
    Eligible { amount: f64 },
}

pub struct ClaimPipeline<'a, C, S> {
    wallet: &'a Wallet<C>,
    swap: &'a S,
    config: &'a Config,
    reports: &'a ReportStore,
    contract: Address,
    token: Address,
}

impl<'a, C: ChainApi, S: SwapApi> ClaimPipeline<'a, C, S> {
    pub fn new(
        wallet: &'a Wallet<C>,
        swap: &'a S,
        config: &'a Config,
        reports: &'a ReportStore,
    ) -> Result<Self> {
        let contract = parse_address(&config.claim.contract, "claim contract")?;
        let token = parse_address(&config.claim.token_address, "claim token")?;
        Ok(Self {
            wallet,
            swap,
            config,
            reports,
            contract,
            token,
        })
    }

    /// One full attempt. `bump` raises the gas bid on retried attempts.
    pub async fn run(&self, bump: f64) -> Result<RunStatus> {
        let chain = self.config.claim.chain.as_str();
        let symbol = self.config.claim.token_symbol.as_str();
        let address = self.wallet.checksummed();

        match self.eligibility(chain).await? {
            Eligibility::NotEligible => {
                tracing::info!(%address, "not eligible for the claim");
                self.reports
                    .append(&self.wallet.encoded_key, "not eligible", Outcome::Failure)
                    .await?;
                return Ok(RunStatus::Failed);
            }
            Eligibility::AlreadyClaimed { amount } => {
                tracing::info!(%address, amount, "already claimed");
                self.reports
                    .append(
                        &self.wallet.encoded_key,
                        &format!("already claimed {amount} {symbol}"),
                        Outcome::Success,
                    )
                    .await?;
                self.post_actions(chain, false, bump).await?;
            }
            Eligibility::Eligible { amount } => {
                tracing::info!(%address, amount, "eligible, claiming");
                self.reports
                    .append(
                        &self.wallet.encoded_key,
                        &format!("eligible for {amount} {symbol}"),
                        Outcome::Success,
                    )
                    .await?;
                let intent = TxIntent::call(self.contract, encode_call("claim()", &[]));
                self.wallet
                    .send_tx(chain, intent, &format!("claim {amount} {symbol}"), bump)
                    .await?;
                self.post_actions(chain, true, bump).await?;
            }
        }
        Ok(RunStatus::Completed)
    }

    /// Allocation and claimed flag in one RPC round trip.
    async fn eligibility(&self, chain: &str) -> Result<Eligibility> {
        let owner = Token::Address(self.wallet.address);
        let calls = [
            ReadCall {
                name: "allocation",
                to: self.contract,
                data: encode_call("calculateAllocation(address)", &[owner.clone()]),
            },
            ReadCall {
                name: "claimed",
                to: self.contract,
                data: encode_call("hasClaimed(address)", &[owner]),
            },
        ];
        let results = self.wallet_chain().batch_read(chain, &calls).await?;

        let allocation = decode_uint(
            results
                .get("allocation")
                .ok_or_else(|| crate::Error::Transient("allocation missing from batch".into()))?,
        )?;
        let claimed = decode_bool(
            results
                .get("claimed")
                .ok_or_else(|| crate::Error::Transient("claimed flag missing from batch".into()))?,
        )?;

        let amount = (allocation.as_u128() as f64 / 1e18 * 10.0).round() / 10.0;
        Ok(if allocation.is_zero() {
            Eligibility::NotEligible
        } else if claimed {
            Eligibility::AlreadyClaimed { amount }
        } else {
            Eligibility::Eligible { amount }
        })
    }

    /// Post-claim actions driven by the current token balance, so a rerun
    /// after a crash picks up where the claim left off.
    async fn post_actions(&self, chain: &str, mut acted: bool, bump: f64) -> Result<()> {
        let symbol = self.config.claim.token_symbol.as_str();
        let after = &self.config.after_claim;

        let balance = self.wallet.token_balance(chain, self.token).await?;
        if !balance.is_zero() {
            if after.swap {
                self.maybe_sleep(acted).await;
                self.wallet.wait_for_gwei().await;
                acted = self.swap_to_native(chain, symbol, balance, bump).await? || acted;
            } else if after.send_token {
                self.maybe_sleep(acted).await;
                self.wallet.wait_for_gwei().await;
                self.wallet
                    .transfer_token(chain, self.token, symbol, balance)
                    .await?;
                acted = true;
            }
        }

        if after.send_eth && self.wallet.recipient.is_some() {
            self.maybe_sleep(acted).await;
            self.wallet.wait_for_gwei().await;
            self.wallet.transfer_native(chain).await?;
        }
        Ok(())
    }

    async fn swap_to_native(
        &self,
        chain: &str,
        symbol: &str,
        balance: U256,
        bump: f64,
    ) -> Result<bool> {
        let chain_id = self.wallet_chain().chain_id(chain).await?;
        let router = self.swap.router_address(chain_id).await?;

        if self
            .wallet
            .approve_if_needed(chain, self.token, symbol, router, balance)
            .await?
        {
            self.maybe_sleep(true).await;
        }

        let quote = self
            .swap
            .quote(
                chain_id,
                self.token,
                NATIVE_TOKEN,
                balance,
                self.config.after_claim.slippage,
            )
            .await?;
        let assembled = self.swap.assemble(&quote.path_id).await?;

        let decimals = self.wallet.token_decimals(chain, self.token).await?;
        let amount_in = crate::wallet::human_amount(balance, decimals);
        let label = format!(
            "odos swap {amount_in} {symbol} -> {:.5} ETH",
            quote.amount_out
        );
        let intent = TxIntent {
            to: assembled.to,
            data: assembled.data,
            value: assembled.value,
            gas: assembled.gas,
        };
        self.wallet.send_tx(chain, intent, &label, bump).await?;
        Ok(true)
    }

    /// Random pause between on-chain actions; skipped before the first one.
    async fn maybe_sleep(&self, acted: bool) {
        if !acted {
            return;
        }
        let [min, max] = self.config.sleep_after_tx;
        let seconds = rand::thread_rng().gen_range(min..=max.max(min));
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    }

    fn wallet_chain(&self) -> &C {
        self.wallet.chain()
    }
}

fn parse_address(raw: &str, what: &str) -> Result<Address> {
    Address::from_str(raw)
        .map_err(|_| StoreError::Config(format!("invalid {what} address: {raw}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::rpc::FeeEstimate;
    use crate::swap::{AssembledTx, Quote};
    use ethers_core::abi;
    use ethers_core::types::{Bytes, H256};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const PK: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    struct MockChain {
        allocation: U256,
        claimed: bool,
        token_balance: U256,
        sent: AtomicUsize,
    }

    impl MockChain {
        fn new(allocation: u128, claimed: bool) -> Self {
            Self {
                allocation: U256::from(allocation),
                claimed,
                token_balance: U256::zero(),
                sent: AtomicUsize::new(0),
            }
        }
    }

    impl ChainApi for MockChain {
        async fn batch_read(
            &self,
            _chain: &str,
            calls: &[ReadCall],
        ) -> Result<HashMap<&'static str, Bytes>> {
            let mut out = HashMap::new();
            for call in calls {
                let data: Bytes = match call.name {
                    "allocation" => abi::encode(&[Token::Uint(self.allocation)]).into(),
                    "claimed" => abi::encode(&[Token::Bool(self.claimed)]).into(),
                    other => panic!("unexpected batch call {other}"),
                };
                out.insert(call.name, data);
            }
            Ok(out)
        }

        async fn call(&self, _chain: &str, _to: Address, data: Bytes) -> Result<Bytes> {
            // balanceOf / decimals are the only view calls the pipeline makes.
            if data.starts_with(&encode_call("decimals()", &[])[..4]) {
                return Ok(abi::encode(&[Token::Uint(U256::from(18u64))]).into());
            }
            Ok(abi::encode(&[Token::Uint(self.token_balance)]).into())
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
            Ok(FeeEstimate {
                max_fee: fee,
                priority_fee: fee,
            })
        }

        async fn estimate_gas(
            &self,
            _chain: &str,
            _from: Address,
            _intent: &TxIntent,
        ) -> Result<U256> {
            Ok(U256::from(100_000u64))
        }

        async fn send_raw(&self, _chain: &str, _raw: Bytes) -> Result<H256> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(H256::repeat_byte(0x11))
        }

        async fn wait_receipt(&self, _chain: &str, _hash: H256, _timeout: Duration) -> Result<bool> {
            Ok(true)
        }

        async fn native_balance(&self, _chain: &str, _address: Address) -> Result<U256> {
            Ok(U256::zero())
        }
    }

    struct NoSwap;

    impl SwapApi for NoSwap {
        async fn router_address(&self, _chain_id: u64) -> Result<Address> {
            Err(Error::Transient("swap disabled in this test".into()))
        }

        async fn quote(
            &self,
            _chain_id: u64,
            _token_in: Address,
            _token_out: Address,
            _value: U256,
            _slippage: f64,
        ) -> Result<Quote> {
            Err(Error::Transient("swap disabled in this test".into()))
        }

        async fn assemble(&self, _path_id: &str) -> Result<AssembledTx> {
            Err(Error::Transient("swap disabled in this test".into()))
        }
    }

    fn fixtures(
        dir: &TempDir,
        chain: MockChain,
    ) -> (Arc<MockChain>, Wallet<MockChain>, ReportStore, Arc<Config>) {
        let chain = Arc::new(chain);
        let reports = ReportStore::new(dir.path().join("report.json"));
        let mut config = Config::default();
        config.sleep_after_tx = [0, 0];
        let config = Arc::new(config);
        let wallet = Wallet::new(
            PK,
            "k".into(),
            None,
            chain.clone(),
            reports.clone(),
            config.clone(),
        )
        .expect("wallet");
        (chain, wallet, reports, config)
    }

    #[tokio::test(start_paused = true)]
    async fn zero_allocation_fails_without_sending() {
        let dir = TempDir::new().expect("tempdir");
        let (chain, wallet, reports, config) = fixtures(&dir, MockChain::new(0, false));
        let pipeline = ClaimPipeline::new(&wallet, &NoSwap, &config, &reports).expect("pipeline");

        let status = pipeline.run(0.0).await.expect("run");
        assert_eq!(status, RunStatus::Failed);
        assert_eq!(chain.sent.load(Ordering::SeqCst), 0);

        let block = reports
            .drain_and_render("k", "0xabc", (1, 1))
            .await
            .expect("drain");
        assert!(block.contains("not eligible"));
    }

    #[tokio::test(start_paused = true)]
    async fn already_claimed_completes_without_sending() {
        let dir = TempDir::new().expect("tempdir");
        let (chain, wallet, reports, config) =
            fixtures(&dir, MockChain::new(500_000_000_000_000_000_000, true));
        let pipeline = ClaimPipeline::new(&wallet, &NoSwap, &config, &reports).expect("pipeline");

        let status = pipeline.run(0.0).await.expect("run");
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(chain.sent.load(Ordering::SeqCst), 0);

        let block = reports
            .drain_and_render("k", "0xabc", (1, 1))
            .await
            .expect("drain");
        assert!(block.contains("✅ already claimed 500 LINEA"));
        assert!(block.contains("Success rate 1/1"));
    }

    #[tokio::test(start_paused = true)]
    async fn eligible_account_sends_the_claim() {
        let dir = TempDir::new().expect("tempdir");
        let (chain, wallet, reports, config) =
            fixtures(&dir, MockChain::new(500_000_000_000_000_000_000, false));
        let pipeline = ClaimPipeline::new(&wallet, &NoSwap, &config, &reports).expect("pipeline");

        let status = pipeline.run(0.0).await.expect("run");
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(chain.sent.load(Ordering::SeqCst), 1);

        let block = reports
            .drain_and_render("k", "0xabc", (1, 1))
            .await
            .expect("drain");
        assert!(block.contains("✅ eligible for 500 LINEA"));
        assert!(block.contains("✅ claim 500 LINEA"));
        assert!(block.contains("Success rate 2/2"));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_contract_address_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let (_, wallet, reports, _) = fixtures(&dir, MockChain::new(0, false));
        let mut config = Config::default();
        config.claim.contract = "not-an-address".into();

        let err = ClaimPipeline::new(&wallet, &NoSwap, &config, &reports)
            .err()
            .expect("bad address");
        assert!(err.is_fatal());
    }
}
