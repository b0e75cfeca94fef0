//! Runner configuration loaded from `config.toml`.
//!
//! Every field has a default so a missing or partial file still produces a
//! working setup. Chain endpoints, claim-target addresses, and post-claim
//! behavior all live here rather than in code.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    /// Shuffle the work queue on every load.
    pub shuffle_wallets: bool,
    /// Attempts per pipeline before the account is marked failed.
    pub retry: u32,
    /// Ethereum gas-price ceiling (gwei) waited on before post-actions.
    pub eth_max_gwei: f64,
    /// Multiplier applied to the current base fee when sending.
    pub gwei_multiplier: f64,
    /// Minutes to wait for a transaction receipt before treating the wait as
    /// a transient RPC failure.
    pub tx_wait_minutes: u64,
    /// Concurrent pipelines (admission gate size).
    pub threads: usize,
    /// Seconds slept between on-chain actions within one account, [min, max].
    pub sleep_after_tx: [u64; 2],
    /// Seconds slept after each account before the slot is freed, [min, max].
    pub sleep_after_account: [u64; 2],
    /// Per-chain JSON-RPC endpoint pools.
    pub rpcs: HashMap<String, Vec<String>>,
    pub claim: ClaimConfig,
    pub after_claim: AfterClaimConfig,
    pub telegram: TelegramConfig,
    /// Preset database password for non-interactive runs. When unset the
    /// password is prompted once per process.
    pub password: Option<String>,
    /// Directory holding the two store documents.
    pub data_dir: PathBuf,
    /// Directory holding the line-delimited input lists.
    pub input_dir: PathBuf,
}

/// The claim target: which chain, which distributor contract, which token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ClaimConfig {
    pub chain: String,
    pub contract: String,
    pub token_address: String,
    pub token_symbol: String,
}

/// Post-claim actions, each gated independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AfterClaimConfig {
    /// Swap the claimed token to native via the aggregator.
    pub swap: bool,
    /// Swap slippage limit, percent.
    pub slippage: f64,
    /// Transfer the claimed token to the account's recipient.
    pub send_token: bool,
    /// Transfer remaining native balance to the recipient.
    pub send_eth: bool,
    /// Native amount kept on the wallet when sending out, [min, max].
    pub keep_eth: [f64; 2],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TelegramConfig {
    /// Bot token (`12345:Abcde`). Empty disables notifications.
    pub bot_token: String,
    /// Chat ids the rendered reports are delivered to.
    pub user_ids: Vec<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shuffle_wallets: true,
            retry: 3,
            eth_max_gwei: 25.0,
            gwei_multiplier: 1.5,
            tx_wait_minutes: 1,
            threads: 1,
            sleep_after_tx: [5, 10],
            sleep_after_account: [30, 60],
            rpcs: default_rpcs(),
            claim: ClaimConfig::default(),
            after_claim: AfterClaimConfig::default(),
            telegram: TelegramConfig::default(),
            password: None,
            data_dir: PathBuf::from("databases"),
            input_dir: PathBuf::from("input_data"),
        }
    }
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            chain: "linea".into(),
            contract: "0x87bAa1694381aE3eCaE2660d97fe60404080Eb64".into(),
            token_address: "0x1789e0043623282D5DCc7F213d703C6D8BAfBB04".into(),
            token_symbol: "LINEA".into(),
        }
    }
}

impl Default for AfterClaimConfig {
    fn default() -> Self {
        Self {
            swap: false,
            slippage: 5.0,
            send_token: false,
            send_eth: false,
            keep_eth: [0.0003, 0.0008],
        }
    }
}

fn default_rpcs() -> HashMap<String, Vec<String>> {
    HashMap::from([
        (
            "ethereum".to_string(),
            vec![
                "https://rpc.flashbots.net/fast".to_string(),
                "https://eth.drpc.org".to_string(),
                "https://ethereum-rpc.publicnode.com".to_string(),
            ],
        ),
        (
            "linea".to_string(),
            vec![
                "https://1rpc.io/linea".to_string(),
                "https://rpc.linea.build".to_string(),
                "https://linea-rpc.publicnode.com".to_string(),
            ],
        ),
    ])
}

impl Config {
    /// Load from a TOML file, falling back to defaults when the file does not
    /// exist. A file that exists but does not parse is an error — silently
    /// running with defaults would ignore operator intent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Whether any post-claim mode needs a recipient address.
    pub fn transfers_enabled(&self) -> bool {
        self.after_claim.send_token || self.after_claim.send_eth
    }

    pub fn accounts_db_path(&self) -> PathBuf {
        self.data_dir.join("modules.json")
    }

    pub fn reports_db_path(&self) -> PathBuf {
        self.data_dir.join("report.json")
    }
}
