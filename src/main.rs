use airclaim::config::Config;
use airclaim::crypto::Keychain;
use airclaim::db::{AccountStore, ReportStore};
use airclaim::notify::TelegramNotifier;
use airclaim::rpc::HttpRpc;
use airclaim::scheduler::{self, BatchOutcome, SwapFactory};
use airclaim::swap::OdosClient;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser)]
#[command(name = "airclaim", about = "Concurrent token airdrop claim runner")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt the input lists into a fresh account database.
    Create,
    /// Run every queued account through the claim pipeline.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Arc::new(Config::load(&cli.config)?);
    let keychain = Arc::new(match &config.password {
        Some(password) => Keychain::with_password(password.clone()),
        None => Keychain::interactive(),
    });
    let store = AccountStore::new(
        config.accounts_db_path(),
        keychain,
        config.shuffle_wallets,
    );
    let reports = ReportStore::new(config.reports_db_path());

    match cli.command {
        Command::Create => create(&config, &store, &reports).await,
        Command::Run => run(config, &store, &reports).await,
    }
}

async fn create(config: &Config, store: &AccountStore, reports: &ReportStore) -> anyhow::Result<()> {
    let private_keys = read_lines(&config.input_dir.join("private_keys.txt"), true)?;
    let recipients = read_lines(&config.input_dir.join("recipients.txt"), false)?;
    let proxies = read_lines(&config.input_dir.join("proxies.txt"), false)?;

    let created = store
        .create(
            reports,
            private_keys,
            recipients,
            proxies,
            config.transfers_enabled(),
        )
        .await?;
    tracing::info!(accounts = created, "account database ready");
    Ok(())
}

async fn run(config: Arc<Config>, store: &AccountStore, reports: &ReportStore) -> anyhow::Result<()> {
    let chain = Arc::new(HttpRpc::new(&config));
    let notifier = Arc::new(TelegramNotifier::from_config(&config.telegram));
    let factory: SwapFactory<OdosClient> =
        Arc::new(|address, proxy| OdosClient::new(address, proxy));

    let mut previous_remaining = None;
    loop {
        let outcome = scheduler::run_batch(
            store,
            reports,
            chain.clone(),
            factory.clone(),
            notifier.clone(),
            config.clone(),
        )
        .await?;

        match outcome {
            BatchOutcome::Empty => {
                tracing::info!("all accounts done");
                return Ok(());
            }
            BatchOutcome::Drained => {
                let remaining = store.count().await?;
                if remaining == 0 {
                    tracing::info!("all accounts done");
                    return Ok(());
                }
                // A batch that leaves the queue unchanged is stuck on accounts
                // that fail every run; rerunning would spin forever.
                if previous_remaining == Some(remaining) {
                    tracing::warn!(
                        remaining,
                        "accounts keep failing, stopping; rerun after fixing the cause"
                    );
                    return Ok(());
                }
                previous_remaining = Some(remaining);
                tracing::info!(remaining, "re-running the remaining accounts");
            }
        }
    }
}

/// Read one trimmed entry per non-empty line. A missing optional file is an
/// empty list; a missing required one is an error.
fn read_lines(path: &Path, required: bool) -> anyhow::Result<Vec<String>> {
    if !path.exists() {
        if required {
            anyhow::bail!("input file {} does not exist", path.display());
        }
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let fmt_layer = tracing_subscriber::fmt::layer().compact();
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
