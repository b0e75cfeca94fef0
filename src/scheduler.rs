//! Concurrent batch execution over the account queue.
//!
//! One task per account, admission-gated by a semaphore sized from the config.
//! An account's outcome is always settled — record removed or marked failed,
//! report drained and delivered — before its slot frees up, so a crash can
//! only lose work that was still `to_run`. Only fatal store errors cross the
//! account boundary and abort the whole batch.

use crate::config::Config;
use crate::db::{AccountStore, Outcome, ReportStore, WorkItem};
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::pipeline::{ClaimPipeline, RunStatus};
use crate::retry::with_retries;
use crate::rpc::ChainApi;
use crate::swap::SwapApi;
use crate::wallet::Wallet;
use ethers_core::types::Address;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Gas-bid increase per retry attempt.
const BUMP_PER_ATTEMPT: f64 = 0.5;

/// What a batch found in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The store held no accounts.
    Empty,
    /// Every loaded account was driven to a terminal state.
    Drained,
}

/// Builds the per-account swap client; accounts route through their own proxy.
pub type SwapFactory<S> =
    Arc<dyn Fn(Address, Option<&str>) -> Result<S> + Send + Sync>;

/// Run every queued account to a terminal state.
pub async fn run_batch<C, S, N>(
    store: &AccountStore,
    reports: &ReportStore,
    chain: Arc<C>,
    swap_factory: SwapFactory<S>,
    notifier: Arc<N>,
    config: Arc<Config>,
) -> Result<BatchOutcome>
where
    C: ChainApi,
    S: SwapApi + 'static,
    N: Notifier,
{
    let items = store.load_all().await?;
    if items.is_empty() {
        return Ok(BatchOutcome::Empty);
    }

    let total = items.len();
    let done = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(config.threads.max(1)));
    tracing::info!(accounts = total, threads = config.threads, "starting batch");

    let mut tasks = JoinSet::new();
    for item in items {
        let permit = gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Transient("admission gate closed".into()))?;
        let store = store.clone();
        let reports = reports.clone();
        let chain = chain.clone();
        let swap_factory = swap_factory.clone();
        let notifier = notifier.clone();
        let config = config.clone();
        let done = done.clone();

        tasks.spawn(async move {
            let result = process_account(
                &item, &store, &reports, chain, swap_factory, notifier, config, &done, total,
            )
            .await;
            drop(permit);
            result
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(fatal)) => {
                tasks.abort_all();
                return Err(fatal);
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                tracing::error!(%err, "account task panicked");
            }
        }
    }

    Ok(BatchOutcome::Drained)
}

/// Drive one account to a terminal state and settle it. `Err` means a fatal
/// store failure; everything else resolves to a settled account.
#[allow(clippy::too_many_arguments)]
async fn process_account<C, S, N>(
    item: &WorkItem,
    store: &AccountStore,
    reports: &ReportStore,
    chain: Arc<C>,
    swap_factory: SwapFactory<S>,
    notifier: Arc<N>,
    config: Arc<Config>,
    done: &AtomicUsize,
    total: usize,
) -> Result<()>
where
    C: ChainApi,
    S: SwapApi,
    N: Notifier,
{
    let status = run_account(item, reports, chain, swap_factory, &config).await?;

    store
        .remove(&item.encoded_key, status == RunStatus::Completed)
        .await?;
    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
    let block = reports
        .drain_and_render(&item.encoded_key, &item.address, (finished, total))
        .await?;
    notifier.send(&block).await;

    let [min, max] = config.sleep_after_account;
    let pause = rand::thread_rng().gen_range(min..=max.max(min));
    if pause > 0 {
        tokio::time::sleep(Duration::from_secs(pause)).await;
    }
    Ok(())
}

async fn run_account<C, S>(
    item: &WorkItem,
    reports: &ReportStore,
    chain: Arc<C>,
    swap_factory: SwapFactory<S>,
    config: &Arc<Config>,
) -> Result<RunStatus>
where
    C: ChainApi,
    S: SwapApi,
{
    let wallet = Wallet::new(
        &item.private_key,
        item.encoded_key.clone(),
        item.recipient.as_deref(),
        chain,
        reports.clone(),
        config.clone(),
    )?;

    let swap = match swap_factory(wallet.address, item.proxy.as_deref()) {
        Ok(swap) => swap,
        Err(err @ Error::Store(_)) => return Err(err),
        Err(err) => {
            tracing::warn!(address = %item.address, %err, "account setup failed");
            reports
                .append(&item.encoded_key, &err.to_string(), Outcome::Failure)
                .await?;
            return Ok(RunStatus::Failed);
        }
    };

    let wallet = &wallet;
    let swap = &swap;
    let config = config.as_ref();
    with_retries(
        &item.module.name,
        &item.address,
        &item.encoded_key,
        reports,
        config.retry,
        |attempt| async move {
            ClaimPipeline::new(wallet, swap, config, reports)?
                .run(attempt as f64 * BUMP_PER_ATTEMPT)
                .await
        },
    )
    .await
}
