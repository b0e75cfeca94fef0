//! Bounded retry with error classification.
//!
//! Wraps one full pipeline attempt. Store errors abort the batch immediately;
//! transaction errors retry with a per-attempt gas bump unless their code
//! matches the non-retryable policy table; soft business failures end the
//! account without retrying; anything else is treated as transient. Exhausted
//! retries become a reported soft failure, never a crash.

use crate::db::{Outcome, ReportStore};
use crate::error::{Error, Result};
use crate::pipeline::RunStatus;
use std::future::Future;
use std::time::Duration;

/// Chain error-code prefixes that will never succeed on retry, with the
/// report text the account gets instead of a raw revert code.
pub const NON_RETRYABLE_CODES: &[(&str, &str)] =
    &[("0xe450d38c", "claim is not started yet")];

/// Policy lookup: report text for a code that must not be retried.
pub fn non_retryable_reason(code: &str) -> Option<&'static str> {
    NON_RETRYABLE_CODES
        .iter()
        .find(|(prefix, _)| code.starts_with(prefix))
        .map(|(_, reason)| *reason)
}

/// Delay between attempts.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Run `op` up to `attempts` times. The attempt index is passed through so the
/// operation can raise its gas bid on later tries.
///
/// Returns `Err` only for fatal store errors; every other path resolves to a
/// terminal [`RunStatus`] with the failure recorded against the account.
pub async fn with_retries<F, Fut>(
    source: &str,
    address: &str,
    encoded_key: &str,
    reports: &ReportStore,
    attempts: u32,
    mut op: F,
) -> Result<RunStatus>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<RunStatus>>,
{
    let attempts = attempts.max(1);
    let mut last_failure = String::new();

    for attempt in 0..attempts {
        match op(attempt).await {
            Ok(status) => return Ok(status),
            Err(error @ Error::Store(_)) => return Err(error),
            Err(Error::Transaction(tx)) => {
                if let Some(reason) = non_retryable_reason(&tx.code) {
                    tracing::warn!(%address, source, code = %tx.code, "{reason}");
                    reports.append(encoded_key, reason, Outcome::Failure).await?;
                    return Ok(RunStatus::Failed);
                }
                tracing::warn!(
                    %address,
                    source,
                    attempt = attempt + 1,
                    label = %tx.label,
                    code = %tx.code,
                    "transaction failed, will retry with a higher gas bid"
                );
                last_failure = tx.to_string();
            }
            Err(Error::Soft(message)) => {
                tracing::warn!(%address, source, "{message}");
                reports.append(encoded_key, &message, Outcome::Failure).await?;
                return Ok(RunStatus::Failed);
            }
            Err(error) => {
                tracing::warn!(
                    %address,
                    source,
                    attempt = attempt + 1,
                    %error,
                    "attempt failed, retrying"
                );
                last_failure = error.to_string();
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    tracing::error!(%address, source, "retries exhausted: {last_failure}");
    reports
        .append(encoded_key, &last_failure, Outcome::Failure)
        .await?;
    Ok(RunStatus::Failed)
}
