//! Background refresh machinery
//!
//! Two sweeps keep backups eventually fresh without touching the request
//! path: a full-catalog pass (startup, or on demand) that re-fetches every
//! planning, and a queue drain that retries the plannings live traffic or a
//! previous sweep flagged as failing. Both run under cooperative
//! cancellation: the signal is checked between plannings, an in-flight fetch
//! still completes or times out on its own.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ParseErrorPolicy, RefreshConfig};
use crate::fetcher::FetchFailure;
use crate::resolver::EventResolver;
use crate::store::queue::RefreshQueueRow;
use crate::store::Store;

/// What one full-catalog sweep did.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSweepOutcome {
    pub scanned: usize,
    /// Backups actually written (content changed).
    pub written: usize,
    /// Fetches that succeeded but matched the stored content.
    pub unchanged: usize,
    /// Transient failures handed to the refresh queue.
    pub enqueued: usize,
    /// Permanent failures and plannings without a URL.
    pub skipped: usize,
    pub cancelled: bool,
}

/// What one queue-drain pass did.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DrainOutcome {
    pub claimed: usize,
    pub refreshed: usize,
    /// Transient failures, re-scheduled with backoff.
    pub failed: usize,
    /// Rows dropped: permanent failures, pruned or URL-less plannings.
    pub discarded: usize,
    /// Rows hit by a store error; they stay locked and are recovered by the
    /// stale-lock sweep.
    pub skipped: usize,
    pub stale_locks_swept: usize,
}

/// Re-fetches every planning in the persisted catalog and writes the results
/// through to the backups.
///
/// Per-planning problems never abort the sweep: store errors are logged and
/// the pass moves on, transient fetch failures are queued for retry with
/// normal (non-elevated) priority, permanent ones are only logged.
pub async fn run_plannings_backup(
    store: &Store,
    resolver: &EventResolver,
    cancel: &CancellationToken,
) -> Result<BackupSweepOutcome> {
    let plannings = store.list_plannings_async().await?;
    log::info!("Starting a backup sweep over {} plannings", plannings.len());

    let mut outcome = BackupSweepOutcome::default();
    for planning in &plannings {
        if cancel.is_cancelled() {
            log::info!(
                "Backup sweep cancelled after {} of {} plannings",
                outcome.scanned,
                plannings.len()
            );
            outcome.cancelled = true;
            break;
        }

        outcome.scanned += 1;
        if planning.url.is_none() {
            outcome.skipped += 1;
            continue;
        }

        match resolver.fetch_guarded(planning).await {
            Ok(events) => {
                match store.upsert_backup_async(&planning.full_id, events).await {
                    Ok(write) if write.written => outcome.written += 1,
                    Ok(_) => outcome.unchanged += 1,
                    Err(err) => {
                        log::error!(
                            "Unable to write the backup for {}: {}. Continuing the sweep",
                            planning.full_id,
                            err
                        );
                        outcome.skipped += 1;
                    }
                }
            }
            Err(failure) if failure.is_transient() => {
                log::debug!(
                    "Sweep fetch failed for {} ({}), queueing a retry",
                    planning.full_id,
                    failure
                );
                match store.enqueue_refresh_async(&planning.full_id, 0).await {
                    Ok(()) => outcome.enqueued += 1,
                    Err(err) => {
                        log::error!("Unable to enqueue {}: {}", planning.full_id, err);
                        outcome.skipped += 1;
                    }
                }
            }
            Err(failure) => {
                log::warn!(
                    "Upstream rejected planning {} ({}), not retrying",
                    planning.full_id,
                    failure
                );
                outcome.skipped += 1;
            }
        }
    }

    log::info!(
        "Backup sweep done: {} written, {} unchanged, {} enqueued, {} skipped",
        outcome.written,
        outcome.unchanged,
        outcome.enqueued,
        outcome.skipped
    );
    Ok(outcome)
}

/// Takes one batch from the refresh queue and processes it.
///
/// Stale locks are swept first so rows orphaned by a crashed worker become
/// claimable again. Each claimed row either completes (row deleted), fails
/// transiently (attempt counted, backoff extended, lock released) or turns
/// out to be pointless (planning pruned, URL gone, permanent failure: row
/// dropped).
pub async fn drain_refresh_queue(store: &Store, resolver: &EventResolver) -> Result<DrainOutcome> {
    let config = resolver.config().clone();
    let mut outcome = DrainOutcome::default();

    outcome.stale_locks_swept = store.sweep_stale_locks_async(config.stale_lock_age).await?;
    if outcome.stale_locks_swept > 0 {
        log::warn!(
            "Recovered {} refresh claims from crashed workers",
            outcome.stale_locks_swept
        );
    }

    let owner = format!("worker-{}", uuid::Uuid::new_v4());
    let rows = store
        .claim_refreshes_async(config.claim_batch_size, config.stale_lock_age, &owner)
        .await?;
    outcome.claimed = rows.len();
    if rows.is_empty() {
        return Ok(outcome);
    }
    log::debug!("Claimed {} refresh rows as {}", rows.len(), owner);

    for row in rows {
        // A store error on one row must not abort the pass; the row stays
        // locked and the stale sweep of a later pass recovers it
        match process_claimed_row(store, resolver, &config, &row).await {
            Ok(RowOutcome::Refreshed) => outcome.refreshed += 1,
            Ok(RowOutcome::Failed) => outcome.failed += 1,
            Ok(RowOutcome::Discarded) => outcome.discarded += 1,
            Err(err) => {
                log::error!(
                    "Unable to process the refresh row for {}: {}. Continuing the drain",
                    row.planning_full_id,
                    err
                );
                outcome.skipped += 1;
            }
        }
    }

    log::info!(
        "Queue drain: {} claimed, {} refreshed, {} failed, {} discarded, {} skipped",
        outcome.claimed,
        outcome.refreshed,
        outcome.failed,
        outcome.discarded,
        outcome.skipped
    );
    Ok(outcome)
}

enum RowOutcome {
    Refreshed,
    Failed,
    Discarded,
}

async fn process_claimed_row(
    store: &Store,
    resolver: &EventResolver,
    config: &RefreshConfig,
    row: &RefreshQueueRow,
) -> Result<RowOutcome> {
    let planning = match store.get_planning_async(&row.planning_full_id).await? {
        Some(planning) => planning,
        None => {
            // The catalog no longer knows this planning
            store.mark_refresh_success_async(&row.planning_full_id).await?;
            return Ok(RowOutcome::Discarded);
        }
    };
    if planning.url.is_none() {
        store
            .discard_refresh_async(&row.planning_full_id, "planning has no upstream URL")
            .await?;
        return Ok(RowOutcome::Discarded);
    }

    match resolver.fetch_guarded(&planning).await {
        Ok(events) => {
            store.upsert_backup_async(&planning.full_id, events).await?;
            store.mark_refresh_success_async(&planning.full_id).await?;
            Ok(RowOutcome::Refreshed)
        }
        Err(failure) => {
            if is_permanent(&failure, row, config.parse_error_policy) {
                store
                    .discard_refresh_async(&planning.full_id, &failure.to_string())
                    .await?;
                Ok(RowOutcome::Discarded)
            } else {
                store
                    .mark_refresh_failure_async(
                        &planning.full_id,
                        &failure.to_string(),
                        config.backoff,
                    )
                    .await?;
                Ok(RowOutcome::Failed)
            }
        }
    }
}

fn is_permanent(
    failure: &FetchFailure,
    row: &RefreshQueueRow,
    parse_policy: ParseErrorPolicy,
) -> bool {
    match failure {
        FetchFailure::ParseError { .. } => match parse_policy {
            ParseErrorPolicy::AlwaysTransient => false,
            // This failure is attempt number row.attempts + 1
            ParseErrorPolicy::PermanentAfter(ceiling) => row.attempts + 1 >= i64::from(ceiling),
        },
        other => other.is_transient() == false,
    }
}

/// Drains the queue on a timer until cancelled. The first drain happens
/// immediately, so a restart picks up pending work without waiting a full
/// interval.
pub async fn run_refresh_loop(
    store: Store,
    resolver: std::sync::Arc<EventResolver>,
    interval: Duration,
    cancel: CancellationToken,
) {
    log::info!(
        "Refresh worker started (interval {})",
        humanize(interval)
    );
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Refresh worker stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = drain_refresh_queue(&store, &resolver).await {
                    log::error!("Queue drain pass failed: {}", err);
                }
            }
        }
    }
}

fn humanize(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{}min", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
