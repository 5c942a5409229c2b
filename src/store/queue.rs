//! The durable refresh queue (the `refresh_queue` table)
//!
//! At most one row exists per planning: re-requesting a refresh merges into
//! the pending row instead of piling up duplicates. Workers take rows with
//! [`Store::claim_refreshes`], which locks them in a single conditional
//! UPDATE so that two concurrent claimers can never receive the same row,
//! no matter how many worker processes share the database.

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{now_rfc3339, parse_rfc3339, to_rfc3339, Store};
use crate::config::BackoffPolicy;

/// One pending background-refresh request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshQueueRow {
    pub planning_full_id: String,
    pub priority: i64,
    /// Failed tries so far.
    pub attempts: i64,
    pub requested_at: String,
    /// Earliest time a claimer may take this row again.
    pub next_attempt_at: String,
    pub locked_at: Option<String>,
    pub lock_owner: Option<String>,
    pub last_error: Option<String>,
}

/// Point-in-time queue health, for the snapshot endpoint.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub depth: i64,
    /// Unlocked rows whose `next_attempt_at` has passed.
    pub ready: i64,
    pub locked: i64,
    pub max_pending_priority: Option<i64>,
    pub oldest_pending_age_secs: Option<i64>,
}

impl Store {
    /// Requests a background refresh for a planning.
    ///
    /// If a row is already pending, its priority is raised to
    /// `max(existing, requested)` and nothing else is touched: an urgent
    /// re-request jumps the line but does not reset earned backoff delay.
    pub fn enqueue_refresh(&self, full_id: &str, priority: i64) -> Result<()> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO refresh_queue(planning_full_id, priority, attempts,
                                       requested_at, next_attempt_at)
             VALUES (?, ?, 0, ?, ?)
             ON CONFLICT(planning_full_id) DO UPDATE SET
               priority = MAX(refresh_queue.priority, excluded.priority)",
            params![full_id, priority, now, now],
        )?;
        Ok(())
    }

    /// Atomically claims up to `batch` due rows for `owner`.
    ///
    /// A row is claimable when it is unlocked (or its lock is older than
    /// `max_lock_age`, i.e. its claimer crashed) and its backoff delay has
    /// elapsed. Selection order is priority first, then request age. The
    /// lock is taken by a single conditional UPDATE, so concurrent claimers
    /// always receive disjoint sets.
    pub fn claim_refreshes(
        &self,
        batch: usize,
        max_lock_age: StdDuration,
        owner: &str,
    ) -> Result<Vec<RefreshQueueRow>> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        let stale_before = lock_stale_threshold(max_lock_age);

        let mut stmt = conn.prepare(
            "UPDATE refresh_queue SET locked_at = ?1, lock_owner = ?2
             WHERE planning_full_id IN (
                SELECT planning_full_id FROM refresh_queue
                 WHERE (locked_at IS NULL OR locked_at < ?3)
                   AND next_attempt_at <= ?1
                 ORDER BY priority DESC, requested_at ASC
                 LIMIT ?4)
               AND (locked_at IS NULL OR locked_at < ?3)
             RETURNING planning_full_id, priority, attempts, requested_at,
                       next_attempt_at, locked_at, lock_owner, last_error",
        )?;
        let mut rows = stmt.query(params![now, owner, stale_before, batch as i64])?;
        let mut claimed = Vec::new();
        while let Some(row) = rows.next()? {
            claimed.push(RefreshQueueRow {
                planning_full_id: row.get(0)?,
                priority: row.get(1)?,
                attempts: row.get(2)?,
                requested_at: row.get(3)?,
                next_attempt_at: row.get(4)?,
                locked_at: row.get(5)?,
                lock_owner: row.get(6)?,
                last_error: row.get(7)?,
            });
        }
        // RETURNING does not guarantee the subselect's order
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.requested_at.cmp(&b.requested_at))
        });
        Ok(claimed)
    }

    /// The refresh went through: the request is fulfilled, drop the row.
    pub fn mark_refresh_success(&self, full_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM refresh_queue WHERE planning_full_id = ?",
            [full_id],
        )?;
        Ok(n > 0)
    }

    /// The refresh failed with a permanent error: retrying is pointless,
    /// drop the row and keep a log trace.
    pub fn discard_refresh(&self, full_id: &str, error: &str) -> Result<bool> {
        log::warn!(
            "Dropping refresh request for {} after permanent failure: {}",
            full_id,
            error
        );
        self.mark_refresh_success(full_id)
    }

    /// The refresh failed transiently: count the attempt, push
    /// `next_attempt_at` out by the backoff delay and release the lock so a
    /// future pass can retry.
    pub fn mark_refresh_failure(
        &self,
        full_id: &str,
        error: &str,
        backoff: &BackoffPolicy,
    ) -> Result<()> {
        let conn = self.conn()?;
        let attempts: Option<i64> = conn
            .query_row(
                "SELECT attempts FROM refresh_queue WHERE planning_full_id = ?",
                [full_id],
                |row| row.get(0),
            )
            .optional()?;
        let attempts = match attempts {
            // Row vanished (e.g. its planning was pruned mid-flight)
            None => return Ok(()),
            Some(n) => n,
        };

        let delay = backoff.delay_for((attempts + 1).try_into().unwrap_or(u32::MAX));
        let next_attempt_at =
            to_rfc3339(Utc::now() + Duration::milliseconds(delay.as_millis() as i64));
        conn.execute(
            "UPDATE refresh_queue SET attempts = attempts + 1, next_attempt_at = ?,
                    locked_at = NULL, lock_owner = NULL, last_error = ?
             WHERE planning_full_id = ?",
            params![next_attempt_at, error, full_id],
        )?;
        Ok(())
    }

    /// Clears locks held longer than `max_lock_age` (worker crash recovery).
    /// Returns how many rows became claimable again.
    pub fn sweep_stale_locks(&self, max_lock_age: StdDuration) -> Result<usize> {
        let conn = self.conn()?;
        let stale_before = lock_stale_threshold(max_lock_age);
        let n = conn.execute(
            "UPDATE refresh_queue SET locked_at = NULL, lock_owner = NULL
             WHERE locked_at IS NOT NULL AND locked_at < ?",
            [&stale_before],
        )?;
        Ok(n)
    }

    /// Point-in-time queue health, recomputed on every call.
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let now = now_rfc3339();

        let depth: i64 = conn.query_row("SELECT COUNT(1) FROM refresh_queue", [], |r| r.get(0))?;
        let ready: i64 = conn.query_row(
            "SELECT COUNT(1) FROM refresh_queue
             WHERE locked_at IS NULL AND next_attempt_at <= ?",
            [&now],
            |r| r.get(0),
        )?;
        let locked: i64 = conn.query_row(
            "SELECT COUNT(1) FROM refresh_queue WHERE locked_at IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        let max_pending_priority: Option<i64> = conn.query_row(
            "SELECT MAX(priority) FROM refresh_queue",
            [],
            |r| r.get(0),
        )?;
        let oldest_requested_at: Option<String> = conn.query_row(
            "SELECT MIN(requested_at) FROM refresh_queue",
            [],
            |r| r.get(0),
        )?;
        let oldest_pending_age_secs = match oldest_requested_at {
            None => None,
            Some(text) => {
                let requested = parse_rfc3339(&text)?;
                Some((Utc::now() - requested).num_seconds().max(0))
            }
        };

        Ok(QueueStats {
            depth,
            ready,
            locked,
            max_pending_priority,
            oldest_pending_age_secs,
        })
    }

    pub async fn enqueue_refresh_async(&self, full_id: &str, priority: i64) -> Result<()> {
        let full_id = full_id.to_string();
        self.run_blocking(move |store| store.enqueue_refresh(&full_id, priority))
            .await
    }

    pub async fn claim_refreshes_async(
        &self,
        batch: usize,
        max_lock_age: StdDuration,
        owner: &str,
    ) -> Result<Vec<RefreshQueueRow>> {
        let owner = owner.to_string();
        self.run_blocking(move |store| store.claim_refreshes(batch, max_lock_age, &owner))
            .await
    }

    pub async fn mark_refresh_success_async(&self, full_id: &str) -> Result<bool> {
        let full_id = full_id.to_string();
        self.run_blocking(move |store| store.mark_refresh_success(&full_id))
            .await
    }

    pub async fn discard_refresh_async(&self, full_id: &str, error: &str) -> Result<bool> {
        let full_id = full_id.to_string();
        let error = error.to_string();
        self.run_blocking(move |store| store.discard_refresh(&full_id, &error))
            .await
    }

    pub async fn mark_refresh_failure_async(
        &self,
        full_id: &str,
        error: &str,
        backoff: BackoffPolicy,
    ) -> Result<()> {
        let full_id = full_id.to_string();
        let error = error.to_string();
        self.run_blocking(move |store| store.mark_refresh_failure(&full_id, &error, &backoff))
            .await
    }

    pub async fn sweep_stale_locks_async(&self, max_lock_age: StdDuration) -> Result<usize> {
        self.run_blocking(move |store| store.sweep_stale_locks(max_lock_age))
            .await
    }

    pub async fn queue_stats_async(&self) -> Result<QueueStats> {
        self.run_blocking(move |store| store.queue_stats()).await
    }
}

fn lock_stale_threshold(max_lock_age: StdDuration) -> String {
    to_rfc3339(Utc::now() - Duration::milliseconds(max_lock_age.as_millis() as i64))
}
