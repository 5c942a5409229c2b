//! Operations on cached event sets (the `planning_backups` table)
//!
//! A backup is the last-known-good answer for one planning. It is only ever
//! written by a successful fetch (live write-through or background refresh),
//! never by a read path, and writes are skipped entirely when the fetched
//! content matches what is already stored.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use sha2::Digest as _;

use super::{now_rfc3339, parse_rfc3339, to_rfc3339, Store};
use crate::planning::{Event, PlanningBackup};

/// Outcome of one backup upsert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackupWrite {
    /// False when the stored signature already matched (no row touched).
    pub written: bool,
    pub events: usize,
}

/// Cache coverage and staleness, for the health snapshot.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub plannings_total: i64,
    pub backups_total: i64,
    /// Plannings that have no backup at all.
    pub missing: i64,
    pub stale_over_1h: i64,
    pub stale_over_6h: i64,
    pub stale_over_24h: i64,
}

/// Content fingerprint over an ordered event list. Order- and
/// field-sensitive: any difference in any event changes the signature.
pub fn events_signature(events: &[Event]) -> Result<String> {
    let canonical = serde_json::to_string(events).context("unable to serialize events")?;
    let mut hasher = sha2::Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

impl Store {
    pub fn read_backup(&self, full_id: &str) -> Result<Option<PlanningBackup>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT events, signature, updated_at FROM planning_backups
                 WHERE planning_full_id = ?",
                [full_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((events_text, signature, updated_at)) => {
                let events: Vec<Event> = serde_json::from_str(&events_text)
                    .with_context(|| format!("corrupt backup for {}", full_id))?;
                Ok(Some(PlanningBackup {
                    planning_full_id: full_id.to_string(),
                    events,
                    signature,
                    updated_at: parse_rfc3339(&updated_at)?,
                }))
            }
        }
    }

    /// Writes the authoritative event set for a planning, unless the content
    /// signature already matches. Repeated upserts with identical content
    /// produce exactly one write, and `updated_at` only moves on real writes.
    pub fn upsert_backup(&self, full_id: &str, events: &[Event]) -> Result<BackupWrite> {
        let signature = events_signature(events)?;
        let events_text = serde_json::to_string(events)?;

        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT INTO planning_backups(planning_full_id, events, signature, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(planning_full_id) DO UPDATE SET
               events = excluded.events,
               signature = excluded.signature,
               updated_at = excluded.updated_at
             WHERE planning_backups.signature <> excluded.signature",
            params![full_id, events_text, signature, now_rfc3339()],
        )?;
        Ok(BackupWrite {
            written: n > 0,
            events: events.len(),
        })
    }

    pub fn delete_backup(&self, full_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM planning_backups WHERE planning_full_id = ?",
            [full_id],
        )?;
        Ok(n > 0)
    }

    /// Point-in-time cache coverage, recomputed on every call.
    pub fn backup_coverage(&self) -> Result<BackupStats> {
        let conn = self.conn()?;
        let now = Utc::now();

        let plannings_total: i64 =
            conn.query_row("SELECT COUNT(1) FROM plannings", [], |row| row.get(0))?;
        let backups_total: i64 =
            conn.query_row("SELECT COUNT(1) FROM planning_backups", [], |row| row.get(0))?;
        let missing: i64 = conn.query_row(
            "SELECT COUNT(1) FROM plannings p
             WHERE NOT EXISTS (SELECT 1 FROM planning_backups b
                               WHERE b.planning_full_id = p.full_id)",
            [],
            |row| row.get(0),
        )?;

        let mut stale = [0i64; 3];
        for (slot, hours) in [(0usize, 1i64), (1, 6), (2, 24)] {
            let threshold = to_rfc3339(now - Duration::hours(hours));
            stale[slot] = conn.query_row(
                "SELECT COUNT(1) FROM planning_backups WHERE updated_at < ?",
                [&threshold],
                |row| row.get(0),
            )?;
        }

        Ok(BackupStats {
            plannings_total,
            backups_total,
            missing,
            stale_over_1h: stale[0],
            stale_over_6h: stale[1],
            stale_over_24h: stale[2],
        })
    }

    pub async fn read_backup_async(&self, full_id: &str) -> Result<Option<PlanningBackup>> {
        let full_id = full_id.to_string();
        self.run_blocking(move |store| store.read_backup(&full_id))
            .await
    }

    pub async fn upsert_backup_async(&self, full_id: &str, events: Vec<Event>) -> Result<BackupWrite> {
        let full_id = full_id.to_string();
        self.run_blocking(move |store| store.upsert_backup(&full_id, &events))
            .await
    }

    pub async fn backup_coverage_async(&self) -> Result<BackupStats> {
        self.run_blocking(move |store| store.backup_coverage()).await
    }
}
