//! Operations on the persisted planning catalog (the `plannings` table)

use std::collections::HashSet;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use url::Url;

use super::{now_rfc3339, Store};
use crate::planning::Planning;

/// What a single catalog upsert did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanningUpsert {
    Created,
    /// One of `planning_id`, `title` or `url` differed from the stored row.
    Updated,
    /// The stored row already matched; `updated_at` was left untouched.
    Unchanged,
}

/// Counts for one full catalog application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatalogApply {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub pruned: usize,
}

impl Store {
    pub fn get_planning(&self, full_id: &str) -> Result<Option<Planning>> {
        let conn = self.conn()?;
        get_planning_on(&conn, full_id)
    }

    pub fn list_plannings(&self) -> Result<Vec<Planning>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT full_id, planning_id, title, url FROM plannings ORDER BY full_id")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(planning_from_row(
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
            )?);
        }
        Ok(out)
    }

    pub fn count_plannings(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(1) FROM plannings", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Inserts or updates one planning. `updated_at` is a write-audit field:
    /// it only advances when the row actually changed.
    pub fn upsert_planning(&self, planning: &Planning) -> Result<PlanningUpsert> {
        let conn = self.conn()?;
        upsert_planning_on(&conn, planning)
    }

    /// Removes a planning; its backup and queue row go with it.
    pub fn delete_planning(&self, full_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM plannings WHERE full_id = ?", [full_id])?;
        Ok(n > 0)
    }

    /// Applies a deduplicated catalog in one transaction: upserts every
    /// listed planning and prunes every persisted row the catalog no longer
    /// contains. An empty catalog clears the table.
    pub fn apply_catalog(&self, catalog: &[Planning]) -> Result<CatalogApply> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut outcome = CatalogApply::default();
        let mut kept: HashSet<&str> = HashSet::with_capacity(catalog.len());
        for planning in catalog {
            kept.insert(planning.full_id.as_str());
            match upsert_planning_on(&tx, planning)? {
                PlanningUpsert::Created => outcome.created += 1,
                PlanningUpsert::Updated => outcome.updated += 1,
                PlanningUpsert::Unchanged => outcome.unchanged += 1,
            }
        }

        let persisted: Vec<String> = {
            let mut stmt = tx.prepare("SELECT full_id FROM plannings")?;
            let mut rows = stmt.query([])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(row.get::<_, String>(0)?);
            }
            ids
        };
        for full_id in persisted {
            if kept.contains(full_id.as_str()) == false {
                tx.execute("DELETE FROM plannings WHERE full_id = ?", [&full_id])?;
                outcome.pruned += 1;
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    pub async fn get_planning_async(&self, full_id: &str) -> Result<Option<Planning>> {
        let full_id = full_id.to_string();
        self.run_blocking(move |store| store.get_planning(&full_id))
            .await
    }

    pub async fn list_plannings_async(&self) -> Result<Vec<Planning>> {
        self.run_blocking(move |store| store.list_plannings()).await
    }

    pub async fn apply_catalog_async(&self, catalog: Vec<Planning>) -> Result<CatalogApply> {
        self.run_blocking(move |store| store.apply_catalog(&catalog))
            .await
    }
}

fn get_planning_on(conn: &Connection, full_id: &str) -> Result<Option<Planning>> {
    let row = conn
        .query_row(
            "SELECT full_id, planning_id, title, url FROM plannings WHERE full_id = ?",
            [full_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;
    match row {
        None => Ok(None),
        Some((full_id, planning_id, title, url)) => {
            Ok(Some(planning_from_row(full_id, planning_id, title, url)?))
        }
    }
}

fn upsert_planning_on(conn: &Connection, planning: &Planning) -> Result<PlanningUpsert> {
    let stored = conn
        .query_row(
            "SELECT planning_id, title, url FROM plannings WHERE full_id = ?",
            [&planning.full_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    let url_text = planning.url.as_ref().map(|u| u.to_string());
    match stored {
        None => {
            conn.execute(
                "INSERT INTO plannings(full_id, planning_id, title, url, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    planning.full_id,
                    planning.planning_id,
                    planning.title,
                    url_text,
                    now_rfc3339()
                ],
            )?;
            Ok(PlanningUpsert::Created)
        }
        Some((planning_id, title, url)) => {
            if planning_id == planning.planning_id && title == planning.title && url == url_text {
                return Ok(PlanningUpsert::Unchanged);
            }
            conn.execute(
                "UPDATE plannings SET planning_id = ?, title = ?, url = ?, updated_at = ?
                 WHERE full_id = ?",
                params![
                    planning.planning_id,
                    planning.title,
                    url_text,
                    now_rfc3339(),
                    planning.full_id
                ],
            )?;
            Ok(PlanningUpsert::Updated)
        }
    }
}

fn planning_from_row(
    full_id: String,
    planning_id: String,
    title: String,
    url: Option<String>,
) -> Result<Planning> {
    let url = match url {
        None => None,
        Some(text) => Some(Url::parse(&text)?),
    };
    Ok(Planning {
        full_id,
        planning_id,
        title,
        url,
    })
}
