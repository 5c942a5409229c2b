//! Reconciling the static planning catalog with the persisted table
//!
//! The catalog is authored by hand and shipped with the application; the
//! `plannings` table is what the rest of this crate works against. On every
//! startup (and periodically) the two are reconciled: the flattened catalog
//! wins, duplicates introduced by authoring mistakes are dropped
//! deterministically, and rows the catalog no longer mentions are pruned
//! together with their backups and queue rows.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use serde::Serialize;

use crate::planning::Planning;
use crate::store::Store;

/// How many occurrences of the same duplicated `full_id` are kept for
/// diagnostics. Catalogs with a copy-pasted subtree can produce hundreds of
/// duplicates per key; the report should stay readable.
pub const DUPLICATE_EXAMPLES_CAP: usize = 3;

/// One discarded duplicate occurrence, for the report.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateExample {
    pub planning_id: String,
    pub title: String,
    pub url: Option<String>,
}

/// What one reconciliation pass did.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub pruned: usize,
    /// Total duplicate occurrences discarded, across all keys.
    pub duplicate_total: usize,
    /// Discarded occurrences per duplicated key, capped to
    /// [`DUPLICATE_EXAMPLES_CAP`] examples each.
    pub duplicates: BTreeMap<String, Vec<DuplicateExample>>,
}

/// Deduplicates by `full_id`, keeping the first occurrence in catalog order.
fn dedup_catalog(catalog: &[Planning]) -> (Vec<Planning>, SyncReport) {
    let mut report = SyncReport::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(catalog.len());
    let mut unique = Vec::with_capacity(catalog.len());

    for planning in catalog {
        if seen.insert(planning.full_id.as_str()) {
            unique.push(planning.clone());
            continue;
        }

        report.duplicate_total += 1;
        let example = DuplicateExample {
            planning_id: planning.planning_id.clone(),
            title: planning.title.clone(),
            url: planning.url.as_ref().map(|u| u.to_string()),
        };
        match report.duplicates.entry(planning.full_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(vec![example]);
            }
            Entry::Occupied(mut slot) => {
                if slot.get().len() < DUPLICATE_EXAMPLES_CAP {
                    slot.get_mut().push(example);
                }
            }
        }
    }

    (unique, report)
}

/// Brings the persisted planning table in line with the catalog.
///
/// An empty catalog is a valid input and clears the table; running the same
/// catalog twice is a no-op the second time.
pub async fn reconcile_plannings(store: &Store, catalog: &[Planning]) -> Result<SyncReport> {
    let (unique, mut report) = dedup_catalog(catalog);

    for (full_id, examples) in &report.duplicates {
        log::warn!(
            "Catalog contains duplicate planning id {} ({} shown): {:?}",
            full_id,
            examples.len(),
            examples
        );
    }

    let outcome = store.apply_catalog_async(unique).await?;
    report.created = outcome.created;
    report.updated = outcome.updated;
    report.unchanged = outcome.unchanged;
    report.pruned = outcome.pruned;

    log::info!(
        "Planning sync: {} created, {} updated, {} unchanged, {} pruned, {} duplicates discarded",
        report.created,
        report.updated,
        report.unchanged,
        report.pruned,
        report.duplicate_total
    );
    Ok(report)
}
