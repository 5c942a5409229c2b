//! The data model: plannings (calendar sources) and the events they contain

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// One addressable calendar source, i.e. a leaf of the flattened catalog.
///
/// `full_id` is the stable identity of a planning: backups and refresh
/// requests are keyed on it, and it survives catalog edits. `planning_id` is
/// a logical grouping id that may repeat across plannings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Planning {
    pub full_id: String,
    pub planning_id: String,
    pub title: String,
    /// The upstream ICS source. `None` for plannings that have no network
    /// counterpart (e.g. aggregate or placeholder entries).
    pub url: Option<Url>,
}

impl Planning {
    pub fn new(full_id: &str, planning_id: &str, title: &str, url: Option<Url>) -> Self {
        Self {
            full_id: full_id.to_string(),
            planning_id: planning_id.to_string(),
            title: title.to_string(),
            url,
        }
    }
}

/// One calendar occurrence, as parsed from an upstream feed.
///
/// Events only live inside the backup of the planning they were fetched for;
/// they have no identity of their own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub uid: String,
    pub summary: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub location: String,
    pub description: String,
}

/// The cached last-known-good event set for one planning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningBackup {
    pub planning_full_id: String,
    pub events: Vec<Event>,
    /// Content fingerprint of `events`, used for change detection.
    pub signature: String,
    /// Advanced only when an upsert actually changed the content.
    pub updated_at: DateTime<Utc>,
}
