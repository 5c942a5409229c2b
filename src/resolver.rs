//! Deciding, per request, whether events come from the network or the cache
//!
//! The resolver is the entry point for live requests. It makes one bounded
//! fetch attempt (at most a couple in flight per planning, however many
//! clients ask), falls back to the stored backup when the upstream
//! misbehaves, and schedules a background refresh so a stale cache gets
//! corrected soon. A fetch failure is never surfaced as an error to the
//! caller: the caller always gets a best-effort answer plus a reason code
//! explaining any degradation.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RefreshConfig;
use crate::fetcher::{EventFetcher, FetchFailure};
use crate::limiter::KeyedLimiter;
use crate::planning::{Event, Planning};
use crate::store::Store;

/// Where the events in a [`Resolution`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Network,
    Db,
    None,
}

impl Display for EventSource {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            EventSource::Network => write!(f, "network"),
            EventSource::Db => write!(f, "db"),
            EventSource::None => write!(f, "none"),
        }
    }
}

/// Why the caller got what it got. Fully determined by the source, whether
/// events are present, and whether the network failed; no hidden state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveReason {
    Ok,
    NetworkErrorFallbackDb,
    NetworkErrorNoCache,
    DbNotFound,
}

/// The best-effort answer for one planning request.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub events: Option<Vec<Event>>,
    pub source: EventSource,
    pub reason: ResolveReason,
    /// When the returned data was authoritative: the request time for
    /// network answers, the backup's write time for cache answers, absent
    /// when there is no data. Clients use this for staleness display, so the
    /// three cases are deliberately not collapsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_updated_at: Option<DateTime<Utc>>,
    pub network_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_failure: Option<FetchFailure>,
}

/// Orchestrates fetch, fallback and refresh scheduling for one deployment.
///
/// One resolver instance is shared by the request handlers and the
/// background workers, so they also share its per-planning admission table.
pub struct EventResolver {
    store: Store,
    fetcher: Arc<dyn EventFetcher>,
    limiter: KeyedLimiter,
    config: RefreshConfig,
}

impl EventResolver {
    pub fn new(store: Store, fetcher: Arc<dyn EventFetcher>, config: RefreshConfig) -> Self {
        let limiter = KeyedLimiter::new(config.per_planning_fetches);
        Self {
            store,
            fetcher,
            limiter,
            config,
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Answers a request for a planning's events.
    ///
    /// With `only_db` the network is not touched at all. Otherwise one fetch
    /// attempt is made; on success the fresh events are authoritative and are
    /// written through to the backup in the background, on failure the
    /// backup (if any) is served and a refresh is queued when retrying can
    /// help. Plannings without an upstream URL behave like `only_db`.
    ///
    /// Errors are only returned for store-level problems, never for fetch
    /// failures.
    pub async fn resolve_events(&self, planning: &Planning, only_db: bool) -> Result<Resolution> {
        if only_db || planning.url.is_none() {
            return self.resolve_from_backup(planning, None).await;
        }

        match self.fetch_guarded(planning).await {
            Ok(events) => {
                self.spawn_write_through(planning, events.clone());
                Ok(Resolution {
                    events: Some(events),
                    source: EventSource::Network,
                    reason: ResolveReason::Ok,
                    refreshed_at: Some(Utc::now()),
                    backup_updated_at: None,
                    network_failed: false,
                    network_failure: None,
                })
            }
            Err(failure) => {
                log::info!(
                    "Fetch failed for planning {} ({}), falling back to the backup",
                    planning.full_id,
                    failure
                );
                if failure.is_transient() {
                    // Best effort: a failed enqueue must not break the answer
                    if let Err(err) = self
                        .store
                        .enqueue_refresh_async(&planning.full_id, self.config.enqueue_priority)
                        .await
                    {
                        log::warn!(
                            "Unable to queue a refresh for {}: {}",
                            planning.full_id,
                            err
                        );
                    }
                }
                self.resolve_from_backup(planning, Some(failure)).await
            }
        }
    }

    /// One admission-controlled, time-bounded fetch attempt.
    ///
    /// This is the single fetch primitive of the crate: live requests and
    /// background workers both go through it, so the per-planning bound
    /// holds across all of them. Callers must only pass plannings that have
    /// a URL.
    pub async fn fetch_guarded(&self, planning: &Planning) -> Result<Vec<Event>, FetchFailure> {
        let url = match &planning.url {
            Some(url) => url.clone(),
            None => {
                return Err(FetchFailure::NetworkError {
                    detail: format!("planning {} has no upstream URL", planning.full_id),
                })
            }
        };

        let _permit = self.limiter.acquire(&planning.full_id).await;
        match tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch_events(&url))
            .await
        {
            Err(_elapsed) => Err(FetchFailure::Timeout),
            Ok(result) => result,
        }
    }

    async fn resolve_from_backup(
        &self,
        planning: &Planning,
        failure: Option<FetchFailure>,
    ) -> Result<Resolution> {
        let backup = self.store.read_backup_async(&planning.full_id).await?;
        let network_failed = failure.is_some();

        Ok(match backup {
            Some(backup) => Resolution {
                events: Some(backup.events),
                source: EventSource::Db,
                reason: if network_failed {
                    ResolveReason::NetworkErrorFallbackDb
                } else {
                    ResolveReason::Ok
                },
                refreshed_at: Some(backup.updated_at),
                backup_updated_at: Some(backup.updated_at),
                network_failed,
                network_failure: failure,
            },
            None => Resolution {
                events: None,
                source: EventSource::None,
                reason: if network_failed {
                    ResolveReason::NetworkErrorNoCache
                } else {
                    ResolveReason::DbNotFound
                },
                refreshed_at: None,
                backup_updated_at: None,
                network_failed,
                network_failure: failure,
            },
        })
    }

    /// Persists freshly fetched events outside the request path. The caller
    /// already has its answer; a failed write only costs cache freshness, so
    /// it is logged and dropped.
    fn spawn_write_through(&self, planning: &Planning, events: Vec<Event>) {
        let store = self.store.clone();
        let full_id = planning.full_id.clone();
        tokio::spawn(async move {
            match store.upsert_backup_async(&full_id, events).await {
                Ok(write) if write.written => {
                    log::debug!("Backed up {} events for planning {}", write.events, full_id);
                }
                Ok(_) => {
                    log::debug!("Backup for planning {} already up to date", full_id);
                }
                Err(err) => {
                    log::warn!("Unable to back up events for planning {}: {}", full_id, err);
                }
            }
        });
    }
}
