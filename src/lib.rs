//! This crate is the refresh-and-cache core of a university calendar
//! aggregator.
//!
//! Upstream planning servers are slow and flaky, so clients are never served
//! from them directly. A request goes through the [`EventResolver`]: it makes
//! at most one bounded fetch attempt, falls back to the persisted backup when
//! the upstream misbehaves, and queues a background refresh so the stale copy
//! gets corrected soon. The [`store`] module is the single source of truth
//! (catalog, backups and refresh queue, all in sqlite); the [`worker`] module
//! hosts the background sweeps that keep backups eventually fresh; the
//! [`sync`] module reconciles the hand-authored catalog with the persisted
//! table on startup.
//!
//! Routing, authentication and ICS parsing are deliberately not here: the
//! integrating application provides the catalog and an [`EventFetcher`]
//! (or a parser for the stock [`HttpFetcher`]).

pub mod config;
pub mod planning;
pub mod store;
pub mod limiter;
pub mod fetcher;
pub mod resolver;
pub mod sync;
pub mod worker;
pub mod status;
pub mod mocking;

pub use config::{BackoffPolicy, ParseErrorPolicy, RefreshConfig};
pub use fetcher::{EventFetcher, FetchFailure, HttpFetcher};
pub use limiter::KeyedLimiter;
pub use planning::{Event, Planning, PlanningBackup};
pub use resolver::{EventResolver, EventSource, Resolution, ResolveReason};
pub use status::{health_snapshot, HealthSnapshot};
pub use store::Store;
pub use sync::{reconcile_plannings, SyncReport};
pub use worker::{drain_refresh_queue, run_plannings_backup, run_refresh_loop};
