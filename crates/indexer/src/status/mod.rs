//! Status service: reconciles what the archiver reports with what has been
//! verified in Elasticsearch.
//!
//! [sync::VerificationSync] walks the archiver's tick intervals and advances a
//! durable cursor once Elasticsearch holds every transaction of a tick.
//! [service::StatusService] serves that cursor, the reconciled tick intervals
//! and an archiver-compatible status derived from them, each behind a short
//! TTL cache.

pub mod cache;
pub mod reconcile;
pub mod routes;
pub mod service;
pub mod sync;

pub use reconcile::{derive_status, reconcile_intervals, skipped_ticks, DerivedStatus, SkippedTicksInterval};
pub use routes::{router, StatusState};
pub use service::{ProcessingStatus, StatusError, StatusService};
pub use sync::{run_sync, SyncError, VerificationSync};
