//! Signed CRM webhook ingestion and dispatch.
//!
//! The receiver verifies, normalizes and deduplicates inbound deliveries and
//! parks them on a bounded shared queue. A pool of workers drains the queue
//! into an [`EventApplier`](dispatch::EventApplier), retrying with capped
//! exponential backoff and dead-lettering events that never succeed. Any
//! number of processes can share one coordination store.

pub mod config;
pub mod coordination;
pub mod dispatch;
pub mod http_server;
pub mod logging;
pub mod metrics;
pub mod normalize;
pub mod registration;
pub mod types;
pub mod verification;
