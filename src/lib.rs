//! Package movement scan engine.
//!
//! Warehouse terminals scan packages in and out of branches. For each scan this
//! crate classifies the barcode into a tracking family, keeps every batch to a
//! single family, demands a supervisor grant before external-express shipments
//! move, and records the movement atomically: package status, audit event,
//! grant consumption and the branch's daily counters commit together or not at
//! all. Intake of an external-express shipment also produces a domestic label
//! through the printing bridge.
//!
//! Storage is pluggable through [`Storage`]: [`InMemoryStorage`] for tests and
//! single-node use, PostgreSQL behind the `postgres` feature.

pub mod api;
pub mod config;
pub mod directory;
pub mod domain;
pub mod engine;
pub mod error;
pub mod label;
pub mod manager;
pub mod metrics;
pub mod stats;
pub mod telemetry;

// Re-export commonly used types
pub use config::{AppConfig, EngineConfig, ServerConfig};
pub use directory::{BranchDirectory, DirectoryConfig, StaticDirectory};
pub use domain::scan::{ExpressIntakeDetails, ScanEvent, ScanRequest};
pub use domain::session::{ScanMode, ScanSession, SessionId};
pub use domain::tracking::{TrackingCode, TrackingFamily, classify};
pub use engine::{AuthorizeRequest, OpenSessionRequest, ScanEngine, ScanReceipt};
pub use error::{ErrorKind, Result, ScanError};
pub use label::{LabelDispatchNotifier, LabelPrinter, MockLabelPrinter, ReqwestLabelPrinter};
pub use manager::Storage;
pub use manager::memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use manager::postgres::PostgresScanStorage;
pub use stats::DailyStatsAggregator;

/// Get the scan engine database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
