//! sitrep-core: the incident state-synchronization engine.
//!
//! Keeps a client-held view of incident records consistent across an initial
//! filtered bulk read, a push-based change feed and optimistic status
//! transitions racing their writes.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` at the ports; typed `thiserror` errors for
//!   request validation, each mapped to a stable [`error::ErrorCode`].
//! - **Logging**: `tracing` macros (`debug!` per reconciled event, `info!` for
//!   lifecycle, `warn!` for recovered failures).

pub mod aggregate;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod model;
pub mod ports;
pub mod query;
pub mod reconcile;
pub mod transition;
pub mod view;

pub use view::IncidentView;
