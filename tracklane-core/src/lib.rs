//! # tracklane-core
//!
//! Core library for tracklane - durable event tracking with deferred delivery.
//!
//! This library provides:
//! - Domain types for customer updates, events, and pending records
//! - Durable pending record store with SQLite
//! - Tracking API client with response classification
//! - Flushing manager with retry policy and flush scheduling
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Records flow through three stages:
//! - **Track:** public API calls fold data records into a pending record and
//!   persist it before returning
//! - **Flush:** the flushing manager snapshots the store and sends every
//!   record, customer updates first
//! - **Resolve:** delivered and permanently rejected records are deleted,
//!   transient failures stay queued for the next flush
//!
//! ## Example
//!
//! ```rust,no_run
//! use tracklane_core::{Config, Properties, Tracker};
//!
//! # async fn run() -> tracklane_core::Result<()> {
//! let config = Config::load()?;
//! let tracker = Tracker::configure(config)?;
//!
//! tracker.track_event("app_open", Properties::new(), None)?;
//! let result = tracker.flush().await;
//! println!("{:?}", result);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{DeliveryError, Error, Result, StorageError};
pub use flushing::FlushingManager;
pub use reachability::{HostReachability, Reachability, StaticReachability};
pub use sdk::Tracker;
pub use tracking::{TrackingClient, TrackingRepository};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod flushing;
pub mod logging;
pub mod reachability;
pub mod sdk;
pub mod tracking;
pub mod types;
