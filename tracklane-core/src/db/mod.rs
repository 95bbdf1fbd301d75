//! Database layer for tracklane
//!
//! This module provides the durable pending record store using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - The single-row customer identity records are attributed to

pub mod repo;
pub mod schema;

pub use repo::Database;
