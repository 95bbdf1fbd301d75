//! Tracking API client
//!
//! Pending records are delivered one per request:
//!
//! - customer updates: `POST {base_url}/track/v2/projects/{token}/customers`
//! - events: `POST {base_url}/track/v2/projects/{token}/customers/events`
//! - campaign clicks: `POST {base_url}/track/v2/projects/{token}/campaigns/clicks`
//!
//! The [`TrackingRepository`] trait is the seam the flushing manager sends
//! through, so tests can script responses without a server.

mod client;
mod payload;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::types::PendingRecord;

pub use client::TrackingClient;
pub use payload::{request_body, AgePolicy, Route};

/// Delivers a single pending record.
///
/// Each call resolves exactly once, on the task that awaits it.
#[async_trait]
pub trait TrackingRepository: Send + Sync {
    async fn send(&self, record: &PendingRecord) -> Result<(), DeliveryError>;
}
