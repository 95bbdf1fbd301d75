//! Domain types for tracklane
//!
//! These types represent the pending records that make up the local tracking
//! queue, and the small vocabulary shared by the store, the tracking client,
//! and the flushing manager.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// JSON-compatible property value (string, number, bool, array, map, null).
pub type JsonValue = serde_json::Value;

/// Property bag attached to a record.
pub type Properties = serde_json::Map<String, JsonValue>;

/// External customer identifiers, e.g. `cookie` or `registered`.
pub type CustomerIds = BTreeMap<String, String>;

/// Event type sent to the campaign-click endpoint.
pub const CAMPAIGN_CLICK_EVENT: &str = "campaign_click";

/// Key of the customer identifier minted locally for anonymous customers.
pub const COOKIE_ID: &str = "cookie";

// ============================================
// Input data records
// ============================================

/// One piece of trackable information supplied to the store.
///
/// A pending record is built by folding a list of these in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DataRecord {
    /// Target project token
    ProjectToken(String),
    /// Customer identifiers to associate with the current customer
    CustomerIds(CustomerIds),
    /// Properties to merge into the record, later keys win
    Properties(Properties),
    /// UNIX seconds; `None` means "assign at write time"
    Timestamp(Option<f64>),
    /// Event name, required for events
    EventType(String),
    /// Push notification token registration
    PushToken {
        token: Option<String>,
        authorized: bool,
    },
}

// ============================================
// Persisted records
// ============================================

/// Opaque store-assigned record identifier.
///
/// Identifiers are never reused and increase with insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which queue a pending record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Associates properties with the customer identity
    CustomerUpdate,
    /// Timestamped occurrence with a type
    Event,
}

impl RecordKind {
    /// Returns the string representation stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::CustomerUpdate => "customer_update",
            RecordKind::Event => "event",
        }
    }

    /// Parse from database string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "customer_update" => Some(RecordKind::CustomerUpdate),
            "event" => Some(RecordKind::Event),
            _ => None,
        }
    }
}

/// A record waiting to be delivered to the tracking API.
///
/// Once persisted, only `retries` ever changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    /// Required for events, `None` for customer updates
    pub event_type: Option<String>,
    pub project_token: String,
    /// Project base URL at creation time; `None` falls back to the configured one
    pub base_url: Option<String>,
    /// Authorization at creation time; `None` falls back to the configured one
    pub authorization: Option<Authorization>,
    /// Customer identity frozen at creation time
    pub customer_ids: CustomerIds,
    pub properties: Properties,
    /// UNIX seconds
    pub timestamp: f64,
    pub retries: u32,
}

impl PendingRecord {
    /// Lightweight handle the flushing manager keeps while a send is in flight.
    pub fn proxy(&self) -> RecordProxy {
        RecordProxy {
            id: self.id,
            retries: self.retries,
        }
    }

    /// False when the record addresses no customer and cannot be delivered.
    pub fn has_customer(&self) -> bool {
        self.customer_ids.values().any(|v| !v.is_empty())
    }

    pub fn is_customer_update(&self) -> bool {
        self.kind == RecordKind::CustomerUpdate
    }
}

/// Reference to a persisted record: its id and the retry count seen at fetch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordProxy {
    pub id: RecordId,
    pub retries: u32,
}

/// Record fields folded from a list of [`DataRecord`]s, before persistence.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RecordDraft {
    pub project_token: Option<String>,
    pub event_type: Option<String>,
    pub customer_ids: CustomerIds,
    pub properties: Properties,
    pub timestamp: Option<f64>,
    pub push_token: Option<Option<String>>,
}

impl RecordDraft {
    /// Fold data records in order. Later properties win on key conflicts.
    pub fn fold(records: &[DataRecord]) -> Self {
        let mut draft = RecordDraft::default();
        for record in records {
            match record {
                DataRecord::ProjectToken(token) => draft.project_token = Some(token.clone()),
                DataRecord::CustomerIds(ids) => {
                    draft
                        .customer_ids
                        .extend(ids.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                DataRecord::Properties(props) => {
                    for (key, value) in props {
                        draft.properties.insert(key.clone(), value.clone());
                    }
                }
                DataRecord::Timestamp(ts) => {
                    if ts.is_some() {
                        draft.timestamp = *ts;
                    }
                }
                DataRecord::EventType(event_type) => draft.event_type = Some(event_type.clone()),
                DataRecord::PushToken { token, authorized } => {
                    draft.properties.insert(
                        "apple_push_notification_id".to_string(),
                        JsonValue::String(token.clone().unwrap_or_default()),
                    );
                    draft.properties.insert(
                        "apple_push_notification_authorized".to_string(),
                        JsonValue::Bool(*authorized),
                    );
                    draft.push_token = Some(token.clone());
                }
            }
        }
        draft
    }

    /// Check the fields the given kind cannot be persisted without.
    pub fn validate(&self, kind: RecordKind) -> Result<(), StorageError> {
        match &self.project_token {
            Some(token) if !token.is_empty() => {}
            _ => return Err(StorageError::MissingRequiredField("project_token")),
        }
        if kind == RecordKind::Event {
            match &self.event_type {
                Some(event_type) if !event_type.is_empty() => {}
                _ => return Err(StorageError::MissingRequiredField("event_type")),
            }
        }
        Ok(())
    }
}

// ============================================
// Projects
// ============================================

/// Authorization header sent with tracking requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Authorization {
    #[default]
    None,
    /// `Authorization: Token {token}`
    Token(String),
    /// `Authorization: Bearer {token}`
    Bearer(String),
}

impl Authorization {
    /// Header value, if any
    pub fn header_value(&self) -> Option<String> {
        match self {
            Authorization::None => None,
            Authorization::Token(token) => Some(format!("Token {}", token)),
            Authorization::Bearer(token) => Some(format!("Bearer {}", token)),
        }
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.header_value() {
            Some(value) => write!(f, "{}", value),
            None => Ok(()),
        }
    }
}

impl FromStr for Authorization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Authorization::None);
        }
        match s.split_once(' ') {
            Some(("Token", token)) if !token.trim().is_empty() => {
                Ok(Authorization::Token(token.trim().to_string()))
            }
            Some(("Bearer", token)) if !token.trim().is_empty() => {
                Ok(Authorization::Bearer(token.trim().to_string()))
            }
            _ => Err(format!(
                "authorization must be \"Token <token>\" or \"Bearer <token>\", got {:?}",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Authorization {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a record is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub base_url: String,
    pub project_token: String,
    pub authorization: Authorization,
}

impl Project {
    /// Resolve the delivery target of a record, filling gaps from `default`.
    pub fn for_record(record: &PendingRecord, default: &Project) -> Project {
        Project {
            base_url: record
                .base_url
                .clone()
                .unwrap_or_else(|| default.base_url.clone()),
            project_token: record.project_token.clone(),
            authorization: record
                .authorization
                .clone()
                .unwrap_or_else(|| default.authorization.clone()),
        }
    }
}

// ============================================
// Flushing
// ============================================

/// How and when pending records are flushed automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushingMode {
    /// Only explicit flush calls
    Manual,
    /// Shortly after every tracking call
    #[default]
    Immediate,
    /// Every n seconds while the application is in the foreground
    Periodic(u64),
}

impl FlushingMode {
    /// Timer period for periodic mode
    pub fn period(&self) -> Option<Duration> {
        match self {
            FlushingMode::Periodic(secs) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

impl fmt::Display for FlushingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushingMode::Manual => write!(f, "manual"),
            FlushingMode::Immediate => write!(f, "immediate"),
            FlushingMode::Periodic(secs) => write!(f, "periodic ({}s)", secs),
        }
    }
}

/// Aggregate outcome reported to the caller of a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushResult {
    /// All records in the snapshot were resolved (delivered, kept, or discarded)
    Success(usize),
    /// Another flush holds the lock
    AlreadyInProgress,
    /// Reachability reported no connection
    NoConnection,
    /// Reading the store failed; nothing was touched
    Error(StorageError),
}

/// Current UNIX time in seconds with sub-second precision.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
