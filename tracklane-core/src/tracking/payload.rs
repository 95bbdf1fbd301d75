//! Request routes and bodies for the tracking API

use std::collections::HashSet;

use serde_json::json;

use crate::types::{JsonValue, PendingRecord, RecordKind, CAMPAIGN_CLICK_EVENT};

/// Tracking API endpoint a record is posted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Customer updates
    Identify,
    /// Every event except campaign clicks
    TrackEvent,
    /// `campaign_click` events
    CampaignClick,
}

impl Route {
    pub fn for_record(record: &PendingRecord) -> Self {
        match record.kind {
            RecordKind::CustomerUpdate => Route::Identify,
            RecordKind::Event if record.event_type.as_deref() == Some(CAMPAIGN_CLICK_EVENT) => {
                Route::CampaignClick
            }
            RecordKind::Event => Route::TrackEvent,
        }
    }

    /// Full request URL under `base_url`
    pub fn url(&self, base_url: &str, project_token: &str) -> String {
        let suffix = match self {
            Route::Identify => "customers",
            Route::TrackEvent => "customers/events",
            Route::CampaignClick => "campaigns/clicks",
        };
        format!(
            "{}/track/v2/projects/{}/{}",
            base_url.trim_end_matches('/'),
            urlencoding::encode(project_token),
            suffix
        )
    }
}

/// Per event-type choice between an absolute `timestamp` and a relative `age`.
///
/// Types not listed send `timestamp`.
#[derive(Debug, Clone, Default)]
pub struct AgePolicy {
    age_event_types: HashSet<String>,
}

impl AgePolicy {
    pub fn new<I, S>(age_event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            age_event_types: age_event_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn sends_age(&self, event_type: Option<&str>) -> bool {
        event_type.is_some_and(|t| self.age_event_types.contains(t))
    }
}

/// Build the JSON body for a record. `now` is only consulted for `age`.
pub fn request_body(record: &PendingRecord, policy: &AgePolicy, now: f64) -> JsonValue {
    let mut body = serde_json::Map::new();

    body.insert("customer_ids".to_string(), json!(record.customer_ids));

    let event_type = record.event_type.as_deref();
    if policy.sends_age(event_type) {
        body.insert("age".to_string(), json!((now - record.timestamp).max(0.0)));
    } else {
        body.insert("timestamp".to_string(), json!(record.timestamp));
    }

    match Route::for_record(record) {
        Route::CampaignClick => {
            for key in ["url", "properties"] {
                if let Some(value) = record.properties.get(key) {
                    body.insert(key.to_string(), value.clone());
                }
            }
        }
        Route::Identify | Route::TrackEvent => {
            body.insert(
                "properties".to_string(),
                JsonValue::Object(record.properties.clone()),
            );
        }
    }

    if record.kind == RecordKind::Event {
        if let Some(event_type) = event_type {
            body.insert("event_type".to_string(), json!(event_type));
        }
    }

    body.retain(|_, value| !value.is_null());
    JsonValue::Object(body)
}
