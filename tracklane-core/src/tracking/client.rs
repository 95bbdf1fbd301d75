//! HTTP client for the tracking API
//!
//! Posts one pending record per request and classifies the response into
//! the [`DeliveryError`] classes the flushing manager resolves records by.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use crate::error::{DeliveryError, Error, ErrorResponse, MultipleErrorResponse, Result};
use crate::types::{now_secs, PendingRecord, Project};

use super::payload::{request_body, AgePolicy, Route};
use super::TrackingRepository;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// `reqwest` implementation of [`TrackingRepository`]
pub struct TrackingClient {
    http_client: reqwest::Client,
    /// Target for records stored without their own base URL or authorization
    default_project: Project,
    age_policy: AgePolicy,
}

impl TrackingClient {
    /// Create a new tracking client
    ///
    /// Requests time out after `timeout`; a timeout is reported as a
    /// connection failure.
    pub fn new(default_project: Project, timeout: Duration, age_policy: AgePolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_CONTENT_TYPE));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            default_project,
            age_policy,
        })
    }
}

#[async_trait]
impl TrackingRepository for TrackingClient {
    async fn send(&self, record: &PendingRecord) -> std::result::Result<(), DeliveryError> {
        let project = Project::for_record(record, &self.default_project);
        let route = Route::for_record(record);
        let url = route.url(&project.base_url, &project.project_token);

        let body = serde_json::to_vec(&request_body(record, &self.age_policy, now_secs()))
            .map_err(|e| DeliveryError::BadRequest(format!("failed to encode body: {}", e)))?;

        let mut request = self
            .http_client
            .post(&url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(body);
        if let Some(value) = project.authorization.header_value() {
            request = request.header(AUTHORIZATION, value);
        }

        tracing::trace!(record_id = %record.id, url = %url, "Sending record");

        let response = match request.send().await {
            Ok(response) => response,
            // A request that cannot be built will never succeed
            Err(e) if e.is_builder() => return Err(DeliveryError::BadRequest(e.to_string())),
            Err(e) => return Err(DeliveryError::Connection(e.to_string())),
        };

        classify(response).await
    }
}

/// Map an HTTP response onto the delivery outcome.
///
/// 402 and 403 fall through to success along with every other code not
/// listed here.
async fn classify(response: reqwest::Response) -> std::result::Result<(), DeliveryError> {
    let status = response.status().as_u16();
    match status {
        401 => {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::NotAuthorized(
                serde_json::from_str::<ErrorResponse>(&body).ok(),
            ))
        }
        404 => {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::NotFound(
                serde_json::from_str::<MultipleErrorResponse>(&body).ok(),
            ))
        }
        400 | 405..=499 => {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(DeliveryError::BadRequest(body))
        }
        500..=599 => {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Server(
                serde_json::from_str::<MultipleErrorResponse>(&body).ok(),
            ))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Authorization, CustomerIds, RecordId, RecordKind};
    use httpmock::prelude::*;
    use serde_json::json;

    fn project(base_url: &str) -> Project {
        Project {
            base_url: base_url.to_string(),
            project_token: "token".to_string(),
            authorization: Authorization::Token("secret".to_string()),
        }
    }

    fn client(base_url: &str) -> TrackingClient {
        TrackingClient::new(project(base_url), Duration::from_secs(5), AgePolicy::default())
            .unwrap()
    }

    fn event(event_type: &str) -> PendingRecord {
        let mut customer_ids = CustomerIds::new();
        customer_ids.insert("cookie".to_string(), "abc".to_string());
        PendingRecord {
            id: RecordId(7),
            kind: RecordKind::Event,
            event_type: Some(event_type.to_string()),
            project_token: "token".to_string(),
            base_url: None,
            authorization: None,
            customer_ids,
            properties: json!({"price": 10}).as_object().cloned().unwrap(),
            timestamp: 1_700_000_000.0,
            retries: 0,
        }
    }

    #[tokio::test]
    async fn test_send_event_request_shape() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/track/v2/projects/token/customers/events")
                    .header("content-type", "application/json; charset=utf-8")
                    .header("accept", "application/json; charset=utf-8")
                    .header("authorization", "Token secret")
                    .json_body(json!({
                        "customer_ids": {"cookie": "abc"},
                        "properties": {"price": 10},
                        "timestamp": 1_700_000_000.0,
                        "event_type": "purchase"
                    }));
                then.status(200);
            })
            .await;

        client(&server.base_url())
            .send(&event("purchase"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_record_target_overrides_default() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/track/v2/projects/mirror/customers/events")
                    .header("authorization", "Bearer other");
                then.status(200);
            })
            .await;

        let mut record = event("purchase");
        record.project_token = "mirror".to_string();
        record.base_url = Some(server.base_url());
        record.authorization = Some(Authorization::Bearer("other".to_string()));

        client("http://127.0.0.1:1").send(&record).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_response_classification() {
        let cases: Vec<(u16, &str, fn(&DeliveryError) -> bool)> = vec![
            (400, "missing field", |e| {
                matches!(e, DeliveryError::BadRequest(body) if body == "missing field")
            }),
            (418, "teapot", |e| matches!(e, DeliveryError::BadRequest(_))),
            (401, r#"{"error":"bad token"}"#, |e| {
                matches!(e, DeliveryError::NotAuthorized(Some(r)) if r.error == "bad token")
            }),
            (404, r#"{"errors":[{"code":"x","description":"gone"}]}"#, |e| {
                matches!(e, DeliveryError::NotFound(Some(r)) if r.errors.len() == 1)
            }),
            (500, "not json", |e| matches!(e, DeliveryError::Server(None))),
            (503, r#"{"errors":[]}"#, |e| matches!(e, DeliveryError::Server(Some(_)))),
        ];

        for (status, body, check) in cases {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST);
                    then.status(status).body(body);
                })
                .await;

            let err = client(&server.base_url())
                .send(&event("purchase"))
                .await
                .unwrap_err();
            assert!(check(&err), "status {} classified as {:?}", status, err);
        }
    }

    #[tokio::test]
    async fn test_unlisted_codes_are_success() {
        for status in [201, 204, 403] {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(POST);
                    then.status(status);
                })
                .await;
            assert!(client(&server.base_url())
                .send(&event("purchase"))
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn test_no_response_is_connection_error() {
        // Nothing listens on port 1
        let err = client("http://127.0.0.1:1")
            .send(&event("purchase"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Connection(_)));
        assert!(err.is_transient());
    }
}
