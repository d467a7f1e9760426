//! Delivery of batches to the destination API.
use std::sync::Arc;
use std::time;

use http::StatusCode;
use poster_common::retry::RetryPolicy;
use reqwest::header;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::{DeliveryError, DeliveryFailure, ValidationError};
use crate::router::DeliveryBatch;
use crate::token::{AuthToken, TokenCache};

/// Longest slice of a response body we keep for logs and errors.
const MAX_RESPONSE_BODY: usize = 64 * 1024;

pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("Item Poster")
        .timeout(request_timeout)
        .build()
}

/// A batch the destination accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub status: StatusCode,
    /// Number of requests made, including the successful one.
    pub attempts: u32,
    /// Per record problems reported in the `errors` list of a 200 response.
    pub data_errors: Vec<Value>,
}

/// What a single response means for the batch.
enum Verdict {
    Delivered,
    Retry,
    Reject,
}

fn verdict(status: StatusCode) -> Verdict {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::INTERNAL_SERVER_ERROR => Verdict::Retry,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Verdict::Reject,
        _ => Verdict::Delivered,
    }
}

/// Sends batches with bearer auth, retrying 401 and 500 responses with exponential backoff.
pub struct DeliveryClient {
    http_client: reqwest::Client,
    retry_policy: RetryPolicy,
    tokens: Arc<TokenCache>,
}

impl DeliveryClient {
    pub fn new(
        http_client: reqwest::Client,
        retry_policy: RetryPolicy,
        tokens: Arc<TokenCache>,
    ) -> Self {
        Self {
            http_client,
            retry_policy,
            tokens,
        }
    }

    /// Deliver one batch, starting with `token`.
    ///
    /// * A transport error (no response) fails immediately.
    /// * 400 and 404 fail immediately with a `ValidationError`.
    /// * 401 clears the cached token and retries with a freshly fetched one.
    /// * 500 retries with the same token.
    /// * 200 and every other status count as delivered; anything but 200 is logged.
    ///
    /// Retries wait `retry_policy.retry_interval(n)` before the n-th retry, and stop after
    /// `retry_policy.max_retries` with a `DeliveryError::RetriesExhausted`.
    pub async fn deliver(
        &self,
        batch: &DeliveryBatch,
        token: AuthToken,
    ) -> Result<DeliveryResult, DeliveryFailure> {
        let endpoint = batch.endpoint.as_str();
        let method = batch.operation.method();
        let labels = [("operation", batch.operation.to_string())];

        let body = serde_json::to_vec(&batch.records).map_err(|error| DeliveryError::Serialize {
            endpoint: endpoint.to_owned(),
            error,
        })?;

        let mut token = token;
        let mut retries = 0;

        loop {
            let attempt = retries + 1;
            metrics::counter!("poster_delivery_attempts_total", &labels).increment(1);

            let response = self
                .http_client
                .request(method.clone(), endpoint)
                .bearer_auth(token.as_str())
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await
                .map_err(|error| {
                    error!(stage = "delivery", endpoint, attempt, %error, "request failed without a response");
                    metrics::counter!("poster_delivery_failures_total", &labels).increment(1);
                    DeliveryError::Transport {
                        endpoint: endpoint.to_owned(),
                        error,
                    }
                })?;

            let status = response.status();

            match verdict(status) {
                Verdict::Delivered => {
                    let text = response.text().await.unwrap_or_default();
                    let data_errors = response_errors(&text);

                    if status == StatusCode::OK {
                        info!(endpoint, %method, records = batch.records.len(), attempt, "batch delivered");
                    } else {
                        warn!(endpoint, %method, status = status.as_u16(), attempt, "unexpected status, treating batch as delivered");
                    }
                    if !data_errors.is_empty() {
                        warn!(
                            endpoint,
                            errors = data_errors.len(),
                            first_error = %data_errors[0],
                            "destination reported data quality errors"
                        );
                    }

                    return Ok(DeliveryResult {
                        status,
                        attempts: attempt,
                        data_errors,
                    });
                }
                Verdict::Reject => {
                    let text = truncate(response.text().await.unwrap_or_default());
                    error!(stage = "validation", endpoint, status = status.as_u16(), body = %text, "destination rejected batch");
                    metrics::counter!("poster_delivery_failures_total", &labels).increment(1);

                    return Err(ValidationError {
                        endpoint: endpoint.to_owned(),
                        status,
                        body: text,
                    }
                    .into());
                }
                Verdict::Retry => {
                    if status == StatusCode::UNAUTHORIZED {
                        self.tokens.invalidate(&token).await;
                    }

                    if !self.retry_policy.can_retry(retries) {
                        error!(stage = "delivery", endpoint, status = status.as_u16(), attempts = attempt, "giving up on batch");
                        metrics::counter!("poster_delivery_failures_total", &labels).increment(1);

                        return Err(DeliveryError::RetriesExhausted {
                            endpoint: endpoint.to_owned(),
                            status,
                            attempts: attempt,
                        }
                        .into());
                    }

                    retries += 1;
                    let interval = self.retry_policy.retry_interval(retries);
                    warn!(
                        endpoint,
                        status = status.as_u16(),
                        attempt,
                        max_attempts = self.retry_policy.max_attempts(),
                        retry_in_ms = interval.as_millis() as u64,
                        "retrying batch"
                    );
                    metrics::counter!("poster_delivery_retries_total", &labels).increment(1);

                    tokio::time::sleep(interval).await;

                    if status == StatusCode::UNAUTHORIZED {
                        token = self.tokens.get_token().await.map_err(|error| {
                            DeliveryError::Reauthenticate {
                                endpoint: endpoint.to_owned(),
                                error,
                            }
                        })?;
                    }
                }
            }
        }
    }
}

/// Pull the `errors` list out of a JSON response body, if there is one.
fn response_errors(body: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(mut fields)) => match fields.remove("errors") {
            Some(Value::Array(errors)) => errors,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_RESPONSE_BODY {
        let mut end = MAX_RESPONSE_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Operation;
    use crate::token::{OAuthCredentials, Plaintext};
    use httpmock::prelude::*;
    use poster_common::record::DecodedRecord;
    use serde_json::json;
    use url::Url;

    fn records() -> Vec<DecodedRecord> {
        vec![
            DecodedRecord::new(json!({"id": "i1", "deleted": false}).as_object().unwrap().clone()),
            DecodedRecord::new(json!({"id": "i2", "deleted": false}).as_object().unwrap().clone()),
        ]
    }

    fn batch(server: &MockServer, operation: Operation) -> DeliveryBatch {
        DeliveryBatch {
            operation,
            endpoint: server.url("/api/v0.1/items"),
            records: records(),
        }
    }

    fn mock_oauth<'a>(server: &'a MockServer, token: &str) -> httpmock::Mock<'a> {
        let token = token.to_owned();
        server.mock(move |when, then| {
            when.method(POST).path("/oauth/token");
            then.status(200).json_body(json!({"access_token": token}));
        })
    }

    fn client(server: &MockServer, retry_policy: RetryPolicy) -> (DeliveryClient, Arc<TokenCache>) {
        let tokens = Arc::new(TokenCache::new(
            reqwest::Client::new(),
            OAuthCredentials {
                key: "key".to_owned(),
                secret: "secret".to_owned(),
                url: Url::parse(&server.base_url()).unwrap(),
            },
            Arc::new(Plaintext),
        ));
        let client = DeliveryClient::new(
            build_http_client(time::Duration::from_secs(5)).unwrap(),
            retry_policy,
            tokens.clone(),
        );
        (client, tokens)
    }

    fn fast_retries(max_retries: u32) -> RetryPolicy {
        RetryPolicy::build(2, time::Duration::from_millis(1))
            .max_retries(max_retries)
            .provide()
    }

    #[tokio::test]
    async fn test_posts_records_with_bearer_auth() {
        let server = MockServer::start();
        let destination = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v0.1/items")
                .header("authorization", "Bearer t1")
                .header("content-type", "application/json")
                .json_body(json!([
                    {"id": "i1", "deleted": false},
                    {"id": "i2", "deleted": false}
                ]));
            then.status(200).json_body(json!({"data": [], "count": 2}));
        });
        let (client, _) = client(&server, fast_retries(5));

        let result = client
            .deliver(&batch(&server, Operation::Upsert), AuthToken::new("t1"))
            .await
            .expect("delivery failed");

        assert_eq!(result.status, StatusCode::OK);
        assert_eq!(result.attempts, 1);
        assert!(result.data_errors.is_empty());
        destination.assert();
    }

    #[tokio::test]
    async fn test_delete_batches_use_delete() {
        let server = MockServer::start();
        let destination = server.mock(|when, then| {
            when.method(DELETE).path("/api/v0.1/items");
            then.status(200);
        });
        let (client, _) = client(&server, fast_retries(5));

        client
            .deliver(&batch(&server, Operation::Delete), AuthToken::new("t1"))
            .await
            .expect("delivery failed");

        destination.assert();
    }

    #[tokio::test]
    async fn test_errors_in_a_200_response_are_reported_but_delivered() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/api/v0.1/items");
            then.status(200)
                .json_body(json!({"data": [], "errors": [{"id": "i2", "message": "bad barcode"}]}));
        });
        let (client, _) = client(&server, fast_retries(5));

        let result = client
            .deliver(&batch(&server, Operation::Upsert), AuthToken::new("t1"))
            .await
            .expect("delivery failed");

        assert_eq!(result.data_errors, vec![json!({"id": "i2", "message": "bad barcode"})]);
    }

    #[tokio::test]
    async fn test_always_500_exhausts_retries() {
        let server = MockServer::start();
        let destination = server.mock(|when, then| {
            when.method(POST).path("/api/v0.1/items");
            then.status(500).body("oops");
        });
        let oauth = mock_oauth(&server, "t2");
        let (client, _) = client(&server, fast_retries(5));

        let err = client
            .deliver(&batch(&server, Operation::Upsert), AuthToken::new("t1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeliveryFailure::Delivery(DeliveryError::RetriesExhausted { attempts: 6, status, .. })
                if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        destination.assert_hits(6);
        oauth.assert_hits(0);
    }

    #[tokio::test]
    async fn test_400_is_a_validation_error_without_retries() {
        let server = MockServer::start();
        let destination = server.mock(|when, then| {
            when.method(POST).path("/api/v0.1/items");
            then.status(400).body(r#"{"message": "invalid item"}"#);
        });
        let oauth = mock_oauth(&server, "t1");
        let (client, tokens) = client(&server, fast_retries(5));
        let token = tokens.get_token().await.unwrap();

        let err = client
            .deliver(&batch(&server, Operation::Upsert), token.clone())
            .await
            .unwrap_err();

        match err {
            DeliveryFailure::Validation(ValidationError { status, body, .. }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert!(body.contains("invalid item"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        destination.assert_hits(1);
        // The cached token was left alone.
        assert_eq!(tokens.get_token().await.unwrap(), token);
        oauth.assert_hits(1);
    }

    #[tokio::test]
    async fn test_404_is_a_validation_error() {
        let server = MockServer::start();
        let destination = server.mock(|when, then| {
            when.method(DELETE).path("/api/v0.1/items");
            then.status(404);
        });
        let (client, _) = client(&server, fast_retries(5));

        let err = client
            .deliver(&batch(&server, Operation::Delete), AuthToken::new("t1"))
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryFailure::Validation(_)));
        destination.assert_hits(1);
    }

    #[tokio::test]
    async fn test_401_clears_the_token_and_retries_with_a_new_one() {
        let server = MockServer::start();
        let oauth = mock_oauth(&server, "fresh");
        let stale = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v0.1/items")
                .header("authorization", "Bearer stale");
            then.status(401);
        });
        let fresh = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v0.1/items")
                .header("authorization", "Bearer fresh");
            then.status(200);
        });
        let (client, _) = client(&server, fast_retries(5));

        let result = client
            .deliver(&batch(&server, Operation::Upsert), AuthToken::new("stale"))
            .await
            .expect("delivery failed");

        assert_eq!(result.attempts, 2);
        stale.assert_hits(1);
        fresh.assert_hits(1);
        oauth.assert_hits(1);
    }

    #[tokio::test]
    async fn test_401_forces_the_next_token_fetch_to_exchange_again() {
        let server = MockServer::start();
        let oauth = mock_oauth(&server, "t1");
        server.mock(|when, then| {
            when.method(POST).path("/api/v0.1/items");
            then.status(401);
        });
        let (client, tokens) = client(&server, fast_retries(0));
        let token = tokens.get_token().await.unwrap();
        oauth.assert_hits(1);

        let err = client
            .deliver(&batch(&server, Operation::Upsert), token)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryFailure::Delivery(DeliveryError::RetriesExhausted { attempts: 1, .. })
        ));

        tokens.get_token().await.unwrap();
        oauth.assert_hits(2);
    }

    #[tokio::test]
    async fn test_failed_reauthentication_is_a_delivery_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth/token");
            then.status(500);
        });
        server.mock(|when, then| {
            when.method(POST).path("/api/v0.1/items");
            then.status(401);
        });
        let (client, _) = client(&server, fast_retries(5));

        let err = client
            .deliver(&batch(&server, Operation::Upsert), AuthToken::new("t1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeliveryFailure::Delivery(DeliveryError::Reauthenticate { .. })
        ));
    }

    #[tokio::test]
    async fn test_other_statuses_count_as_delivered() {
        let server = MockServer::start();
        let destination = server.mock(|when, then| {
            when.method(POST).path("/api/v0.1/items");
            then.status(503);
        });
        let (client, _) = client(&server, fast_retries(5));

        let result = client
            .deliver(&batch(&server, Operation::Upsert), AuthToken::new("t1"))
            .await
            .expect("delivery failed");

        assert_eq!(result.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(result.attempts, 1);
        destination.assert_hits(1);
    }

    #[tokio::test]
    async fn test_transport_error_is_not_retried() {
        let server = MockServer::start();
        let (client, _) = client(&server, fast_retries(5));
        let batch = DeliveryBatch {
            operation: Operation::Upsert,
            endpoint: "http://127.0.0.1:1/api/v0.1/items".to_owned(),
            records: records(),
        };

        let err = client
            .deliver(&batch, AuthToken::new("t1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeliveryFailure::Delivery(DeliveryError::Transport { .. })
        ));
    }

    #[test]
    fn test_response_errors() {
        assert_eq!(response_errors(r#"{"errors": ["a", "b"]}"#).len(), 2);
        assert!(response_errors(r#"{"errors": []}"#).is_empty());
        assert!(response_errors(r#"{"errors": "not a list"}"#).is_empty());
        assert!(response_errors("not json").is_empty());
        assert!(response_errors("").is_empty());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(MAX_RESPONSE_BODY);

        let truncated = truncate(body);

        assert!(truncated.len() <= MAX_RESPONSE_BODY);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
