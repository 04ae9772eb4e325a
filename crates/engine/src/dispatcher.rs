//! The seam between the engine and the downstream messaging gateway.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use bulkrelay_core::DispatchJob;

/// A single dispatch attempt failed.
///
/// Recorded on the item that was being dispatched; never fatal to the
/// worker loop, and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl DispatchError {
    /// The human-readable message recorded on a failed item.
    ///
    /// For gateway rejections this is the gateway's own message (the
    /// `message` field of its error body when present), matching what an
    /// operator needs to see in a campaign report.
    pub fn item_message(&self) -> String {
        match self {
            DispatchError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Sends one fully-formed dispatch job to the gateway.
///
/// The engine treats implementations as a black box; any transport works.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Execute `job` against the gateway, bounded by `timeout`.
    ///
    /// On success, returns the gateway's response body.
    async fn dispatch(
        &self,
        job: &DispatchJob,
        timeout: Duration,
    ) -> Result<serde_json::Value, DispatchError>;
}

/// HTTP dispatcher backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        job: &DispatchJob,
        timeout: Duration,
    ) -> Result<serde_json::Value, DispatchError> {
        let method = reqwest::Method::from_bytes(job.method.as_bytes())
            .map_err(|_| DispatchError::InvalidJob(format!("bad method '{}'", job.method)))?;

        let mut request = self.client.request(method, &job.url).timeout(timeout);
        for (name, value) in &job.headers {
            request = request.header(name, value);
        }
        if !job.body.is_null() {
            request = request.json(&job.body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout(timeout)
            } else {
                DispatchError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);

        if status.is_success() {
            return Ok(body);
        }

        // Prefer the gateway's own message field over a generic status line.
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("gateway returned status {}", status.as_u16()));

        Err(DispatchError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn send_job(url: String) -> DispatchJob {
        DispatchJob::new("POST", url, json!({"chatId": "5511999@c.us", "text": "hi"}))
            .with_header("X-Api-Key", "secret")
    }

    #[tokio::test]
    async fn successful_dispatch_returns_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sendText"))
            .and(header("X-Api-Key", "secret"))
            .and(body_json(json!({"chatId": "5511999@c.us", "text": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "msg-1"})))
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new();
        let result = dispatcher
            .dispatch(
                &send_job(format!("{}/api/sendText", server.uri())),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(result, json!({"id": "msg-1"}));
    }

    #[tokio::test]
    async fn rejection_prefers_gateway_message_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(json!({"message": "session not connected"})),
            )
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new();
        let err = dispatcher
            .dispatch(&send_job(server.uri()), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DispatchError::Rejected {
                status: 422,
                message: "session not connected".to_string()
            }
        );
        assert_eq!(err.item_message(), "session not connected");
    }

    #[tokio::test]
    async fn rejection_without_message_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new();
        let err = dispatcher
            .dispatch(&send_job(server.uri()), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(err.item_message(), "gateway returned status 500");
    }

    #[tokio::test]
    async fn slow_gateway_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new();
        let err = dispatcher
            .dispatch(&send_job(server.uri()), Duration::from_millis(100))
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn invalid_method_is_rejected_before_send() {
        let dispatcher = HttpDispatcher::new();
        let job = DispatchJob::new("NOT A METHOD", "http://localhost/x", json!({}));

        let err = dispatcher.dispatch(&job, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidJob(_)));
    }
}
