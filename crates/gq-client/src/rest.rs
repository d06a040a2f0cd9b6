//! HTTP client for the generation backend

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use gq_core::config::ClientConfig;
use gq_core::TransportError;
use gq_protocol::{
    records_from_body, CancelAck, GenerationRequest, ResultPatch, StartAck, SystemStatus,
};

use crate::api::{Download, GenerationApi, ResultsQuery};
use crate::endpoint::{Endpoint, API_KEY_HEADER};
use crate::retry::RetryPolicy;

/// Longest backend body quoted in an error message
const MAX_ERROR_BODY: usize = 200;

/// reqwest-backed implementation of [`GenerationApi`]
pub struct RestClient {
    endpoint: Arc<Endpoint>,
    http: reqwest::Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl RestClient {
    pub fn new(endpoint: Arc<Endpoint>, config: &ClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("genqueue/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            endpoint,
            http,
            timeout: config.request_timeout,
            retry: RetryPolicy::new(config.retry.clone()),
        })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Send a request, retrying idempotent methods on 5xx and network errors
    async fn send<F>(
        &self,
        method: Method,
        path: &[&str],
        build: F,
    ) -> Result<Response, TransportError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let attempts = self.retry.attempts_for(&method);
        let mut backoff = self.retry.backoff();
        let mut attempt = 1;

        loop {
            let url = self.endpoint.rest_url(path)?;
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .timeout(self.timeout);
            if let Some(key) = self.endpoint.api_key() {
                request = request.header(API_KEY_HEADER, key);
            }

            let error = match build(request).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => http_error(response).await,
                Err(e) => network_error(&e),
            };

            if attempt >= attempts || !error.is_retryable() {
                tracing::debug!(%method, path = url.path(), attempt, error = %error, "Request failed");
                return Err(error);
            }

            let delay = backoff.next_delay();
            tracing::debug!(
                %method,
                path = url.path(),
                attempt,
                error = %error,
                "Request failed, retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &[&str],
        query: &[(&'static str, String)],
    ) -> Result<T, TransportError> {
        let response = self
            .send(Method::GET, path, |request| request.query(query))
            .await?;
        decode_json(response).await
    }
}

#[async_trait]
impl GenerationApi for RestClient {
    async fn system_status(&self) -> Result<SystemStatus, TransportError> {
        self.get_json(&["system", "status"], &[]).await
    }

    async fn active_jobs(&self) -> Result<Vec<Value>, TransportError> {
        let body: Value = self.get_json(&["generation", "jobs", "active"], &[]).await?;
        records_from_body(body, "jobs").map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn recent_results(&self, query: &ResultsQuery) -> Result<Vec<Value>, TransportError> {
        let body: Value = self
            .get_json(&["generation", "results"], &query.to_pairs())
            .await?;
        records_from_body(body, "results").map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn start_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<StartAck, TransportError> {
        let response = self
            .send(Method::POST, &["generation", "generate"], |builder| {
                builder.json(request)
            })
            .await?;
        decode_json(response).await
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), TransportError> {
        let path = ["generation", "jobs", job_id, "cancel"];
        let response = self.send(Method::POST, &path, |builder| builder).await?;
        let body = read_body(response).await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        let ack: CancelAck =
            serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))?;
        if ack.success {
            Ok(())
        } else {
            Err(TransportError::Rejected(
                ack.message
                    .unwrap_or_else(|| format!("Backend refused to cancel job {}", job_id)),
            ))
        }
    }

    async fn delete_result(&self, result_id: &str) -> Result<(), TransportError> {
        let path = ["generation", "results", result_id];
        self.send(Method::DELETE, &path, |builder| builder).await?;
        Ok(())
    }

    async fn update_result(
        &self,
        result_id: &str,
        patch: &ResultPatch,
    ) -> Result<(), TransportError> {
        let path = ["generation", "results", result_id];
        self.send(Method::PATCH, &path, |builder| builder.json(patch))
            .await?;
        Ok(())
    }

    async fn download_result(&self, result_id: &str) -> Result<Download, TransportError> {
        let path = ["generation", "results", result_id, "download"];
        let response = self.send(Method::GET, &path, |builder| builder).await?;

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let filename = header(CONTENT_DISPOSITION)
            .as_deref()
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| format!("{}.png", result_id));
        let content_type = header(CONTENT_TYPE);

        let bytes = read_body(response).await?;
        Ok(Download {
            bytes,
            filename,
            content_type,
        })
    }
}

async fn read_body(response: Response) -> Result<bytes::Bytes, TransportError> {
    response
        .bytes()
        .await
        .map_err(|e| TransportError::Network {
            message: format!("Failed to read response body: {}", e),
        })
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let body = read_body(response).await?;
    serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
}

fn network_error(error: &reqwest::Error) -> TransportError {
    let message = if error.is_timeout() {
        "Request timed out".to_string()
    } else if error.is_connect() {
        format!("Could not connect to backend: {}", error)
    } else {
        error.to_string()
    };
    TransportError::Network { message }
}

async fn http_error(response: Response) -> TransportError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    let message = error_message(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string()
    });
    TransportError::Http {
        status: status.as_u16(),
        message,
    }
}

/// Human message from an error body: `detail`, `message` or `error`, else
/// the (truncated) raw text
pub fn error_message(body: &[u8]) -> Option<String> {
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        for key in ["detail", "message", "error"] {
            match map.get(key) {
                Some(Value::String(text)) if !text.trim().is_empty() => {
                    return Some(text.trim().to_string())
                }
                Some(Value::Null) | None => continue,
                Some(Value::String(_)) => continue,
                // Validation errors arrive as a list of objects
                Some(Value::Array(items)) => {
                    let parts: Vec<String> = items
                        .iter()
                        .map(|item| match item.get("msg").and_then(Value::as_str) {
                            Some(msg) => msg.to_string(),
                            None => item.to_string(),
                        })
                        .collect();
                    if !parts.is_empty() {
                        return Some(parts.join("; "));
                    }
                }
                Some(other) => return Some(other.to_string()),
            }
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut truncated: String = text.chars().take(MAX_ERROR_BODY).collect();
    if truncated.len() < text.len() {
        truncated.push_str("...");
    }
    Some(truncated)
}

/// Extract the filename from a `Content-Disposition` header
///
/// `filename*` (RFC 5987) wins over `filename`. Directory components are
/// stripped.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for part in header.split(';').map(str::trim) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'percent-encoded
                let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value);
                extended = Some(percent_decode(encoded.trim_matches('"')));
            }
            "filename" => plain = Some(value.trim_matches('"').to_string()),
            _ => {}
        }
    }

    extended
        .or(plain)
        .map(|name| {
            name.rsplit(['/', '\\'])
                .next()
                .unwrap_or_default()
                .trim()
                .to_string()
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
}

fn percent_decode(encoded: &str) -> String {
    let escaped = encoded.replace('+', "%2B");
    url::form_urlencoded::parse(format!("f={}", escaped).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| encoded.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_disposition() {
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="cat.png""#).as_deref(),
            Some("cat.png")
        );
        assert_eq!(
            filename_from_disposition("attachment; filename=dog.webp").as_deref(),
            Some("dog.webp")
        );
        assert_eq!(
            filename_from_disposition(
                r#"attachment; filename="fallback.png"; filename*=UTF-8''sunset%20%2B%20sea.png"#
            )
            .as_deref(),
            Some("sunset + sea.png")
        );
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="../../etc/passwd""#).as_deref(),
            Some("passwd")
        );
        assert_eq!(filename_from_disposition("inline"), None);
        assert_eq!(filename_from_disposition(r#"attachment; filename="""#), None);
    }

    #[test]
    fn test_error_message_prefers_detail() {
        assert_eq!(
            error_message(br#"{"detail": "Job not found"}"#).as_deref(),
            Some("Job not found")
        );
        assert_eq!(
            error_message(br#"{"message": "busy", "error": "x"}"#).as_deref(),
            Some("busy")
        );
        assert_eq!(
            error_message(br#"{"error": "bad seed"}"#).as_deref(),
            Some("bad seed")
        );
        assert_eq!(
            error_message(br#"{"detail": [{"msg": "field required"}, {"msg": "too long"}]}"#)
                .as_deref(),
            Some("field required; too long")
        );
    }

    #[test]
    fn test_error_message_falls_back_to_text() {
        assert_eq!(error_message(b"Bad Gateway").as_deref(), Some("Bad Gateway"));
        assert_eq!(error_message(b"   "), None);

        let long = "x".repeat(500);
        let message = error_message(long.as_bytes()).unwrap();
        assert!(message.ends_with("..."));
        assert_eq!(message.len(), MAX_ERROR_BODY + 3);
    }
}
