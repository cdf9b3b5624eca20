//! HTTP transport for GCP REST API calls
//!
//! Responses are classified for the retry layer: throttling (429), server
//! errors (5xx) and connection failures are transient, 404 is not-found and
//! everything else is permanent.

use crate::error::ProviderError;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Truncate a response body and drop control characters before logging
pub fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let cut: String = body.chars().take(MAX_LOG_BODY_LENGTH).collect();
        format!("{}... [truncated, {} bytes total]", cut, body.len())
    } else {
        body.to_string()
    };
    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// Map a non-success status to a provider error
pub fn classify(status: StatusCode, body: &str) -> ProviderError {
    let message = format!("{}: {}", status, sanitize_for_log(body));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transient(message)
    } else if status == StatusCode::NOT_FOUND {
        ProviderError::NotFound(message)
    } else {
        ProviderError::Permanent(message)
    }
}

/// HTTP client wrapper for GCP API calls
#[derive(Clone)]
pub struct GcpHttpClient {
    client: Client,
}

impl GcpHttpClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("custodian/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Send one request; an empty success body yields `Value::Null`
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        token: &str,
        body: Option<&Value>,
    ) -> Result<Value, ProviderError> {
        tracing::debug!("{} {}", method, url);

        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {}", e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            let error = classify(status, &text);
            tracing::warn!("API error: {}", error);
            return Err(error);
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Permanent(format!("invalid response JSON: {}", e)))
    }

    pub async fn get(&self, url: &str, token: &str) -> Result<Value, ProviderError> {
        self.send(Method::GET, url, token, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(matches!(classify(StatusCode::NOT_FOUND, ""), ProviderError::NotFound(_)));
        assert!(matches!(classify(StatusCode::FORBIDDEN, ""), ProviderError::Permanent(_)));
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(500);
        let logged = sanitize_for_log(&body);
        assert!(logged.starts_with(&"x".repeat(200)));
        assert!(logged.contains("500 bytes total"));
        assert_eq!(sanitize_for_log("a\u{7}b"), "ab");
    }
}
