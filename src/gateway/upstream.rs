use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde_json::Value;

use super::GatewayError;
use super::config::UpstreamConfig;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// HTTP client for the upstream completions API.
#[derive(Clone)]
pub struct UpstreamClient {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|err| GatewayError::Upstream {
                message: format!("upstream http client error: {err}"),
            })?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: &UpstreamConfig, client: reqwest::Client) -> Self {
        Self {
            base_url: config.base_url.clone(),
            client,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub fn chat_completions_url(&self) -> String {
        join_base_url(&self.base_url, CHAT_COMPLETIONS_PATH)
    }

    /// Posts `body` with `api_key`. `timeout` bounds the wait for response headers only,
    /// so a streamed body may outlive it.
    pub async fn send_chat_completion(
        &self,
        api_key: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            GatewayError::InvalidRequest {
                reason: "api key contains characters not allowed in a header".to_string(),
            }
        })?;
        let payload = serde_json::to_vec(body)?;

        let request = self
            .client
            .post(self.chat_completions_url())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, bearer)
            .body(payload);

        match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) if err.is_timeout() => Err(GatewayError::UpstreamTimeout),
            Ok(Err(err)) => Err(GatewayError::Upstream {
                message: format!("upstream request failed: {err}"),
            }),
            Err(_) => Err(GatewayError::UpstreamTimeout),
        }
    }
}

fn join_base_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path_no_leading_slash = path.strip_prefix('/').unwrap_or(path);

    // Accept a base url that already ends in /v1.
    if base.ends_with("/v1") {
        if path_no_leading_slash == "v1" {
            return base.to_string();
        }
        if let Some(rest) = path_no_leading_slash.strip_prefix("v1/") {
            return format!("{base}/{rest}");
        }
    }

    format!("{base}/{path_no_leading_slash}")
}

/// Case-insensitive "model not found" signature in free text.
pub fn is_model_not_found_text(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("model_not_found")
        || lower.contains("model not found")
        || lower.contains("no such model")
}

/// Structured "model not found" signature in an OpenAI-style error payload.
pub fn is_model_not_found_payload(payload: &Value) -> bool {
    let Some(error) = payload.get("error") else {
        return false;
    };
    if let Some(text) = error.as_str() {
        return is_model_not_found_text(text);
    }
    if !error.is_object() {
        return false;
    }
    if error.get("code").and_then(Value::as_str) == Some("model_not_found")
        || error.get("type").and_then(Value::as_str) == Some("model_not_found")
    {
        return true;
    }
    error
        .get("message")
        .and_then(Value::as_str)
        .is_some_and(is_model_not_found_text)
}

/// Either signature, checked against a raw 404 body.
pub fn is_model_not_found_body(body: &[u8]) -> bool {
    if let Ok(payload) = serde_json::from_slice::<Value>(body) {
        if is_model_not_found_payload(&payload) {
            return true;
        }
    }
    is_model_not_found_text(&String::from_utf8_lossy(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_base_url_handles_v1_suffix() {
        assert_eq!(
            join_base_url("http://localhost:8080/v1", "/v1/chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(
            join_base_url("http://localhost:8080", "/v1/chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(
            join_base_url("http://localhost:8080/v1/", "v1/chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(
            join_base_url("http://localhost:8080/v1", "/v1"),
            "http://localhost:8080/v1"
        );
    }

    #[test]
    fn model_not_found_text_signatures() {
        assert!(is_model_not_found_text("Model Not Found: foo"));
        assert!(is_model_not_found_text("code=MODEL_NOT_FOUND"));
        assert!(is_model_not_found_text("no such model 'x'"));
        assert!(!is_model_not_found_text("route not found"));
    }

    #[test]
    fn model_not_found_payload_signatures() {
        assert!(is_model_not_found_payload(&json!({"error": "model not found"})));
        assert!(is_model_not_found_payload(
            &json!({"error": {"code": "model_not_found"}})
        ));
        assert!(is_model_not_found_payload(
            &json!({"error": {"type": "model_not_found", "message": "x"}})
        ));
        assert!(is_model_not_found_payload(
            &json!({"error": {"message": "The model `x` does not exist or no such model"}})
        ));
        assert!(!is_model_not_found_payload(&json!({"error": {"code": 404}})));
        assert!(!is_model_not_found_payload(&json!({"message": "model not found"})));
        assert!(!is_model_not_found_payload(&json!(["error"])));
    }

    #[test]
    fn raw_body_detection_covers_json_and_text() {
        assert!(is_model_not_found_body(br#"{"error":{"code":"model_not_found"}}"#));
        assert!(is_model_not_found_body(b"404: no such model"));
        assert!(!is_model_not_found_body(b"<html>not found</html>"));
    }
}
