//! OpenAI chat-completions provider.
//!
//! Works against api.openai.com and any OpenAI-compatible gateway via
//! `with_base_url`.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ModelProvider, ModelRequest, ProviderError, ProviderResult};

/// Default chat model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI chat-completions client.
#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    client: reqwest::Client,

    /// OpenAI API key for authentication
    api_key: String,

    model: String,

    base_url: String,

    /// "openai:<model>", used in logs
    label: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider.
    ///
    /// # Arguments
    /// * `api_key` - OpenAI API key
    /// * `model` - Model name (defaults to "gpt-4o-mini" if None)
    pub fn new(api_key: String, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            client: reqwest::Client::new(),
            api_key,
            label: format!("openai:{}", model),
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn request_body(&self, request: &ModelRequest) -> Value {
        let mut messages = Vec::new();
        if !request.system_message.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system_message }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

fn extract_content(payload: &Value) -> ProviderResult<String> {
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .ok_or_else(|| ProviderError::InvalidResponse("response has no choices[0].message.content".into()))
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn send(&self, request: &ModelRequest) -> ProviderResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(ProviderError::from_transport)?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status, &headers, &body));
        }

        let payload: Value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("malformed JSON: {}", e)))?;
        extract_content(&payload)
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> OpenAIProvider {
        OpenAIProvider::new("sk-test".to_string(), None).with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_send_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "model": "gpt-4o-mini", "max_tokens": 256 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "  Natural Language Processing \n" } }]
            })))
            .mount(&server)
            .await;

        let request = ModelRequest::new("Which domain?", "You classify papers.").with_max_tokens(256);
        let answer = provider_for(&server).send(&request).await.unwrap();
        assert_eq!(answer, "Natural Language Processing");
    }

    #[tokio::test]
    async fn test_rate_limit_is_classified_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let err = provider_for(&server)
            .send(&ModelRequest::new("x", ""))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "rate_limit");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_auth_and_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;
        let err = provider_for(&server)
            .send(&ModelRequest::new("x", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = provider_for(&server)
            .send(&ModelRequest::new("x", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Server(_)));
    }

    #[tokio::test]
    async fn test_missing_content_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;
        let err = provider_for(&server)
            .send(&ModelRequest::new("x", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[test]
    fn test_request_body_omits_empty_system_message() {
        let provider = OpenAIProvider::new("k".into(), Some("gpt-4o".into()));
        let body = provider.request_body(&ModelRequest::new("hello", ""));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(provider.name(), "openai:gpt-4o");
    }
}
