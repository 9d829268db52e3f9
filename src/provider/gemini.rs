//! Google Gemini provider (`generateContent`).

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ModelProvider, ModelRequest, ProviderError, ProviderResult};

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini REST client.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    label: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Self {
            client: reqwest::Client::new(),
            api_key,
            label: format!("gemini:{}", model),
            model,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn request_body(request: &ModelRequest) -> Value {
        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            },
        });
        if !request.system_message.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": request.system_message }] });
        }
        body
    }
}

fn extract_text(payload: &Value) -> ProviderResult<String> {
    let parts = payload
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::InvalidResponse("response has no candidates[0].content.parts".into()))?;

    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    Ok(text.trim().to_string())
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    async fn send(&self, request: &ModelRequest) -> ProviderResult<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&Self::request_body(request))
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
        extract_text(&payload)
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_joins_candidate_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .and(query_param("key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "Computer " }, { "text": "Vision" }] } }]
            })))
            .mount(&server)
            .await;

        let provider = GeminiProvider::new("g-key".into(), None).with_base_url(server.uri());
        let answer = provider
            .send(&ModelRequest::new("domain?", "classify"))
            .await
            .unwrap();
        assert_eq!(answer, "Computer Vision");
    }

    #[tokio::test]
    async fn test_forbidden_is_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let provider = GeminiProvider::new("g-key".into(), None).with_base_url(server.uri());
        let err = provider.send(&ModelRequest::new("x", "")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn test_system_instruction_only_when_present() {
        let with = GeminiProvider::request_body(&ModelRequest::new("p", "sys"));
        assert!(with.get("systemInstruction").is_some());
        let without = GeminiProvider::request_body(&ModelRequest::new("p", ""));
        assert!(without.get("systemInstruction").is_none());
    }
}
