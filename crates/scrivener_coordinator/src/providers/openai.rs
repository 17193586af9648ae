//! Client for OpenAI-compatible chat completion endpoints.

use async_trait::async_trait;
use reqwest::Client;
use scrivener_protocol::TokenUsage;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::collaborators::{GenerationClient, GenerationRequest, GenerationResponse};
use crate::error::{CoordinatorError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

pub struct OpenAiCompatibleClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: &str, api_key: Option<String>, model: String) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CoordinatorError::generation(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "stream": false,
        });
        if let Value::Object(fields) = &mut body {
            for (key, value) in &request.params {
                fields.insert(key.clone(), value.clone());
            }
        }
        body
    }
}

fn map_http_error(error: reqwest::Error) -> CoordinatorError {
    if error.is_timeout() {
        CoordinatorError::generation(format!("Provider request timed out: {}", error))
    } else if error.is_connect() {
        CoordinatorError::generation(format!("Provider connection failed: {}", error))
    } else {
        CoordinatorError::generation(format!("Provider HTTP error: {}", error))
    }
}

#[async_trait]
impl GenerationClient for OpenAiCompatibleClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.http.post(&url).json(&self.request_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let summary = error_text.lines().next().unwrap_or_default();
            return Err(CoordinatorError::generation(match status.as_u16() {
                401 | 403 => format!("Provider rejected credentials ({}): {}", status, summary),
                429 => format!("Provider rate limit exceeded: {}", summary),
                _ => format!("Provider request failed ({}): {}", status, summary),
            }));
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            CoordinatorError::generation(format!("Failed to parse provider response: {}", e))
        })?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CoordinatorError::generation("Provider returned no choices"))?;

        let token_usage = completion
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens, u.total_tokens))
            .unwrap_or_default();

        Ok(GenerationResponse { text, token_usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_params_are_merged_into_body() {
        let client =
            OpenAiCompatibleClient::new("http://localhost:8080/v1/", None, "local".to_string())
                .unwrap();
        let mut params = Map::new();
        params.insert("temperature".to_string(), json!(0.2));

        let body = client.request_body(&GenerationRequest {
            prompt: "Hello".to_string(),
            params,
        });
        assert_eq!(body["model"], "local");
        assert_eq!(body["temperature"], json!(0.2));
        assert_eq!(body["messages"][0]["content"], "Hello");
        assert_eq!(client.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn test_parse_completion_response() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Hi"));
        assert_eq!(parsed.usage.unwrap().total_tokens, 4);
    }
}
