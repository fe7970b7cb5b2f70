//! Client for OpenAI-compatible chat completions APIs.
//!
//! Works against api.openai.com or any server exposing
//! `/v1/chat/completions` (vLLM, llama.cpp, proxies).

use anyhow::{Context, Result};
use experiment_kernel::ChatTurn;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI-compatible chat completions client.
#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Request body for /v1/chat/completions.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    max_completion_tokens: u32,
    temperature: f32,
}

/// Response from /v1/chat/completions.
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Text and token usage of one completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ChatResponse {
    fn into_completion(self) -> Result<Completion> {
        let (input_tokens, output_tokens) = self
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let text = self
            .choices
            .into_iter()
            .next()
            .context("No choices in chat completion response")?
            .message
            .content
            .unwrap_or_default();
        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

impl OpenAiClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` - Server root without the `/v1` suffix (e.g., "http://localhost:8000")
    /// * `api_key` - Sent as a bearer token when present
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a chat prompt and return the first choice.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatTurn],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion> {
        let request = ChatRequest {
            model,
            messages,
            max_completion_tokens: max_tokens,
            temperature,
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat completion failed with status {}: {}", status, body);
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        chat_response.into_completion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OpenAiClient::new("http://localhost:8000", None);
        assert_eq!(client.base_url(), "http://localhost:8000");

        // Test trailing slash removal
        let client = OpenAiClient::new("http://localhost:8000/", Some(String::new()));
        assert_eq!(client.base_url(), "http://localhost:8000");
        assert!(client.api_key.is_none());
    }

    #[test]
    fn test_debug_redacts_key() {
        let client = OpenAiClient::new(DEFAULT_BASE_URL, Some("sk-secret".to_string()));
        let debug = format!("{client:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![ChatTurn::system("rules"), ChatTurn::user("hi")];
        let request = ChatRequest {
            model: "gpt-5-mini",
            messages: &messages,
            max_completion_tokens: 256,
            temperature: 1.0,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-5-mini");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_completion_tokens"], 256);
    }

    #[test]
    fn test_response_with_usage() {
        let json = r#"{
            "choices": [{"message": {"role": "assistant", "content": "OFFER 40"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 4, "total_tokens": 124}
        }"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        let completion = response.into_completion().unwrap();
        assert_eq!(completion.text, "OFFER 40");
        assert_eq!(completion.input_tokens, 120);
        assert_eq!(completion.output_tokens, 4);
    }

    #[test]
    fn test_response_without_usage_or_content() {
        let json = r#"{"choices": [{"message": {"role": "assistant", "content": null}}]}"#;
        let response: ChatResponse = serde_json::from_str(json).unwrap();
        let completion = response.into_completion().unwrap();
        assert_eq!(completion.text, "");
        assert_eq!(completion.input_tokens, 0);
        assert_eq!(completion.output_tokens, 0);
    }

    #[test]
    fn test_response_without_choices() {
        let response: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(response.into_completion().is_err());
    }
}
