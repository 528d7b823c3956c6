//! OpenAI-compatible chat completions backend

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{BackendError, BackendResult, LanguageModelClient};
use crate::conversation::ConversationTurn;
use crate::frames::Frame;
use crate::{Error, Result};

/// Default endpoint base
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat completions client
pub struct ChatCompletionsClient {
    client: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    system_prompt: String,
    max_tokens: u32,
}

impl ChatCompletionsClient {
    /// Create a new client
    ///
    /// `request_timeout` bounds the HTTP call itself; the conversation layer
    /// runs its own, usually shorter, response timeout on top.
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty or the HTTP client cannot be built
    pub fn new(
        api_key: SecretString,
        base_url: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        max_tokens: u32,
        request_timeout: Duration,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("language model API key required".to_string()));
        }

        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            max_tokens,
        })
    }

    fn build_messages(
        &self,
        prompt: &str,
        image_url: Option<String>,
        history: &[ConversationTurn],
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        if !self.system_prompt.is_empty() {
            messages.push(Message::text("system", &self.system_prompt));
        }

        for turn in history {
            messages.push(Message::text("user", &turn.user_input));
            messages.push(Message::text("assistant", &turn.agent_response));
        }

        let content = match image_url {
            Some(url) => Content::Parts(vec![
                ContentPart::Text {
                    text: prompt.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url },
                },
            ]),
            None => Content::Text(prompt.to_string()),
        };
        messages.push(Message {
            role: "user".to_string(),
            content,
        });

        messages
    }

    async fn complete(&self, messages: Vec<Message>) -> BackendResult<String> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(self.max_tokens),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, model = %self.model, "chat completion failed");
            return Err(BackendError::from_status(status, &body));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Other(format!("failed to parse response: {e}")))?;

        let text = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(BackendError::Other("empty response".to_string()));
        }

        tracing::debug!(model = %self.model, chars = text.len(), "chat completion received");
        Ok(text)
    }
}

#[async_trait]
impl LanguageModelClient for ChatCompletionsClient {
    async fn submit(&self, prompt: &str, history: &[ConversationTurn]) -> BackendResult<String> {
        let messages = self.build_messages(prompt, None, history);
        self.complete(messages).await
    }

    async fn submit_with_image(
        &self,
        prompt: &str,
        image: &Frame,
        history: &[ConversationTurn],
    ) -> BackendResult<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&image.data);
        let data_url = format!("data:{};base64,{encoded}", image.mime_type);
        let messages = self.build_messages(prompt, Some(data_url), history);
        self.complete(messages).await
    }

    fn name(&self) -> &'static str {
        "chat-completions"
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: Content,
}

impl Message {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Content::Text(text.to_string()),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ChatCompletionsClient {
        ChatCompletionsClient::new(
            SecretString::from("sk-test".to_string()),
            "https://llm.example.com/v1/",
            "test-model",
            "Be brief.",
            256,
            Duration::from_secs(20),
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_key() {
        let result = ChatCompletionsClient::new(
            SecretString::from(String::new()),
            DEFAULT_BASE_URL,
            "m",
            "",
            10,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn history_is_replayed_in_order() {
        let client = client();
        assert_eq!(client.base_url, "https://llm.example.com/v1");

        let history = vec![
            ConversationTurn::new("hi", "hello"),
            ConversationTurn::new("price of urea", "about 270 rupees a bag"),
        ];
        let messages = client.build_messages("and DAP?", None, &history);
        let json = serde_json::to_value(&messages).unwrap();

        assert_eq!(json[0]["role"], "system");
        assert_eq!(json[1]["content"], "hi");
        assert_eq!(json[2]["role"], "assistant");
        assert_eq!(json[4]["content"], "about 270 rupees a bag");
        assert_eq!(json[5]["content"], "and DAP?");
    }

    #[test]
    fn image_goes_as_content_parts() {
        let client = client();
        let messages = client.build_messages(
            "what do you see",
            Some("data:image/png;base64,AAAA".to_string()),
            &[],
        );
        let json = serde_json::to_value(&messages).unwrap();
        let parts = &json[1]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }
}
