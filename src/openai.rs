//! Blocking client for OpenAI compatible embedding and chat endpoints.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::provider::{
    EmbedPurpose, Embedder, Generation, GenerationRequest, Generator, ModelRef, Usage,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// --- Wire structs ---

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f64>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub const PROVIDER: &'static str = "openai";

    /// `base_url` is the API root, e.g. `https://api.openai.com/v1`.
    pub fn new(api_key: &str, base_url: &str) -> Result<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(Error::Provider(format!("{url} returned {status}: {text}")));
        }

        Ok(response.json()?)
    }
}

impl Embedder for OpenAiClient {
    fn provider(&self) -> &str {
        Self::PROVIDER
    }

    /// OpenAI embeds documents and queries the same way, `purpose` is only logged.
    fn embed(&self, text: &str, model: &ModelRef, purpose: EmbedPurpose) -> Result<Vec<f64>> {
        debug!(model = %model, ?purpose, len = text.len(), "requesting embedding");
        let request = EmbeddingRequest {
            model: &model.name,
            input: text,
            encoding_format: "float",
        };

        let response: EmbeddingResponse = self.post("embeddings", &request)?;
        response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| Error::Provider("embedding response contained no data".to_string()))
    }
}

impl Generator for OpenAiClient {
    fn provider(&self) -> &str {
        Self::PROVIDER
    }

    fn generate(&self, model: &ModelRef, request: &GenerationRequest) -> Result<Generation> {
        let mut messages = Vec::with_capacity(request.prompts.len() + 1);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system,
            });
        }
        messages.extend(request.prompts.iter().map(|prompt| ChatMessage {
            role: "user",
            content: prompt,
        }));

        let body = ChatRequest {
            model: &model.name,
            messages,
            response_format: request.json_output.then_some(ResponseFormat { kind: "json_object" }),
        };

        debug!(model = %model, prompts = request.prompts.len(), "requesting completion");
        let response: ChatResponse = self.post("chat/completions", &body)?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::Provider("completion response contained no message".to_string()))?;
        let usage = response
            .usage
            .map(|usage| Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            })
            .unwrap_or_default();

        Ok(Generation {
            text,
            model: response.model,
            usage,
        })
    }
}
