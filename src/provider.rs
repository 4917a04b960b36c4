//! The provider module
//! Route embedding and generation calls to the client registered for a model's provider

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::openai::OpenAiClient;

/// A fully qualified model name, `provider/model`.
///
/// Everything after the first `/` is the model name, so
/// `"openai/ft:gpt-4o/custom"` has the model name `"ft:gpt-4o/custom"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub name: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
        }
    }
}

impl FromStr for ModelRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((provider, name)) if !provider.is_empty() && !name.is_empty() => {
                Ok(Self::new(provider, name))
            }
            _ => Err(Error::InvalidModel(s.to_string())),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// What an embedding will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPurpose {
    /// Stored alongside a fragment.
    Document,
    /// Used once to search, never stored.
    Query,
}

/// Input to a text generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    /// User turns, in order.
    pub prompts: Vec<String>,
    /// Ask the model for a single JSON object.
    pub json_output: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// The model that answered, as reported by the provider.
    pub model: String,
    pub usage: Usage,
}

pub trait Embedder: Send + Sync {
    fn provider(&self) -> &str;

    fn embed(&self, text: &str, model: &ModelRef, purpose: EmbedPurpose) -> Result<Vec<f64>>;
}

pub trait Generator: Send + Sync {
    fn provider(&self) -> &str;

    fn generate(&self, model: &ModelRef, request: &GenerationRequest) -> Result<Generation>;
}

/// Registry of embedding and generation clients keyed by provider name.
///
/// Provider names are compared case-insensitively.
#[derive(Clone, Default)]
pub struct Proxy {
    embedders: HashMap<String, Arc<dyn Embedder>>,
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl Proxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every client whose credentials are present in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut proxy = Self::new();

        if let Some(key) = config.openai_key.as_deref().filter(|key| !key.is_empty()) {
            let client = Arc::new(OpenAiClient::new(key, &config.openai_url)?);
            debug!(provider = OpenAiClient::PROVIDER, "adding llm provider");
            proxy.register_generator(client.clone());
            debug!(provider = OpenAiClient::PROVIDER, "adding embed provider");
            proxy.register_embedder(client);
        }

        Ok(proxy)
    }

    pub fn register_embedder(&mut self, embedder: Arc<dyn Embedder>) {
        self.embedders
            .insert(embedder.provider().to_lowercase(), embedder);
    }

    pub fn register_generator(&mut self, generator: Arc<dyn Generator>) {
        self.generators
            .insert(generator.provider().to_lowercase(), generator);
    }

    pub fn embed(&self, text: &str, model: &ModelRef, purpose: EmbedPurpose) -> Result<Vec<f64>> {
        let client = lookup(&self.embedders, model)?;
        client.embed(text, model, purpose)
    }

    pub fn generate(&self, model: &ModelRef, request: &GenerationRequest) -> Result<Generation> {
        let client = lookup(&self.generators, model)?;
        client.generate(model, request)
    }
}

fn lookup<'a, T: ?Sized>(clients: &'a HashMap<String, Arc<T>>, model: &ModelRef) -> Result<&'a Arc<T>> {
    let client = clients
        .get(&model.provider.to_lowercase())
        .ok_or_else(|| Error::NotFound(model.provider.clone()))?;
    if model.name.is_empty() {
        return Err(Error::NoModel(format!("model name is not set for provider '{}'", model.provider)));
    }
    Ok(client)
}
