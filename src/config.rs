//! Runtime configuration shared by the command line and the HTTP server.

use std::fmt;
use std::path::PathBuf;

use crate::distance::VecDist;
use crate::error::Result;
use crate::provider::ModelRef;
use crate::store::FragmentStore;

pub const DEFAULT_DB: &str = "./fragdb.db";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBED_MODEL: &str = "openai/text-embedding-3-small";
pub const DEFAULT_LLM_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Clone)]
pub struct Config {
    pub db: PathBuf,
    pub openai_key: Option<String>,
    pub openai_url: String,
    /// Model used for both document and query embeddings.
    pub embed_model: ModelRef,
    pub llm_model: ModelRef,
    pub verbose: bool,
}

impl Config {
    pub fn open_store(&self, distance: VecDist) -> Result<FragmentStore> {
        FragmentStore::open_with(&self.db, distance)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: PathBuf::from(DEFAULT_DB),
            openai_key: None,
            openai_url: DEFAULT_OPENAI_URL.to_string(),
            embed_model: ModelRef::new("openai", "text-embedding-3-small"),
            llm_model: ModelRef::new("openai", "gpt-4o-mini"),
            verbose: false,
        }
    }
}

// keys never reach the logs
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("db", &self.db)
            .field("openai_key", &self.openai_key.as_ref().map(|_| "<redacted>"))
            .field("openai_url", &self.openai_url)
            .field("embed_model", &self.embed_model.to_string())
            .field("llm_model", &self.llm_model.to_string())
            .field("verbose", &self.verbose)
            .finish()
    }
}
