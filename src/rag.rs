//! The knowledge base workflow
//! Embed and store documents, then answer questions from the closest fragments

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CodecError, Result};
use crate::provider::{EmbedPurpose, GenerationRequest, ModelRef, Proxy, Usage};
use crate::search::{search, Limit};
use crate::store::{Fragment, FragmentStore};

const ANSWER_FORMAT: &str = "Reply with a JSON object with two fields: \"answer\", the answer to the \
user question as a string, and \"confidence_score\", a number between 0.0 and 1.0 telling how well \
the provided documents support the answer.";

#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// Identical content was already stored, nothing was embedded.
    Unchanged,
    Stored(Fragment),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    /// `None` when the model did not reply with the requested JSON.
    pub confidence_score: Option<f32>,
    pub model: String,
    pub usage: Usage,
}

#[derive(Deserialize)]
struct AnswerBody {
    answer: String,
    #[serde(default)]
    confidence_score: Option<f32>,
}

/// A fragment store together with the models that feed and query it.
pub struct Knowledge {
    store: FragmentStore,
    proxy: Proxy,
    embed_model: ModelRef,
    llm_model: ModelRef,
    system_prompt: String,
}

impl Knowledge {
    pub fn new(store: FragmentStore, proxy: Proxy, embed_model: ModelRef, llm_model: ModelRef) -> Self {
        Self {
            store,
            proxy,
            embed_model,
            llm_model,
            system_prompt: String::new(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn store(&self) -> &FragmentStore {
        &self.store
    }

    /// Embeds and stores `content` unless the exact same content is already
    /// stored under `(label, name)`.
    pub fn add(&self, label: &str, name: &str, content: &str) -> Result<AddOutcome> {
        if !self.store.is_dirty(label, name, content)? {
            debug!(label, name, "skipping already existing fragment");
            return Ok(AddOutcome::Unchanged);
        }

        debug!(label, name, len = content.len(), "embedding fragment");
        let vector = self
            .proxy
            .embed(content, &self.embed_model, EmbedPurpose::Document)?;

        let fragment = self.store.upsert(
            label,
            name,
            content,
            &self.embed_model.to_string(),
            &vector,
        )?;
        if !bitwise_eq(&fragment.embedding_vector, &vector) {
            return Err(CodecError::RoundTrip.into());
        }

        info!(id = fragment.id, label, name, "added fragment");
        Ok(AddOutcome::Stored(fragment))
    }

    /// Adds a UTF-8 text file, named by its cleaned path.
    pub fn add_file(&self, path: impl AsRef<Path>, label: &str) -> Result<AddOutcome> {
        let path = path.as_ref();
        debug!(file = %path.display(), "reading file");
        let content = std::fs::read_to_string(path)?;
        self.add(label, &clean_name(path), &content)
    }

    /// Embeds `question` as a query and merges the nearest fragments for every limit.
    pub fn search(&self, question: &str, limits: &[Limit]) -> Result<Vec<Fragment>> {
        let vector = self
            .proxy
            .embed(question, &self.embed_model, EmbedPurpose::Query)?;
        let fragments = search(&self.store, &vector, limits)?;

        for fragment in &fragments {
            debug!(id = fragment.id, label = %fragment.label, name = %fragment.name, "found fragment");
        }
        Ok(fragments)
    }

    /// Answers `question` from the fragments found for `limits`.
    pub fn ask(&self, question: &str, limits: &[Limit]) -> Result<Answer> {
        let fragments = self.search(question, limits)?;
        let request = GenerationRequest {
            system: self.system_instructions(),
            prompts: build_prompts(&fragments, question),
            json_output: true,
        };

        let generation = self.proxy.generate(&self.llm_model, &request)?;
        let (answer, confidence_score) = match serde_json::from_str::<AnswerBody>(&generation.text) {
            Ok(body) => (body.answer, body.confidence_score),
            Err(err) => {
                warn!(error = %err, "model reply is not the requested JSON, using it verbatim");
                (generation.text, None)
            }
        };

        info!(
            tokens_input = generation.usage.input_tokens,
            tokens_output = generation.usage.output_tokens,
            tokens_total = generation.usage.total_tokens,
            model = %generation.model,
            confidence = ?confidence_score,
            "llm statistics"
        );

        Ok(Answer {
            answer,
            confidence_score,
            model: generation.model,
            usage: generation.usage,
        })
    }

    fn system_instructions(&self) -> String {
        if self.system_prompt.trim().is_empty() {
            ANSWER_FORMAT.to_string()
        } else {
            format!("{}\n\n{}", self.system_prompt, ANSWER_FORMAT)
        }
    }
}

/// One prompt per fragment, tagged with its label, then the question.
pub fn build_prompts(fragments: &[Fragment], question: &str) -> Vec<String> {
    fragments
        .iter()
        .map(|f| format!("<{label}-document> {} </{label}-document>", f.content, label = f.label))
        .chain(std::iter::once(format!("<user-question> {question} </user-question>")))
        .collect()
}

/// Lexically cleaned path used as a fragment name: `.` segments and repeated
/// separators are dropped.
fn clean_name(path: &Path) -> String {
    let mut cleaned: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match cleaned.last() {
                Some(Component::Normal(_)) => {
                    cleaned.pop();
                }
                // `..` above the root is the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => cleaned.push(component),
            },
            _ => cleaned.push(component),
        }
    }

    let cleaned: PathBuf = cleaned.into_iter().collect();
    if cleaned.as_os_str().is_empty() {
        ".".to_string()
    } else {
        cleaned.to_string_lossy().into_owned()
    }
}

fn bitwise_eq(left: &[f64], right: &[f64]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| l.to_bits() == r.to_bits())
}
