//! Typed request and response payloads for the Ollama HTTP API.
//!
//! Request bodies omit unset optional fields; response types tolerate
//! missing and unknown fields so that newer backend versions stay decodable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ============================================================================
// Chat messages
// ============================================================================

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

// ============================================================================
// Model options
// ============================================================================

/// Sampling and context options shared by generate and chat requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl ModelOptions {
    /// Range checks applied before any request is dispatched.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(Error::InvalidParameter(format!(
                "temperature {t} outside [0.0, 2.0]"
            )));
        }
        if let Some(p) = self.top_p
            && !(0.0..=1.0).contains(&p)
        {
            return Err(Error::InvalidParameter(format!(
                "top_p {p} outside [0.0, 1.0]"
            )));
        }
        Ok(())
    }
}

pub(crate) fn ensure_model_name(name: &str) -> Result<(), Error> {
    if name.trim().is_empty() {
        return Err(Error::InvalidParameter(
            "model name must not be empty".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Generate
// ============================================================================

/// `POST /api/generate` request body.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Conversation context returned by a previous generate call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,
    /// Output format: `"json"` or a JSON schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ModelOptions>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            template: None,
            context: None,
            raw: None,
            format: None,
            keep_alive: None,
            options: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        ensure_model_name(&self.model)?;
        if let Some(options) = &self.options {
            options.validate()?;
        }
        Ok(())
    }
}

/// One `/api/generate` response document; in streaming mode every chunk has
/// this shape, with the counters only present once `done` is true.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub context: Option<Vec<u64>>,
    #[serde(default)]
    pub total_duration: Option<u64>,
    #[serde(default)]
    pub load_duration: Option<u64>,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub prompt_eval_duration: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub eval_duration: Option<u64>,
}

// ============================================================================
// Chat
// ============================================================================

/// `POST /api/chat` request body.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ModelOptions>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            format: None,
            keep_alive: None,
            options: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        ensure_model_name(&self.model)?;
        if let Some(options) = &self.options {
            options.validate()?;
        }
        Ok(())
    }
}

/// One `/api/chat` response document.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub total_duration: Option<u64>,
    #[serde(default)]
    pub load_duration: Option<u64>,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub prompt_eval_duration: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub eval_duration: Option<u64>,
}

// ============================================================================
// Embeddings
// ============================================================================

/// Input to `/api/embed`: one text or a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EmbedInput {
    Single(String),
    Batch(Vec<String>),
}

impl From<&str> for EmbedInput {
    fn from(text: &str) -> Self {
        Self::Single(text.to_string())
    }
}

impl From<String> for EmbedInput {
    fn from(text: String) -> Self {
        Self::Single(text)
    }
}

impl From<Vec<String>> for EmbedInput {
    fn from(texts: Vec<String>) -> Self {
        Self::Batch(texts)
    }
}

/// `POST /api/embed` request body.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedRequest {
    pub model: String,
    pub input: EmbedInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ModelOptions>,
}

impl EmbedRequest {
    pub fn new(model: impl Into<String>, input: impl Into<EmbedInput>) -> Self {
        Self {
            model: model.into(),
            input: input.into(),
            truncate: None,
            keep_alive: None,
            options: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        ensure_model_name(&self.model)?;
        if let Some(options) = &self.options {
            options.validate()?;
        }
        Ok(())
    }
}

/// `POST /api/embed` response.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbedResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub total_duration: Option<u64>,
    #[serde(default)]
    pub load_duration: Option<u64>,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
}

// ============================================================================
// Model lifecycle
// ============================================================================

/// `GET /api/tags` response.
#[derive(Debug, Clone, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelSummary>,
}

/// One locally available model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSummary {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

/// Model metadata shared by tags, ps and show responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub families: Option<Vec<String>>,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

/// `POST /api/show` request body.
#[derive(Debug, Clone, Serialize)]
pub struct ShowRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
}

impl ShowRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            verbose: None,
        }
    }
}

/// `POST /api/show` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ShowResponse {
    #[serde(default)]
    pub modelfile: String,
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
    #[serde(default)]
    pub model_info: Option<serde_json::Value>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

/// `GET /api/ps` response.
#[derive(Debug, Clone, Deserialize)]
pub struct PsResponse {
    #[serde(default)]
    pub models: Vec<RunningModel>,
}

/// One model currently loaded into memory.
#[derive(Debug, Clone, Deserialize)]
pub struct RunningModel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size_vram: u64,
}

/// `GET /api/version` response.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionResponse {
    #[serde(default)]
    pub version: String,
}

/// `POST /api/pull` request body.
#[derive(Debug, Clone, Serialize)]
pub struct PullRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
}

impl PullRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            insecure: None,
        }
    }
}

/// One `/api/pull` progress document; the final one has `status: "success"`.
#[derive(Debug, Clone, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
}

/// `POST /api/copy` request body.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CopyRequest {
    pub source: String,
    pub destination: String,
}

/// `DELETE /api/delete` request body.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct DeleteRequest {
    pub model: String,
}

// ============================================================================
// Tests
// ============================================================================
