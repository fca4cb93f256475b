//! Async client library for Ollama-compatible LLM inference servers.
//!
//! Every operation goes through the same pipeline: resolve the configured
//! backend host, build one HTTP request, dispatch it buffered or streaming,
//! and normalize failures into a single error type. Streaming endpoints
//! return a lazy stream of decoded NDJSON records.
//!
//! ```no_run
//! use futures::StreamExt;
//! use ollama_client::{Client, GenerateRequest};
//!
//! # async fn run() -> Result<(), ollama_client::Error> {
//! let client = Client::new("http://127.0.0.1:11434");
//! let mut stream = client
//!     .generate_stream(GenerateRequest::new("llama3.2", "Why is the sky blue?"))
//!     .await?;
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk?.response);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod stream;

pub use api::{
    ChatRequest, ChatResponse, EmbedInput, EmbedRequest, EmbedResponse, GenerateRequest,
    GenerateResponse, Message, ModelDetails, ModelOptions, ModelSummary, PsResponse, PullProgress,
    PullRequest, Role, RunningModel, ShowRequest, ShowResponse, TagsResponse, VersionResponse,
};
pub use client::{Client, ResponseStream};
pub use config::{ConfigError, ConnectionConfig, ConnectionStore, DEFAULT_HOST};
pub use error::Error;
pub use stream::NdjsonStream;
