//! Request dispatch against the configured backend.

use std::pin::Pin;

use futures::Stream;
use reqwest::Method;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::{
    ChatRequest, ChatResponse, CopyRequest, DeleteRequest, EmbedRequest, EmbedResponse,
    GenerateRequest, GenerateResponse, PsResponse, PullProgress, PullRequest, ShowRequest,
    ShowResponse, TagsResponse, VersionResponse, ensure_model_name,
};
use crate::config::{ConnectionConfig, ConnectionStore};
use crate::error::Error;
use crate::stream::NdjsonStream;

/// A lazily decoded streaming response.
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Error>> + Send>>;

/// Async client for one Ollama-compatible backend.
///
/// Each operation is one HTTP round trip; there is no retry, caching or
/// shared state between calls, so clones of a client may be used
/// concurrently without coordination.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    host: String,
}

impl Client {
    /// Client for `host`, with a trailing `/` trimmed if present.
    pub fn new(host: impl AsRef<str>) -> Self {
        Self::with_http_client(reqwest::Client::new(), host)
    }

    /// Client reusing a caller-configured `reqwest::Client`.
    ///
    /// Use this to bound lightweight calls with a request timeout; the
    /// client itself imposes none.
    pub fn with_http_client(http: reqwest::Client, host: impl AsRef<str>) -> Self {
        Self {
            http,
            host: host.as_ref().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(&config.host)
    }

    /// Resolve the persisted connection and build a client for it.
    pub async fn from_store(store: &ConnectionStore) -> Self {
        Self::from_config(&store.resolve().await)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    // ------------------------------------------------------------------
    // Dispatch core
    // ------------------------------------------------------------------

    /// One round trip. Non-success responses are turned into a normalized
    /// [`Error::Request`] before any body decoding happens.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<reqwest::Response, Error> {
        let url = format!("{}{}", self.host, path);
        debug!(%method, %url, "dispatching request");

        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let fallback = format!("server returned status {status}");
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Request(
                extract_server_error(&body).unwrap_or(fallback),
            ));
        }
        Ok(response)
    }

    /// Buffered dispatch: decode the entire response body as one document.
    async fn invoke<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<T, Error> {
        let response = self.send(method, path, body).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Request(e.to_string()))
    }

    /// Streaming dispatch: hand the response body to the NDJSON decoder
    /// without buffering it. Decoding happens as the caller consumes the
    /// stream.
    async fn invoke_stream<T, R>(&self, path: &str, request: &R) -> Result<ResponseStream<T>, Error>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize,
    {
        let body = WithStream {
            request,
            stream: true,
        };
        let response = self.send(Method::POST, path, Some(&body)).await?;
        Ok(Box::pin(NdjsonStream::new(response.bytes_stream())))
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// `GET /api/version`.
    pub async fn version(&self) -> Result<VersionResponse, Error> {
        self.invoke(Method::GET, "/api/version", NO_BODY).await
    }

    /// `GET /api/tags` — models available locally.
    pub async fn tags(&self) -> Result<TagsResponse, Error> {
        self.invoke(Method::GET, "/api/tags", NO_BODY).await
    }

    /// `POST /api/show` — details for one model.
    pub async fn show(&self, request: ShowRequest) -> Result<ShowResponse, Error> {
        ensure_model_name(&request.model)?;
        self.invoke(Method::POST, "/api/show", Some(&request)).await
    }

    /// `GET /api/ps` — models currently loaded into memory.
    pub async fn ps(&self) -> Result<PsResponse, Error> {
        self.invoke(Method::GET, "/api/ps", NO_BODY).await
    }

    /// `POST /api/pull`, waiting for completion. The returned document is
    /// the final status (`"success"` on a completed pull).
    pub async fn pull(&self, request: PullRequest) -> Result<PullProgress, Error> {
        ensure_model_name(&request.model)?;
        let body = WithStream {
            request: &request,
            stream: false,
        };
        self.invoke(Method::POST, "/api/pull", Some(&body)).await
    }

    /// `POST /api/pull` in streaming mode, yielding progress documents as
    /// the download advances.
    pub async fn pull_stream(
        &self,
        request: PullRequest,
    ) -> Result<ResponseStream<PullProgress>, Error> {
        ensure_model_name(&request.model)?;
        self.invoke_stream("/api/pull", &request).await
    }

    /// `DELETE /api/delete` — remove a local model. The backend replies with
    /// an empty body on success.
    pub async fn delete(&self, model: impl Into<String>) -> Result<(), Error> {
        let request = DeleteRequest {
            model: model.into(),
        };
        ensure_model_name(&request.model)?;
        self.send(Method::DELETE, "/api/delete", Some(&request))
            .await?;
        Ok(())
    }

    /// `POST /api/copy` — duplicate a local model under a new name.
    pub async fn copy(
        &self,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Result<(), Error> {
        let request = CopyRequest {
            source: source.into(),
            destination: destination.into(),
        };
        ensure_model_name(&request.source)?;
        ensure_model_name(&request.destination)?;
        self.send(Method::POST, "/api/copy", Some(&request)).await?;
        Ok(())
    }

    /// `POST /api/generate`, waiting for the complete response.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, Error> {
        request.validate()?;
        let body = WithStream {
            request: &request,
            stream: false,
        };
        self.invoke(Method::POST, "/api/generate", Some(&body))
            .await
    }

    /// `POST /api/generate` in streaming mode. Chunks are decoded lazily as
    /// the returned stream is consumed.
    pub async fn generate_stream(
        &self,
        request: GenerateRequest,
    ) -> Result<ResponseStream<GenerateResponse>, Error> {
        request.validate()?;
        self.invoke_stream("/api/generate", &request).await
    }

    /// `POST /api/chat`, waiting for the complete response.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        request.validate()?;
        let body = WithStream {
            request: &request,
            stream: false,
        };
        self.invoke(Method::POST, "/api/chat", Some(&body)).await
    }

    /// `POST /api/chat` in streaming mode.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<ResponseStream<ChatResponse>, Error> {
        request.validate()?;
        self.invoke_stream("/api/chat", &request).await
    }

    /// `POST /api/embed`.
    pub async fn embed(&self, request: EmbedRequest) -> Result<EmbedResponse, Error> {
        request.validate()?;
        self.invoke(Method::POST, "/api/embed", Some(&request))
            .await
    }
}

/// Marker for bodyless requests, keeping `send`'s signature inferable.
const NO_BODY: Option<&()> = None;

/// Adds the `stream` flag next to the request's own fields on the wire.
#[derive(Serialize)]
struct WithStream<'a, R: Serialize> {
    #[serde(flatten)]
    request: &'a R,
    stream: bool,
}

/// Best-effort extraction of the `error` field from a server error payload.
///
/// Fallback chain: a JSON object body with a non-empty string `error` field
/// wins; any parse failure here is swallowed so the transport-level message
/// is kept.
fn extract_server_error(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        serde_json::Value::String(message) if !message.is_empty() => Some(message.clone()),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use futures::StreamExt;
    use serde_json::{Value, json};

    use crate::api::Message;

    /// Bind a mock backend on a loopback port and return its base URL.
    async fn spawn_backend(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn trailing_slash_is_trimmed_from_host() {
        let client = Client::new("http://localhost:11434/");
        assert_eq!(client.host(), "http://localhost:11434");
    }

    #[test]
    fn extract_server_error_fallback_chain() {
        assert_eq!(
            extract_server_error(r#"{"error":"model not found"}"#),
            Some("model not found".to_string())
        );
        assert_eq!(extract_server_error(r#"{"error":""}"#), None);
        assert_eq!(extract_server_error(r#"{"error":42}"#), None);
        assert_eq!(extract_server_error("not json"), None);
        assert_eq!(extract_server_error(r#"{"detail":"other"}"#), None);
    }

    #[tokio::test]
    async fn buffered_generate_returns_decoded_value() {
        let app = Router::new().route(
            "/api/generate",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["stream"], false);
                assert_eq!(body["model"], "llama3.2");
                Json(json!({"response": "hi", "done": true}))
            }),
        );
        let client = Client::new(spawn_backend(app).await);

        let response = client
            .generate(GenerateRequest::new("llama3.2", "hello"))
            .await
            .unwrap();
        assert_eq!(response.response, "hi");
        assert!(response.done);
    }

    #[tokio::test]
    async fn server_error_payload_replaces_transport_message() {
        let app = Router::new().route(
            "/api/generate",
            post(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": "model not found"})),
                )
            }),
        );
        let client = Client::new(spawn_backend(app).await);

        let err = client
            .generate(GenerateRequest::new("missing", "hello"))
            .await
            .unwrap_err();
        match err {
            Error::Request(message) => assert_eq!(message, "model not found"),
            other => panic!("expected Request error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unstructured_error_body_keeps_transport_message() {
        let app = Router::new().route(
            "/api/tags",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let client = Client::new(spawn_backend(app).await);

        let err = client.tags().await.unwrap_err();
        match err {
            Error::Request(message) => assert!(message.contains("500"), "message: {message}"),
            other => panic!("expected Request error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_failure_is_normalized() {
        // Nothing listens here; the send itself fails.
        let client = Client::new("http://127.0.0.1:9");
        let err = client.version().await.unwrap_err();
        assert!(matches!(err, Error::Request(_)));
    }

    #[tokio::test]
    async fn streaming_chat_skips_malformed_frames() {
        let app = Router::new().route(
            "/api/chat",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["stream"], true);
                concat!(
                    "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
                    "\n",
                    "not-json\n",
                    "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
                    "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
                )
            }),
        );
        let client = Client::new(spawn_backend(app).await);

        let mut stream = client
            .chat_stream(ChatRequest::new("llama3.2", vec![Message::user("hi")]))
            .await
            .unwrap();
        let mut contents = Vec::new();
        let mut saw_done = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            saw_done |= chunk.done;
            contents.push(chunk.message.map(|m| m.content).unwrap_or_default());
        }
        assert_eq!(contents, vec!["Hel", "lo", ""]);
        assert!(saw_done);
    }

    #[tokio::test]
    async fn streaming_request_failure_surfaces_at_start() {
        let app = Router::new().route(
            "/api/generate",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "missing prompt"})),
                )
            }),
        );
        let client = Client::new(spawn_backend(app).await);

        let err = client
            .generate_stream(GenerateRequest::new("llama3.2", ""))
            .await
            .map(|_| ())
            .unwrap_err();
        match err {
            Error::Request(message) => assert_eq!(message, "missing prompt"),
            other => panic!("expected Request error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pull_buffered_forces_stream_false() {
        let app = Router::new().route(
            "/api/pull",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["stream"], false);
                assert_eq!(body["model"], "llama3.2");
                Json(json!({"status": "success"}))
            }),
        );
        let client = Client::new(spawn_backend(app).await);

        let progress = client.pull(PullRequest::new("llama3.2")).await.unwrap();
        assert_eq!(progress.status, "success");
    }

    #[tokio::test]
    async fn pull_stream_yields_progress_in_order() {
        let app = Router::new().route(
            "/api/pull",
            post(|| async {
                concat!(
                    "{\"status\":\"pulling manifest\"}\n",
                    "{\"status\":\"downloading\",\"digest\":\"sha256:abc\",\"total\":10,\"completed\":5}\n",
                    "{\"status\":\"success\"}\n",
                )
            }),
        );
        let client = Client::new(spawn_backend(app).await);

        let stream = client.pull_stream(PullRequest::new("llama3.2")).await.unwrap();
        let statuses: Vec<String> = stream
            .map(|p| p.unwrap().status)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(statuses, vec!["pulling manifest", "downloading", "success"]);
    }

    #[tokio::test]
    async fn delete_and_copy_tolerate_empty_bodies() {
        let app = Router::new()
            .route("/api/delete", delete(|| async { StatusCode::OK }))
            .route("/api/copy", post(|| async { StatusCode::OK }));
        let client = Client::new(spawn_backend(app).await);

        client.delete("llama3.2").await.unwrap();
        client.copy("llama3.2", "backup").await.unwrap();
    }

    #[tokio::test]
    async fn version_tags_ps_and_show_decode() {
        let app = Router::new()
            .route("/api/version", get(|| async { Json(json!({"version": "0.6.1"})) }))
            .route(
                "/api/tags",
                get(|| async { Json(json!({"models": [{"name": "llama3.2:latest"}]})) }),
            )
            .route(
                "/api/ps",
                get(|| async {
                    Json(json!({"models": [{"name": "llama3.2:latest", "size_vram": 1}]}))
                }),
            )
            .route(
                "/api/show",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["model"], "llama3.2");
                    Json(json!({"modelfile": "FROM llama3.2", "capabilities": ["completion"]}))
                }),
            );
        let client = Client::new(spawn_backend(app).await);

        assert_eq!(client.version().await.unwrap().version, "0.6.1");
        assert_eq!(client.tags().await.unwrap().models[0].name, "llama3.2:latest");
        assert_eq!(client.ps().await.unwrap().models[0].size_vram, 1);
        let show = client.show(ShowRequest::new("llama3.2")).await.unwrap();
        assert_eq!(show.capabilities.unwrap(), vec!["completion"]);
    }

    #[tokio::test]
    async fn embed_round_trip() {
        let app = Router::new().route(
            "/api/embed",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["input"], "why is the sky blue?");
                Json(json!({"model": "all-minilm", "embeddings": [[0.1, -0.2]]}))
            }),
        );
        let client = Client::new(spawn_backend(app).await);

        let response = client
            .embed(EmbedRequest::new("all-minilm", "why is the sky blue?"))
            .await
            .unwrap();
        assert_eq!(response.embeddings, vec![vec![0.1, -0.2]]);
    }

    #[tokio::test]
    async fn out_of_range_temperature_fails_before_dispatch() {
        // Host is never contacted; an invalid parameter short-circuits.
        let client = Client::new("http://127.0.0.1:9");
        let mut request = GenerateRequest::new("llama3.2", "hello");
        request.options = Some(crate::api::ModelOptions {
            temperature: Some(3.0),
            ..Default::default()
        });

        let err = client.generate(request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn concurrent_buffered_calls_complete_independently() {
        let app = Router::new()
            .route("/api/version", get(|| async { Json(json!({"version": "0.6.1"})) }))
            .route(
                "/api/tags",
                get(|| async {
                    // Stagger the responses so the calls overlap.
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Json(json!({"models": []}))
                }),
            );
        let client = Client::new(spawn_backend(app).await);

        let (version, tags) = tokio::join!(client.version(), client.tags());
        assert_eq!(version.unwrap().version, "0.6.1");
        assert!(tags.unwrap().models.is_empty());
    }
}
