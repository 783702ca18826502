use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use docpipe_core::{PipelineApi, PipelineError, Visibility};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

pub struct AppState<S> {
    pub pipeline: Arc<S>,
    pub shared_secret: String,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            shared_secret: self.shared_secret.clone(),
        }
    }
}

/// One route per pipeline stage, plus the batch runner and the
/// question-answering read path. Each stage accepts a document id and its
/// visibility class and returns a structured per-stage result.
pub fn create_router<S>(state: AppState<S>) -> Router
where
    S: PipelineApi + 'static,
{
    Router::new()
        .route("/extract", post(trigger_extract::<S>))
        .route("/chunk", post(trigger_chunk::<S>))
        .route("/embed", post(trigger_embed::<S>))
        .route("/continue-processing", post(continue_processing::<S>))
        .route("/ask", post(ask::<S>))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StageRequest {
    document_id: Uuid,
    visibility: Visibility,
}

async fn trigger_extract<S>(
    State(state): State<AppState<S>>,
    Json(request): Json<StageRequest>,
) -> Result<Response, ApiError>
where
    S: PipelineApi,
{
    let outcome = state
        .pipeline
        .extract(request.visibility, request.document_id)
        .await
        .map_err(|error| ApiError::new("extract", error))?;
    Ok(Json(outcome).into_response())
}

async fn trigger_chunk<S>(
    State(state): State<AppState<S>>,
    Json(request): Json<StageRequest>,
) -> Result<Response, ApiError>
where
    S: PipelineApi,
{
    let outcome = state
        .pipeline
        .chunk(request.visibility, request.document_id)
        .await
        .map_err(|error| ApiError::new("chunk", error))?;
    Ok(Json(outcome).into_response())
}

async fn trigger_embed<S>(
    State(state): State<AppState<S>>,
    Json(request): Json<StageRequest>,
) -> Result<Response, ApiError>
where
    S: PipelineApi,
{
    let outcome = state
        .pipeline
        .embed(request.visibility, request.document_id)
        .await
        .map_err(|error| ApiError::new("embed", error))?;
    Ok(Json(outcome).into_response())
}

/// The batch runner is the only unattended entry point, so it alone
/// requires the shared-secret bearer credential.
async fn continue_processing<S>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
) -> Result<Response, ApiError>
where
    S: PipelineApi,
{
    let presented = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    if presented != Some(format!("Bearer {}", state.shared_secret).as_str()) {
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing or invalid bearer credential"})),
        )
            .into_response());
    }

    let summary = state
        .pipeline
        .continue_processing()
        .await
        .map_err(|error| ApiError::new("continue-processing", error))?;
    Ok(Json(summary).into_response())
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default = "default_visibility")]
    visibility: Visibility,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_visibility() -> Visibility {
    Visibility::Private
}

fn default_top_k() -> usize {
    8
}

async fn ask<S>(
    State(state): State<AppState<S>>,
    Json(request): Json<AskRequest>,
) -> Result<Response, ApiError>
where
    S: PipelineApi,
{
    let answer = state
        .pipeline
        .answer(request.visibility, &request.question, request.top_k)
        .await
        .map_err(|error| ApiError::new("answer", error))?;
    Ok(Json(answer).into_response())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "name": "docpipe",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub struct ApiError {
    stage: &'static str,
    source: PipelineError,
}

impl ApiError {
    fn new(stage: &'static str, source: PipelineError) -> Self {
        Self { stage, source }
    }

    fn status(&self) -> StatusCode {
        match &self.source {
            PipelineError::InvalidArgument(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::DocumentNotFound(_) | PipelineError::NoChunksFound(_) => {
                StatusCode::NOT_FOUND
            }
            PipelineError::StageInProgress(_) => StatusCode::CONFLICT,
            PipelineError::PartialEmbeddingFailure { .. }
            | PipelineError::CompletionFailed(_)
            | PipelineError::EmbeddingFailed(_)
            | PipelineError::Store(_)
            | PipelineError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Upstream transport details stay in the logs; the caller gets an
    /// actionable message without internals or credentials.
    fn message(&self) -> String {
        match &self.source {
            PipelineError::Store(_) | PipelineError::Http(_) => {
                "upstream service unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(stage = self.stage, error = %self.source, "stage trigger failed");
        }
        (
            status,
            Json(json!({
                "stage": self.stage,
                "error": self.message(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use docpipe_core::{
        Answer, ChunkOutcome, EmbedOutcome, ExtractOutcome, RunSummary,
    };
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct StubPipeline {
        calls: Mutex<Vec<String>>,
        missing_document: bool,
    }

    impl StubPipeline {
        fn recorded(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().expect("lock").push(call.to_string());
        }
    }

    #[async_trait]
    impl PipelineApi for StubPipeline {
        async fn extract(
            &self,
            _visibility: Visibility,
            id: Uuid,
        ) -> Result<ExtractOutcome, PipelineError> {
            self.record("extract");
            if self.missing_document {
                return Err(PipelineError::DocumentNotFound(id));
            }
            Ok(ExtractOutcome {
                document_id: id,
                chars: 3_000,
                pages: 3,
            })
        }

        async fn chunk(
            &self,
            _visibility: Visibility,
            id: Uuid,
        ) -> Result<ChunkOutcome, PipelineError> {
            self.record("chunk");
            Ok(ChunkOutcome {
                document_id: id,
                new_chunks: 3,
                dropped_blocks: 0,
                already_chunked: false,
            })
        }

        async fn embed(
            &self,
            _visibility: Visibility,
            id: Uuid,
        ) -> Result<EmbedOutcome, PipelineError> {
            self.record("embed");
            Ok(EmbedOutcome {
                document_id: id,
                embedded: 3,
                remaining: 0,
            })
        }

        async fn continue_processing(&self) -> Result<RunSummary, PipelineError> {
            self.record("continue-processing");
            Ok(RunSummary::default())
        }

        async fn answer(
            &self,
            _visibility: Visibility,
            _question: &str,
            _top_k: usize,
        ) -> Result<Answer, PipelineError> {
            self.record("answer");
            Ok(Answer {
                text: "stub answer".to_string(),
                sources: vec!["chunk-1".to_string()],
                context_chunks: 1,
            })
        }
    }

    fn app_with(stub: Arc<StubPipeline>) -> Router {
        create_router(AppState {
            pipeline: stub,
            shared_secret: "s3cret".to_string(),
        })
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn extract_route_returns_the_stage_outcome() {
        let stub = Arc::new(StubPipeline::default());
        let app = app_with(stub.clone());
        let document_id = Uuid::new_v4();

        let response = app
            .oneshot(json_request(
                "/extract",
                json!({"document_id": document_id, "visibility": "private"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(parsed["chars"], 3_000);
        assert_eq!(parsed["pages"], 3);
        assert_eq!(stub.recorded(), vec!["extract".to_string()]);
    }

    #[tokio::test]
    async fn invalid_visibility_is_rejected_before_any_call() {
        let stub = Arc::new(StubPipeline::default());
        let app = app_with(stub.clone());

        let response = app
            .oneshot(json_request(
                "/chunk",
                json!({"document_id": Uuid::new_v4(), "visibility": "internal"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(stub.recorded().is_empty());
    }

    #[tokio::test]
    async fn unknown_documents_map_to_not_found_with_the_stage_named() {
        let stub = Arc::new(StubPipeline {
            missing_document: true,
            ..StubPipeline::default()
        });
        let app = app_with(stub);

        let response = app
            .oneshot(json_request(
                "/extract",
                json!({"document_id": Uuid::new_v4(), "visibility": "public"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(parsed["stage"], "extract");
    }

    #[tokio::test]
    async fn continue_processing_requires_the_shared_secret() {
        let stub = Arc::new(StubPipeline::default());
        let app = app_with(stub.clone());

        let unauthenticated = Request::builder()
            .method(Method::POST)
            .uri("/continue-processing")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(unauthenticated).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .method(Method::POST)
            .uri("/continue-processing")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(wrong).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(stub.recorded().is_empty());

        let authorized = Request::builder()
            .method(Method::POST)
            .uri("/continue-processing")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(authorized).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(stub.recorded(), vec!["continue-processing".to_string()]);
    }

    #[tokio::test]
    async fn ask_route_answers_with_sources() {
        let stub = Arc::new(StubPipeline::default());
        let app = app_with(stub);

        let response = app
            .oneshot(json_request("/ask", json!({"question": "where is the valve?"})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(parsed["text"], "stub answer");
        assert_eq!(parsed["sources"][0], "chunk-1");
    }

    #[tokio::test]
    async fn health_reports_name_and_version() {
        let stub = Arc::new(StubPipeline::default());
        let app = app_with(stub);

        let request = Request::builder()
            .method(Method::GET)
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(parsed["name"], "docpipe");
    }
}
