//! HTTP handlers: telemetry snapshot, model listing, chat completions.

use super::AppState;
use crate::error::AppError;
use crate::models::{ChatCompletionChunk, ChatCompletionRequest, ModelList};
use crate::proxy::{translate_request, StreamEngine, TranslatedRequest};
use crate::upstream::SseStream;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub async fn handle_root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let telemetry = state.telemetry.snapshot();
    let pool = state.pool.stats();

    let mut body = serde_json::json!({
        "message": "zgate",
        "version": env!("CARGO_PKG_VERSION"),
        "telemetry": {
            "uptime": telemetry.uptime,
            "total_requests": telemetry.total_requests,
            "rpm": telemetry.rpm,
            "total_input_tokens": telemetry.total_input_tokens,
            "total_output_tokens": telemetry.total_output_tokens,
            "avg_input_tokens": telemetry.avg_input_tokens,
            "avg_output_tokens": telemetry.avg_output_tokens,
            "valid_tokens": pool.valid_credentials,
            "multimodal_calls": pool.multimodal_calls,
            "total_calls": pool.total_calls,
            "success_calls": pool.success_calls,
            "success_rate": pool.success_rate,
            "model_stats": telemetry.model_stats,
        }
    });
    if !state.config.note.is_empty() {
        body["note"] = serde_json::Value::String(state.config.note.clone());
    }
    Json(body)
}

pub async fn handle_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list".to_string(),
        data: state.registry.list(),
    })
}

pub async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid request body: {}", e)))?;

    let translated = translate_request(
        &request,
        &state.registry,
        &state.pool,
        &state.upstream,
        &state.config,
    )
    .await?;

    let upstream_response = match state
        .upstream
        .send_chat(&translated.body, &translated.credential, &translated.ctx)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            state.pool.record_call(false, translated.multimodal);
            return Err(e);
        }
    };

    let engine = StreamEngine::new(
        request.model.clone(),
        state.config.show_thinking,
        state.config.scan_limit,
        translated.prompt_tokens,
    );

    if request.is_streaming() {
        stream_response(state, request.model, translated, upstream_response, engine)
    } else {
        collect_response(state, request.model, translated, upstream_response, engine).await
    }
}

fn chunks_to_sse(chunks: &[ChatCompletionChunk]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for chunk in chunks {
        if let Ok(json) = serde_json::to_string(chunk) {
            bytes.extend_from_slice(b"data: ");
            bytes.extend_from_slice(json.as_bytes());
            bytes.extend_from_slice(b"\n\n");
        }
    }
    bytes
}

/// Streaming mode: map upstream SSE payloads through the engine and emit
/// OpenAI chunks as they form. Dropping the response body cancels the
/// upstream request with it.
fn stream_response(
    state: Arc<AppState>,
    model: String,
    translated: TranslatedRequest,
    upstream_response: reqwest::Response,
    engine: StreamEngine,
) -> Result<Response, AppError> {
    let engine = Arc::new(Mutex::new(engine));
    let sse = SseStream::new(upstream_response.bytes_stream());

    let map_engine = engine.clone();
    let mapped = sse.map(move |result| match result {
        Ok(payload) => {
            let mut engine = map_engine.lock().unwrap_or_else(|e| e.into_inner());
            Ok(Bytes::from(chunks_to_sse(&engine.process_payload(&payload))))
        }
        Err(e) => {
            warn!("upstream stream error: {}", e);
            Err(std::io::Error::other(e.to_string()))
        }
    });

    let multimodal = translated.multimodal;
    let finalized = mapped.chain(futures::stream::once(async move {
        let mut engine = engine.lock().unwrap_or_else(|e| e.into_inner());
        let mut bytes = chunks_to_sse(&engine.finish());
        bytes.extend_from_slice(b"data: [DONE]\n\n");

        let usage = engine.usage();
        state
            .telemetry
            .record_request(usage.prompt_tokens, usage.completion_tokens, &model);
        state.pool.record_call(true, multimodal);

        Ok::<Bytes, std::io::Error>(Bytes::from(bytes))
    }));

    let response = Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(Body::from_stream(finalized))
        .map_err(|e| AppError::UpstreamTransport(e.to_string()))?;
    Ok(response)
}

/// Non-streaming mode: drive the same state machine to completion and
/// return one envelope.
async fn collect_response(
    state: Arc<AppState>,
    model: String,
    translated: TranslatedRequest,
    upstream_response: reqwest::Response,
    mut engine: StreamEngine,
) -> Result<Response, AppError> {
    let mut sse = SseStream::new(upstream_response.bytes_stream());
    while let Some(item) = sse.next().await {
        match item {
            Ok(payload) => {
                engine.process_payload(&payload);
                if engine.is_finished() {
                    break;
                }
            }
            Err(e) => {
                debug!("upstream body ended early: {}", e);
                break;
            }
        }
    }
    engine.finish();

    let usage = engine.usage();
    state
        .telemetry
        .record_request(usage.prompt_tokens, usage.completion_tokens, &model);
    state.pool.record_call(true, translated.multimodal);

    Ok(Json(engine.into_response()).into_response())
}
