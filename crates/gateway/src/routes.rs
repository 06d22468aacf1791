//! Ingress routes (§6): one handler per documented path, translating the
//! caller's dialect through `DispatchEngine` and back. Auth and streaming
//! plumbing follow the ancestor service's `handle_chat` shape.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use proxy_core::dispatch::{DispatchEngine, DispatchOutcome, ProxyOptions};
use proxy_core::transformer::{StreamEmitContext, StreamParseContext, Transformer};

use crate::error::ApiError;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = if state.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins = state
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect::<Vec<_>>();
        CorsLayer::new().allow_origin(origins).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
    };

    Router::new()
        .route("/health", get(health))
        .route("/providers", get(providers))
        .route("/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/messages", post(messages))
        .route("/v1/generateContent", post(generate_content))
        .route("/v1/auto", post(auto))
        .route("/v1/proxy", post(proxy))
        .route("/v1/responses", post(responses))
        .route("/backend-api/codex/responses", post(codex_responses))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn providers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "providers": state.dispatch.registry.names() }))
}

/// Live model-list fetching is an external collaborator this gateway
/// doesn't own (out of scope); this is a static placeholder naming the
/// configured providers so clients can at least discover what's routable.
async fn models(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<Value> = state
        .dispatch
        .registry
        .names()
        .into_iter()
        .map(|id| json!({ "id": id, "object": "model" }))
        .collect();
    Json(json!({ "object": "list", "data": models }))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": { "message": message } }))).into_response()
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.auth_key else {
        return Ok(());
    };
    let Some(header) = headers.get("authorization") else {
        return Err(unauthorized("missing authorization"));
    };
    let Ok(value) = header.to_str() else {
        return Err(unauthorized("invalid authorization header"));
    };
    if !value.starts_with("Bearer ") || &value[7..] != expected {
        return Err(unauthorized("invalid API key"));
    }
    Ok(())
}

fn base_options(headers: &HeaderMap) -> ProxyOptions {
    ProxyOptions {
        target_provider: header_str(headers, "x-target-provider"),
        target_model: header_str(headers, "x-target-model"),
        api_key: header_str(headers, "x-api-key"),
        session_id: header_str(headers, "x-session-id"),
        ..ProxyOptions::default()
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;
    let options = base_options(&headers);
    dispatch_and_respond(state, body, options).await.map_err(IntoResponse::into_response)
}

async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;
    let mut options = base_options(&headers);
    options.source_format = Some("anthropic".to_string());
    if options.target_provider.is_none() {
        options.target_provider = Some("anthropic".to_string());
    }
    dispatch_and_respond(state, body, options).await.map_err(IntoResponse::into_response)
}

async fn generate_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;
    let mut options = base_options(&headers);
    if options.target_provider.is_none() {
        options.target_provider = Some("gemini".to_string());
    }
    dispatch_and_respond(state, body, options).await.map_err(IntoResponse::into_response)
}

async fn auto(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;
    let detected = DispatchEngine::detect_format(&body)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, Json(json!({ "error": { "message": "unrecognized request format" } }))).into_response())?;
    let mut options = base_options(&headers);
    options.source_format = Some(detected.to_string());
    if options.target_provider.is_none() {
        options.target_provider = Some(detected.to_string());
    }
    dispatch_and_respond(state, body, options).await.map_err(IntoResponse::into_response)
}

async fn proxy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;
    let options = base_options(&headers);
    if options.target_provider.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": "X-Target-Provider header is required" } })),
        )
            .into_response());
    }
    dispatch_and_respond(state, body, options).await.map_err(IntoResponse::into_response)
}

async fn responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;
    let mut options = base_options(&headers);
    options.source_format = Some("responses".to_string());
    if options.target_provider.is_none() {
        options.target_provider = Some("openai-web".to_string());
    }
    dispatch_and_respond(state, body, options).await.map_err(IntoResponse::into_response)
}

async fn codex_responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, Response> {
    authorize(&state, &headers)?;
    let mut options = base_options(&headers);
    options.source_format = Some("responses".to_string());
    options.target_provider = Some("openai-web".to_string());
    dispatch_and_respond(state, body, options).await.map_err(IntoResponse::into_response)
}

async fn dispatch_and_respond(state: AppState, body: Value, options: ProxyOptions) -> Result<Response, ApiError> {
    match state.dispatch.dispatch(body, options).await? {
        DispatchOutcome::Buffered(value) => Ok(Json(value).into_response()),
        DispatchOutcome::Streaming {
            body,
            parsing,
            source,
            session_id,
            model,
            context_text,
        } => Ok(stream_response(state.dispatch.clone(), parsing, source, body, model, session_id, context_text)),
    }
}

struct SseState {
    byte_stream: std::pin::Pin<Box<dyn futures::Stream<Item = reqwest::Result<Bytes>> + Send>>,
    processor: proxy_core::stream::StreamProcessor,
    parse_ctx: StreamParseContext,
    emit_ctx: StreamEmitContext,
    parsing: Arc<dyn Transformer>,
    source: Arc<dyn Transformer>,
    pending: VecDeque<String>,
    done: bool,
}

/// Pre-framed SSE text comes back from `StreamProcessor` already shaped for
/// the client's dialect, so this forwards raw bytes rather than routing
/// through axum's own `Sse` event encoder (which would frame it a second
/// time).
fn stream_response(
    dispatch: Arc<DispatchEngine>,
    parsing: Arc<dyn Transformer>,
    source: Arc<dyn Transformer>,
    resp: reqwest::Response,
    model: String,
    session_id: String,
    context_text: String,
) -> Response {
    let processor = dispatch.stream_processor(&model, session_id, context_text);
    let state = SseState {
        byte_stream: Box::pin(resp.bytes_stream()),
        processor,
        parse_ctx: StreamParseContext::default(),
        emit_ctx: StreamEmitContext::default(),
        parsing,
        source,
        pending: VecDeque::new(),
        done: false,
    };

    let events = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok::<_, std::convert::Infallible>(Bytes::from(event)), st));
            }
            if st.done {
                return None;
            }

            match st.byte_stream.next().await {
                Some(Ok(chunk)) => {
                    let result = st
                        .processor
                        .process_bytes(&chunk, st.parsing.as_ref(), st.source.as_ref(), &mut st.parse_ctx, &mut st.emit_ctx)
                        .await;
                    match result {
                        Ok(out) => {
                            st.pending.extend(out);
                            continue;
                        }
                        Err(e) => {
                            st.done = true;
                            return Some((Ok(Bytes::from(sse_error(&e.to_string()))), st));
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Ok(Bytes::from(sse_error(&e.to_string()))), st));
                }
                None => {
                    let flushed = st
                        .processor
                        .flush(st.parsing.as_ref(), st.source.as_ref(), &mut st.parse_ctx, &mut st.emit_ctx)
                        .await
                        .unwrap_or_default();
                    st.pending.extend(flushed);
                    st.done = true;
                    continue;
                }
            }
        }
    });

    let body = Body::from_stream(events);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .expect("valid SSE response")
}

fn sse_error(message: &str) -> String {
    let payload = json!({ "error": { "message": message } });
    format!("event: error\ndata: {payload}\n\n")
}
