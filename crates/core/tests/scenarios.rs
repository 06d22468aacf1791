//! End-to-end scenario tests driving `DispatchEngine` against a mocked
//! upstream (wiremock) or `StreamProcessor` directly against raw SSE bytes.
//! Each test is named after the scenario it exercises; fixture shapes are
//! kept minimal, only as rich as the assertions need.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use proxy_core::cooldown::CooldownManager;
use proxy_core::credentials::{Credential, CredentialPool, CredentialRefresher};
use proxy_core::dispatch::{DispatchEngine, DispatchOutcome, EndpointConfig, ProxyOptions};
use proxy_core::router::{ModelMapping, Router, RouterConfig};
use proxy_core::signature_cache::{InMemorySignatureStore, SignatureCacheConfig};
use proxy_core::transformer::{StreamEmitContext, StreamParseContext, TransformerRegistryBuilder};

struct NoopRefresher;

#[async_trait]
impl CredentialRefresher for NoopRefresher {
    async fn refresh(&self, _credential: &Credential) -> Result<Credential, String> {
        Err("refresh not configured in tests".to_string())
    }
}

fn credential(provider: &str) -> HashMap<String, Vec<Credential>> {
    let mut map = HashMap::new();
    map.insert(
        provider.to_string(),
        vec![Credential {
            id: "test".to_string(),
            provider: provider.to_string(),
            secret: "test-secret".to_string(),
            expires_at_ms: None,
        }],
    );
    map
}

fn registry() -> Arc<proxy_core::transformer::TransformerRegistry> {
    Arc::new(
        TransformerRegistryBuilder::new()
            .register(Arc::new(dialect_openai::OpenAiTransformer))
            .register(Arc::new(dialect_anthropic::AnthropicTransformer))
            .register(Arc::new(dialect_gemini::GeminiTransformer))
            .build(),
    )
}

/// S1: a client speaking OpenAI chat-completions targets an Anthropic
/// model; the upstream returns an Anthropic-shaped text response and the
/// client gets back an OpenAI-shaped one.
#[tokio::test]
async fn s1_openai_client_anthropic_upstream_text_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_abc123",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-opus",
            "content": [{"type": "text", "text": "Hello from mock"}],
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": 10, "output_tokens": 5}
        })))
        .mount(&mock_server)
        .await;

    let mut endpoints = HashMap::new();
    endpoints.insert(
        "anthropic".to_string(),
        EndpointConfig {
            base_url: format!("{}/v1/messages", mock_server.uri()),
            endpoint_fallbacks: Vec::new(),
        },
    );

    let engine = DispatchEngine {
        registry: registry(),
        router: Router::new(RouterConfig::default()),
        cooldowns: Arc::new(CooldownManager::new()),
        credentials: Arc::new(CredentialPool::new(credential("anthropic"))),
        signatures: Arc::new(InMemorySignatureStore::new(SignatureCacheConfig::default())),
        http: reqwest::Client::new(),
        endpoints,
        refresher: Arc::new(NoopRefresher),
    };

    let body = json!({
        "model": "claude-3-opus",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": false,
    });
    let mut options = ProxyOptions::default();
    options.source_format = Some("openai".to_string());
    options.target_provider = Some("anthropic".to_string());
    options.target_model = Some("claude-3-opus".to_string());

    let outcome = engine.dispatch(body, options).await.expect("dispatch succeeds");
    let DispatchOutcome::Buffered(value) = outcome else {
        panic!("expected a buffered response");
    };

    assert_eq!(value["choices"][0]["message"]["content"], "Hello from mock");
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
}

/// S2: a client speaking Anthropic messages targets a Gemini model that
/// replies with a function call; the client gets back an Anthropic
/// `tool_use` block.
#[tokio::test]
async fn s2_anthropic_client_gemini_upstream_tool_call_round_trip() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-pro:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}]
                },
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 4, "totalTokenCount": 12}
        })))
        .mount(&mock_server)
        .await;

    let mut endpoints = HashMap::new();
    endpoints.insert(
        "gemini".to_string(),
        EndpointConfig {
            base_url: format!("{}/v1beta/models/gemini-pro:generateContent", mock_server.uri()),
            endpoint_fallbacks: Vec::new(),
        },
    );

    let engine = DispatchEngine {
        registry: registry(),
        router: Router::new(RouterConfig::default()),
        cooldowns: Arc::new(CooldownManager::new()),
        credentials: Arc::new(CredentialPool::new(credential("gemini"))),
        signatures: Arc::new(InMemorySignatureStore::new(SignatureCacheConfig::default())),
        http: reqwest::Client::new(),
        endpoints,
        refresher: Arc::new(NoopRefresher),
    };

    let body = json!({
        "model": "gemini-pro",
        "system": "be helpful",
        "messages": [{
            "role": "user",
            "content": [{"type": "text", "text": "what's the weather in Paris?"}]
        }],
        "tools": [{
            "name": "get_weather",
            "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
        }],
        "max_tokens": 1024,
        "stream": false,
    });
    let mut options = ProxyOptions::default();
    options.source_format = Some("anthropic".to_string());
    options.target_provider = Some("gemini".to_string());
    options.target_model = Some("gemini-pro".to_string());

    let outcome = engine.dispatch(body, options).await.expect("dispatch succeeds");
    let DispatchOutcome::Buffered(value) = outcome else {
        panic!("expected a buffered response");
    };

    assert_eq!(value["stop_reason"], "tool_use");
    let content = value["content"].as_array().expect("content array");
    let tool_use = content
        .iter()
        .find(|b| b["type"] == "tool_use")
        .expect("a tool_use block");
    assert_eq!(tool_use["name"], "get_weather");
    assert_eq!(tool_use["input"]["city"], "Paris");
}

/// S3: an Anthropic-dialect upstream stream with a thinking block followed
/// by a tool call is re-framed with balanced content_block_start/stop
/// pairs, monotonically increasing indices, and a stop_reason patched to
/// tool_use even though the upstream's message_delta said end_turn.
#[tokio::test]
async fn s3_anthropic_stream_thinking_then_tool_use_block_balance() {
    let transformer = dialect_anthropic::transformer();
    let mut processor = proxy_core::stream::StreamProcessor::new(None);
    let mut parse_ctx = StreamParseContext::default();
    let mut emit_ctx = StreamEmitContext::default();

    let upstream = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-opus\",\"usage\":{\"input_tokens\":5,\"output_tokens\":0}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"thinking\",\"thinking\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"let me check\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"signature_delta\",\"signature\":\"sig-xyz\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"call_1\",\"name\":\"get_weather\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"city\\\":\\\"Paris\\\"}\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":12}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    let mut frames = processor
        .process_bytes(upstream.as_bytes(), transformer, transformer, &mut parse_ctx, &mut emit_ctx)
        .await
        .expect("processing succeeds");
    frames.extend(
        processor
            .flush(transformer, transformer, &mut parse_ctx, &mut emit_ctx)
            .await
            .expect("flush succeeds"),
    );

    let starts = frames.iter().filter(|f| f.contains("content_block_start")).count();
    let stops = frames.iter().filter(|f| f.contains("content_block_stop")).count();
    assert_eq!(starts, stops, "every opened block must be closed");
    assert!(starts >= 2, "both the thinking and tool_use blocks must open");

    let stop_reason_frame = frames
        .iter()
        .find(|f| f.contains("\"stop_reason\""))
        .expect("a stop-reason-bearing frame");
    assert!(
        stop_reason_frame.contains("tool_use"),
        "stop_reason must be patched to tool_use when a tool_use block was open, got: {stop_reason_frame}"
    );
}

/// S5: the primary model is already cooled down from a prior rate limit,
/// so dispatch routes straight to its mapped fallback and succeeds.
#[tokio::test]
async fn s5_rate_limited_primary_falls_back_to_secondary() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/primary"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "60"))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/secondary"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "modelF",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "fallback reply"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })))
        .mount(&mock_server)
        .await;

    let mut endpoints = HashMap::new();
    endpoints.insert(
        "provider1".to_string(),
        EndpointConfig {
            base_url: format!("{}/primary", mock_server.uri()),
            endpoint_fallbacks: Vec::new(),
        },
    );
    endpoints.insert(
        "provider2".to_string(),
        EndpointConfig {
            base_url: format!("{}/secondary", mock_server.uri()),
            endpoint_fallbacks: Vec::new(),
        },
    );

    let mut model_mapping = HashMap::new();
    model_mapping.insert(
        "A".to_string(),
        ModelMapping {
            provider: "provider1".to_string(),
            model: "modelP".to_string(),
            fallbacks: vec!["modelF".to_string()],
        },
    );
    model_mapping.insert(
        "modelF".to_string(),
        ModelMapping {
            provider: "provider2".to_string(),
            model: "modelF".to_string(),
            fallbacks: vec![],
        },
    );

    let mut credentials = HashMap::new();
    credentials.extend(credential("provider1"));
    credentials.extend(credential("provider2"));

    let engine = DispatchEngine {
        registry: registry(),
        router: Router::new(RouterConfig {
            model_mapping,
            ..RouterConfig::default()
        }),
        cooldowns: Arc::new(CooldownManager::new()),
        credentials: Arc::new(CredentialPool::new(credentials)),
        signatures: Arc::new(InMemorySignatureStore::new(SignatureCacheConfig::default())),
        http: reqwest::Client::new(),
        endpoints,
        refresher: Arc::new(NoopRefresher),
    };

    let body = json!({
        "model": "A",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": false,
    });
    let mut options = ProxyOptions::default();
    options.source_format = Some("openai".to_string());

    let outcome = engine.dispatch(body, options).await.expect("dispatch succeeds after fallback");
    let DispatchOutcome::Buffered(value) = outcome else {
        panic!("expected a buffered response");
    };
    assert_eq!(value["choices"][0]["message"]["content"], "fallback reply");
}
