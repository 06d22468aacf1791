//! Request dispatch engine (C9): orchestrates one client request end to
//! end — format detection, canonical parse, provider/model resolution,
//! credential selection, the retry/fallback loop of §4.8, and handing the
//! upstream response back through the inverse transform (buffered or
//! streamed).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::cooldown::{cooldown_key, extract_retry_after, CooldownManager};
use crate::credentials::{auth_headers, Credential, CredentialPool, CredentialRefresher};
use crate::error::{ProxyError, ProxyResult};
use crate::model::CanonicalRequest;
use crate::router::{infer_provider, Router};
use crate::signature_cache::{entry_key, SignatureStore};
use crate::stream::{split_events, SignatureContext, StreamProcessor};
use crate::transformer::{StreamParseContext, Transformer, TransformerRegistry};

pub const MAX_ATTEMPTS: u32 = 5;
/// Idle timeout per upstream call (§5): generous enough for long-running
/// streamed generations.
const IDLE_TIMEOUT: Duration = Duration::from_secs(255);

/// Per-provider upstream endpoint configuration (§6 egress table).
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub base_url: String,
    /// Antigravity rotates its streaming suffix among these fallback
    /// bases when a 5xx/network error is hit (§4.8 step 4e).
    pub endpoint_fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    pub source_format: Option<String>,
    pub target_provider: Option<String>,
    pub target_model: Option<String>,
    pub api_key: Option<String>,
    /// `"model:provider"` syntax, last `:` is the separator (§4.8 step 3b).
    pub model_mappings: HashMap<String, String>,
    pub session_id: Option<String>,
}

pub enum DispatchOutcome {
    Buffered(Value),
    Streaming {
        body: reqwest::Response,
        parsing: Arc<dyn Transformer>,
        source: Arc<dyn Transformer>,
        session_id: String,
        model: String,
        /// Full text context of the request, for the signature cache's
        /// `textHash` (GLOSSARY) — the caller builds the stream processor
        /// with this via `DispatchEngine::stream_processor`.
        context_text: String,
    },
}

/// Model-family inference for the signature cache (GLOSSARY): case-
/// insensitive substring match on the model name.
pub fn infer_family(model: &str) -> &'static str {
    let m = model.to_lowercase();
    if m.contains("claude") {
        "claude"
    } else if m.contains("gemini") {
        "gemini"
    } else {
        "openai"
    }
}

pub struct DispatchEngine {
    pub registry: Arc<TransformerRegistry>,
    pub router: Router,
    pub cooldowns: Arc<CooldownManager>,
    pub credentials: Arc<CredentialPool>,
    pub signatures: Arc<dyn SignatureStore>,
    pub http: reqwest::Client,
    pub endpoints: HashMap<String, EndpointConfig>,
    pub refresher: Arc<dyn CredentialRefresher>,
}

impl DispatchEngine {
    /// §6 format-detection rules, applied in order.
    pub fn detect_format(body: &Value) -> Option<&'static str> {
        if body.get("payload").and_then(|p| p.get("contents")).map(Value::is_array) == Some(true) {
            return Some("antigravity");
        }
        if body.get("contents").map(Value::is_array) == Some(true) {
            return Some("gemini");
        }
        if body.get("model").is_some() && body.get("messages").map(Value::is_array) == Some(true) {
            return Some(if body.get("system").is_some() {
                "anthropic"
            } else {
                "openai"
            });
        }
        None
    }

    /// Resolves `(provider, model, requestedModel)` for one client request
    /// (§4.8 step 3). `requestedModel` is the key the client actually asked
    /// for, kept around so retries can keep re-consulting the router's
    /// mapping/fallback chain under its original key rather than under
    /// whatever concrete model the previous attempt resolved to.
    fn resolve_target(&self, request: &CanonicalRequest, options: &ProxyOptions) -> (String, String, String) {
        let requested_model = options
            .target_model
            .clone()
            .or_else(|| request.metadata.as_ref().and_then(|m| m.model.clone()))
            .unwrap_or_default();

        if let Some(explicit) = &options.target_model {
            let provider = options
                .target_provider
                .clone()
                .unwrap_or_else(|| infer_provider(explicit).to_string());
            return (provider, explicit.clone(), requested_model);
        }

        // `"model:provider"` mapping syntax, last `:` is the separator so
        // model names may themselves contain `:`.
        for (from, to) in &options.model_mappings {
            if from == &requested_model {
                if let Some(idx) = to.rfind(':') {
                    return (to[idx + 1..].to_string(), to[..idx].to_string(), requested_model);
                }
                return (infer_provider(to).to_string(), to.clone(), requested_model);
            }
        }

        if let Some(provider) = &options.target_provider {
            return (provider.clone(), requested_model.clone(), requested_model);
        }

        let (provider, model) = self.router.resolve_model(&self.cooldowns, &requested_model);
        (provider, model, requested_model)
    }

    /// Runs the full retry/fallback loop of §4.8 step 4 and returns either
    /// a buffered JSON response or a streaming handle.
    pub async fn dispatch(
        &self,
        body: Value,
        mut options: ProxyOptions,
    ) -> ProxyResult<DispatchOutcome> {
        let source_name = match &options.source_format {
            Some(f) => f.clone(),
            None => Self::detect_format(&body)
                .ok_or_else(|| ProxyError::InvalidRequest("Unknown request format".into()))?
                .to_string(),
        };
        let source = self
            .registry
            .get(&source_name)
            .ok_or_else(|| ProxyError::InvalidRequest(format!("unsupported source format: {source_name}")))?;

        let request = source.parse_request(&body)?;
        let (mut provider, mut model, requested_model) = self.resolve_target(&request, &options);
        let client_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

        let mut last_family = infer_family(&model);
        let mut outgoing_request = request.clone();

        for attempt in 1..=MAX_ATTEMPTS {
            let parsing = self
                .registry
                .get(&provider)
                .ok_or_else(|| ProxyError::InvalidRequest(format!("unsupported provider: {provider}")))?;

            let family = infer_family(&model);
            if family != last_family {
                // signature-handling invariant across model-family changes
                // (§4.8 closing paragraph): drop opaque signatures so the
                // new upstream's validator doesn't reject replayed thinking.
                strip_thinking_signatures(&mut outgoing_request);
            }
            last_family = family;

            let mut upstream_body = parsing.emit_request(&outgoing_request, &model)?;
            apply_provider_fixups(&provider, &mut upstream_body);

            let endpoint = self
                .endpoints
                .get(&provider)
                .cloned()
                .unwrap_or_else(|| EndpointConfig {
                    base_url: String::new(),
                    endpoint_fallbacks: Vec::new(),
                });

            let credentials = if let Some(key) = &options.api_key {
                vec![Credential {
                    id: "inline".to_string(),
                    provider: provider.clone(),
                    secret: key.clone(),
                    expires_at_ms: None,
                }]
            } else {
                self.credentials
                    .ensure_fresh(&provider, self.refresher.as_ref())
                    .await
            };
            if credentials.is_empty() {
                return Err(ProxyError::AuthMissing { provider: provider.clone() });
            }
            let cred_index = self
                .credentials
                .get_next_available(&provider, &credentials)
                .await
                .unwrap_or(0);
            let credential = &credentials[cred_index];

            let mut bases = vec![endpoint.base_url.clone()];
            bases.extend(endpoint.endpoint_fallbacks.clone());

            let mut attempt_result = None;
            for base in &bases {
                let mut req = self
                    .http
                    .post(base)
                    .timeout(IDLE_TIMEOUT)
                    .header("content-type", "application/json");
                for (name, value) in auth_headers(&provider, credential) {
                    req = req.header(name, value);
                }
                let resp = req.json(&upstream_body).send().await;
                match resp {
                    Ok(resp) => {
                        attempt_result = Some(resp);
                        break;
                    }
                    Err(e) => {
                        warn!(provider = %provider, model = %model, error = %e, "network error contacting upstream");
                        continue;
                    }
                }
            }

            let Some(resp) = attempt_result else {
                if attempt == MAX_ATTEMPTS {
                    return Err(ProxyError::Network("all endpoint candidates failed".into()));
                }
                backoff(attempt).await;
                continue;
            };

            let status = resp.status();

            if status.as_u16() == 429 {
                let header = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body_text = resp.text().await.unwrap_or_default();
                let retry_after_ms = extract_retry_after(header.as_deref(), Some(&body_text));
                self.router.handle_rate_limit(&self.cooldowns, &requested_model, Some(retry_after_ms));

                let fallback = self.router.resolve_model(&self.cooldowns, &requested_model);
                if fallback != (provider.clone(), model.clone()) {
                    info!(from = %model, to = %fallback.1, "switching to fallback model after 429");
                    provider = fallback.0;
                    model = fallback.1;
                    continue;
                }

                let key = cooldown_key(&provider, &model);
                if !self.cooldowns.is_available(&key) && attempt == MAX_ATTEMPTS {
                    return Err(ProxyError::RateLimitExhausted);
                }
                if attempt == MAX_ATTEMPTS {
                    return Err(ProxyError::RateLimitTransient { provider, retry_after_ms });
                }
                tokio::time::sleep(Duration::from_millis(retry_after_ms.min(16_000))).await;
                continue;
            }

            if status.is_server_error() {
                if attempt == MAX_ATTEMPTS {
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(parse_upstream_error(status.as_u16(), &body_text));
                }
                backoff(attempt).await;
                continue;
            }

            if status.is_client_error() {
                let body_text = resp.text().await.unwrap_or_default();
                return Err(parse_upstream_error(status.as_u16(), &body_text));
            }

            // Success.
            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            if client_stream && content_type.contains("event-stream") {
                return Ok(DispatchOutcome::Streaming {
                    body: resp,
                    parsing,
                    source,
                    session_id: options.session_id.take().unwrap_or_default(),
                    model: model.clone(),
                    context_text: request_context_text(&outgoing_request),
                });
            }

            if content_type.contains("event-stream") {
                // Client wants a buffered response but upstream only
                // streams: accumulate all events first, then translate.
                let canonical = self.accumulate_stream_to_response(resp, parsing.as_ref()).await?;
                let emitted = source.emit_response(&canonical)?;
                return Ok(DispatchOutcome::Buffered(emitted));
            }

            let upstream_json: Value = resp
                .json()
                .await
                .map_err(|e| ProxyError::UpstreamNonJson(e.to_string()))?;
            let canonical = parsing.parse_response(&upstream_json)?;
            let emitted = source.emit_response(&canonical)?;
            return Ok(DispatchOutcome::Buffered(emitted));
        }

        Err(ProxyError::Internal("retry loop exited without a result".into()))
    }

    /// Buffered-with-SSE-body path (§4.8 step 5): drain the whole upstream
    /// stream and fold it into one canonical response before translating.
    async fn accumulate_stream_to_response(
        &self,
        mut resp: reqwest::Response,
        parsing: &dyn Transformer,
    ) -> ProxyResult<crate::model::CanonicalResponse> {
        use crate::model::{CanonicalResponse, Part, StopReason, ThinkingBlock};

        let mut parse_ctx = StreamParseContext::default();
        let mut content: Vec<Part> = Vec::new();
        let mut thinking: Vec<ThinkingBlock> = Vec::new();
        let mut stop_reason = StopReason::Null;
        let mut usage = None;
        let mut buffer = String::new();

        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| ProxyError::Network(e.to_string()))?
        {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            let events = split_events(&mut buffer, parsing.parser_type());
            for raw_event in events {
                for stream_chunk in parsing.parse_stream_chunk(&raw_event, &mut parse_ctx)? {
                    match stream_chunk.delta {
                        Some(Part::Text { text }) => {
                            if let Some(Part::Text { text: existing }) = content.last_mut() {
                                existing.push_str(&text);
                            } else {
                                content.push(Part::Text { text });
                            }
                        }
                        Some(Part::Thinking { text, signature, redacted }) => {
                            if let Some(Part::Thinking { text: existing, .. }) = content.last_mut() {
                                existing.push_str(&text);
                            } else {
                                content.push(Part::Thinking {
                                    text: text.clone(),
                                    signature: signature.clone(),
                                    redacted,
                                });
                            }
                            thinking.push(ThinkingBlock { text, signature, redacted });
                        }
                        Some(other) => content.push(other),
                        None => {}
                    }
                    if let Some(sr) = stream_chunk.stop_reason {
                        stop_reason = sr;
                    }
                    if stream_chunk.usage.is_some() {
                        usage = stream_chunk.usage;
                    }
                }
            }
        }

        Ok(CanonicalResponse {
            id: String::new(),
            content,
            stop_reason,
            usage,
            model: None,
            thinking: if thinking.is_empty() { None } else { Some(thinking) },
        })
    }

    /// Builds the stream-transform pipeline for a streaming dispatch
    /// outcome: upstream SSE bytes in, client-dialect SSE bytes out.
    pub fn stream_processor(&self, model: &str, session_id: String, context_text: String) -> StreamProcessor {
        let family = infer_family(model);
        StreamProcessor::new(Some(SignatureContext {
            store: self.signatures.clone(),
            session_id,
            model: model.to_string(),
            family: family.to_string(),
            context_text,
        }))
    }
}

fn strip_thinking_signatures(request: &mut CanonicalRequest) {
    use crate::model::Part;
    for message in &mut request.messages {
        for part in &mut message.content {
            if let Part::Thinking { signature, .. } = part {
                *signature = None;
            }
        }
    }
}

/// Per-provider request post-processing applied before the HTTP call
/// (§4.8 step 4a): Antigravity project selection and opencode-zen body
/// fixups are delegated to the respective transformer crates at
/// `emit_request` time; this hook covers cross-cutting adjustments the
/// dispatch engine itself is responsible for.
fn apply_provider_fixups(provider: &str, body: &mut Value) {
    if provider == "openai-web" {
        if let Value::Object(map) = body {
            map.insert("store".to_string(), Value::Bool(false));
            map.insert("stream".to_string(), Value::Bool(true));
        }
    }
}

fn parse_upstream_error(status: u16, body_text: &str) -> ProxyError {
    match serde_json::from_str::<Value>(body_text) {
        Ok(body) => ProxyError::UpstreamError { status, body },
        Err(_) => ProxyError::UpstreamNonJson(body_text.to_string()),
    }
}

async fn backoff(attempt: u32) {
    let ms = 2u64.saturating_pow(attempt.saturating_sub(1)).saturating_mul(1000).min(16_000);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Derives the `textHash` context key from a request's full text context
/// (GLOSSARY): concatenation of every text/thinking part's text, in order.
pub fn request_context_text(request: &CanonicalRequest) -> String {
    let mut out = String::new();
    for message in &request.messages {
        for part in &message.content {
            match part {
                crate::model::Part::Text { text } => out.push_str(text),
                crate::model::Part::Thinking { text, .. } => out.push_str(text),
                _ => {}
            }
        }
    }
    out
}

pub fn entry_key_for(model: &str, request: &CanonicalRequest) -> String {
    entry_key(model, &request_context_text(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_antigravity_by_nested_contents() {
        let body = json!({"payload": {"contents": []}});
        assert_eq!(DispatchEngine::detect_format(&body), Some("antigravity"));
    }

    #[test]
    fn detects_gemini_by_contents() {
        let body = json!({"contents": []});
        assert_eq!(DispatchEngine::detect_format(&body), Some("gemini"));
    }

    #[test]
    fn detects_anthropic_by_system_key_presence() {
        let body = json!({"model": "claude-3", "messages": [], "system": null});
        assert_eq!(DispatchEngine::detect_format(&body), Some("anthropic"));
    }

    #[test]
    fn detects_openai_when_no_system_key() {
        let body = json!({"model": "gpt-4", "messages": []});
        assert_eq!(DispatchEngine::detect_format(&body), Some("openai"));
    }

    #[test]
    fn unknown_format_returns_none() {
        assert_eq!(DispatchEngine::detect_format(&json!({"foo": 1})), None);
    }

    #[test]
    fn family_inference_is_case_insensitive_substring() {
        assert_eq!(infer_family("Claude-3-Opus"), "claude");
        assert_eq!(infer_family("gemini-pro"), "gemini");
        assert_eq!(infer_family("gpt-4"), "openai");
    }
}
