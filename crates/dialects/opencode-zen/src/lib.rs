//! opencode-zen hybrid dialect transformer (C2 / §4.2 "opencode-zen").
//!
//! A single upstream that fronts many open models (`glm-*`, `qwen-*`,
//! `kimi-*`, `grok-*`, `big-pickle`, ...) behind whichever of the OpenAI or
//! Anthropic wire protocols its backend for that model happens to speak.
//! This transformer never implements the mapping itself — it detects which
//! protocol applies and delegates every operation to `dialect_openai` or
//! `dialect_anthropic`.
//!
//! Detection differs by operation, per §4.2:
//! - request/response bodies: shape-based, the same `system`-key heuristic
//!   §6's top-level format detection uses for stand-alone OpenAI/Anthropic
//!   requests.
//! - stream events: an `event:` line prefix or a `"type":"content_block"`
//!   substring means Anthropic; anything else means OpenAI.
//!
//! `emit_request`/`emit_response`/`emit_stream_chunk` run when opencode-zen
//! is itself the *source* dialect a client declared — a path the rest of
//! this system rarely exercises, since opencode-zen is ordinarily only an
//! `effectiveProvider` dispatched *to*. Lacking a per-model protocol table
//! in the spec for that direction, these three default to the OpenAI
//! delegate (documented in DESIGN.md) rather than inventing one.

use proxy_core::error::ProxyError;
use proxy_core::model::{CanonicalRequest, CanonicalResponse, StreamChunk};
use proxy_core::stream::ParserType;
use proxy_core::transformer::{StreamEmitContext, StreamParseContext, Transformer};
use serde_json::Value;

pub struct OpencodeZenTransformer;

pub fn transformer() -> &'static OpencodeZenTransformer {
    &OpencodeZenTransformer
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    OpenAi,
    Anthropic,
}

/// Shape-based detection for request/response bodies, mirroring §6's
/// top-level `system`-key rule.
fn body_protocol(body: &Value) -> Protocol {
    if body.get("system").is_some() || body.get("content").and_then(Value::as_array).is_some() {
        Protocol::Anthropic
    } else {
        Protocol::OpenAi
    }
}

/// Per-model heuristic for the direction the spec leaves unspecified
/// (opencode-zen as source dialect, §4.2): only a `claude`/`anthropic`
/// model name selects the Anthropic delegate, matching `infer_provider`'s
/// own `claude*` rule; every other opencode-zen model family currently
/// named in the spec (`glm-*`, `qwen-*`, `kimi-*`, `grok-*`, `big-pickle`)
/// speaks OpenAI.
fn model_protocol(model: &str) -> Protocol {
    let m = model.to_lowercase();
    if m.contains("claude") || m.contains("anthropic") {
        Protocol::Anthropic
    } else {
        Protocol::OpenAi
    }
}

/// §4.2's exact stream-event detection rule: `event:` prefix or
/// `"type":"content_block"` substring ⇒ Anthropic; else OpenAI.
fn event_protocol(raw_event: &str) -> Protocol {
    if raw_event.trim_start().starts_with("event:") || raw_event.contains("\"type\":\"content_block") {
        Protocol::Anthropic
    } else {
        Protocol::OpenAi
    }
}

impl Transformer for OpencodeZenTransformer {
    fn name(&self) -> &'static str {
        "opencode-zen"
    }

    fn is_supported_request(&self, body: &Value) -> bool {
        body.get("model").is_some() && body.get("messages").map(Value::is_array) == Some(true)
    }

    fn parser_type(&self) -> ParserType {
        // Both delegates use sse-standard framing.
        ParserType::SseStandard
    }

    fn parse_request(&self, body: &Value) -> Result<CanonicalRequest, ProxyError> {
        match body_protocol(body) {
            Protocol::Anthropic => dialect_anthropic::transformer().parse_request(body),
            Protocol::OpenAi => dialect_openai::transformer().parse_request(body),
        }
    }

    fn emit_request(&self, request: &CanonicalRequest, model: &str) -> Result<Value, ProxyError> {
        match model_protocol(model) {
            Protocol::Anthropic => dialect_anthropic::transformer().emit_request(request, model),
            Protocol::OpenAi => dialect_openai::transformer().emit_request(request, model),
        }
    }

    fn parse_response(&self, body: &Value) -> Result<CanonicalResponse, ProxyError> {
        match body_protocol(body) {
            Protocol::Anthropic => dialect_anthropic::transformer().parse_response(body),
            Protocol::OpenAi => dialect_openai::transformer().parse_response(body),
        }
    }

    fn emit_response(&self, response: &CanonicalResponse) -> Result<Value, ProxyError> {
        dialect_openai::transformer().emit_response(response)
    }

    fn parse_stream_chunk(
        &self,
        raw_event: &str,
        ctx: &mut StreamParseContext,
    ) -> Result<Vec<StreamChunk>, ProxyError> {
        match event_protocol(raw_event) {
            Protocol::Anthropic => dialect_anthropic::transformer().parse_stream_chunk(raw_event, ctx),
            Protocol::OpenAi => dialect_openai::transformer().parse_stream_chunk(raw_event, ctx),
        }
    }

    fn emit_stream_chunk(
        &self,
        chunk: &StreamChunk,
        ctx: &mut StreamEmitContext,
    ) -> Result<Vec<String>, ProxyError> {
        dialect_openai::transformer().emit_stream_chunk(chunk, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_core::model::{CanonicalResponse, Part, StopReason};
    use serde_json::json;

    #[test]
    fn request_with_system_key_delegates_to_anthropic() {
        let body = json!({"model": "glm-4.7-free", "messages": [], "system": "x", "max_tokens": 10});
        let req = OpencodeZenTransformer.parse_request(&body).unwrap();
        assert!(req.messages.is_empty());
    }

    #[test]
    fn request_without_system_key_delegates_to_openai() {
        let body = json!({"model": "qwen-max", "messages": [{"role": "user", "content": "hi"}]});
        let req = OpencodeZenTransformer.parse_request(&body).unwrap();
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn claude_named_model_emits_anthropic_shape() {
        let request = CanonicalRequest {
            messages: vec![proxy_core::model::Message::text(proxy_core::model::Role::User, "hi")],
            ..Default::default()
        };
        let body = OpencodeZenTransformer.emit_request(&request, "claude-instant").unwrap();
        assert!(body.get("max_tokens").is_some());
    }

    #[test]
    fn non_claude_model_emits_openai_shape() {
        let request = CanonicalRequest {
            messages: vec![proxy_core::model::Message::text(proxy_core::model::Role::User, "hi")],
            ..Default::default()
        };
        let body = OpencodeZenTransformer.emit_request(&request, "glm-4.7-free").unwrap();
        assert!(body.get("messages").is_some());
    }

    #[test]
    fn content_block_event_detected_as_anthropic() {
        assert_eq!(event_protocol("data: {\"type\":\"content_block_delta\"}"), Protocol::Anthropic);
    }

    #[test]
    fn plain_data_event_detected_as_openai() {
        assert_eq!(event_protocol("data: {\"choices\":[]}"), Protocol::OpenAi);
    }

    #[test]
    fn response_with_content_array_delegates_to_anthropic() {
        let body = json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn", "usage": {"input_tokens": 1, "output_tokens": 1},
        });
        let response = OpencodeZenTransformer.parse_response(&body).unwrap();
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn emit_response_uses_openai_shape() {
        let response = CanonicalResponse {
            id: "r1".to_string(),
            content: vec![Part::Text { text: "hi".into() }],
            stop_reason: StopReason::EndTurn,
            usage: None,
            model: None,
            thinking: None,
        };
        let body = OpencodeZenTransformer.emit_response(&response).unwrap();
        assert!(body.get("choices").is_some());
    }
}
