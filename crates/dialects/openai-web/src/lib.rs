//! Codex backend ("openai-web") dialect transformer (C2 / §4.2 "openai-web").
//!
//! Speaks the OpenAI Responses API: `store:false` always, streaming always
//! enabled internally regardless of what the client asked for, and the
//! system prompt supplied as `instructions` rather than a role-tagged
//! message. `instructions` is sourced from the canonical request's own
//! `system` field when present, falling back to a per-model-family default
//! fetched from the external "Codex instructions" collaborator named in
//! §4.2 — fetching the real instructions text is out of this system's
//! scope (§1), so [`CodexInstructions`] is a narrow trait with a small
//! built-in default table, the same shape as C7's `CredentialRefresher`
//! contract for an externally-owned concern.

use proxy_core::error::ProxyError;
use proxy_core::model::{
    BlockType, CanonicalRequest, CanonicalResponse, GenerationConfig, Message, Part,
    RequestMetadata, Role, StopReason, StreamChunk, StreamChunkType, Tool, Usage,
};
use proxy_core::stream::ParserType;
use proxy_core::transformer::{StreamEmitContext, StreamParseContext, Transformer};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Keyed by case-insensitive model-name prefix, longest-prefix-wins; falls
/// through to a generic assistant preamble for anything unrecognized. A
/// trait rather than a bare function so the gateway can later swap in a
/// collaborator that fetches these from the real Codex config instead of
/// this built-in table, without touching the transformer itself.
pub trait CodexInstructions: Send + Sync {
    fn instructions_for(&self, model: &str) -> String;
}

const INSTRUCTIONS_TABLE: &[(&str, &str)] = &[
    ("gpt-5-codex", "You are Codex, a coding agent running in a terminal."),
    ("gpt-5", "You are a helpful assistant."),
    ("o3", "You are a helpful assistant."),
];

pub struct DefaultCodexInstructions;

impl CodexInstructions for DefaultCodexInstructions {
    fn instructions_for(&self, model: &str) -> String {
        let m = model.to_lowercase();
        INSTRUCTIONS_TABLE
            .iter()
            .filter(|(prefix, _)| m.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, text)| text.to_string())
            .unwrap_or_else(|| "You are a helpful assistant.".to_string())
    }
}

pub struct OpenAiWebTransformer;

pub fn transformer() -> &'static OpenAiWebTransformer {
    &OpenAiWebTransformer
}

fn finish_reason_to_stop(reason: Option<&str>) -> StopReason {
    match reason {
        Some("completed") => StopReason::EndTurn,
        Some("incomplete") => StopReason::MaxTokens,
        Some("failed") => StopReason::Error,
        _ => StopReason::Null,
    }
}

fn stop_to_status(reason: StopReason) -> &'static str {
    match reason {
        StopReason::MaxTokens => "incomplete",
        StopReason::Error => "failed",
        _ => "completed",
    }
}

fn input_item_to_text(item: &Value) -> String {
    match item.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

impl Transformer for OpenAiWebTransformer {
    fn name(&self) -> &'static str {
        "openai-web"
    }

    fn is_supported_request(&self, body: &Value) -> bool {
        body.get("model").is_some() && body.get("input").map(Value::is_array) == Some(true)
    }

    fn parser_type(&self) -> ParserType {
        ParserType::SseStandard
    }

    fn parse_request(&self, body: &Value) -> Result<CanonicalRequest, ProxyError> {
        let raw_input = body
            .get("input")
            .and_then(Value::as_array)
            .ok_or_else(|| ProxyError::InvalidRequest("openai-web: missing input[]".into()))?;

        let mut messages = Vec::new();
        for item in raw_input {
            if let Value::String(text) = item {
                messages.push(Message::text(Role::User, text.clone()));
                continue;
            }
            let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
            let canonical_role = match role {
                "assistant" => Role::Assistant,
                "system" | "developer" => Role::System,
                _ => Role::User,
            };
            if canonical_role == Role::System {
                continue;
            }
            messages.push(Message::text(canonical_role, input_item_to_text(item)));
        }

        let system = body.get("instructions").and_then(Value::as_str).map(str::to_string);

        let tools = body.get("tools").and_then(Value::as_array).map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    Some(Tool {
                        name: t.get("name")?.as_str()?.to_string(),
                        description: t.get("description").and_then(Value::as_str).map(str::to_string),
                        parameters: t
                            .get("parameters")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    })
                })
                .collect()
        });

        let config = GenerationConfig {
            max_tokens: body.get("max_output_tokens").and_then(Value::as_u64).map(|n| n as u32),
            temperature: body.get("temperature").and_then(Value::as_f64).map(|n| n as f32),
            top_p: body.get("top_p").and_then(Value::as_f64).map(|n| n as f32),
            top_k: None,
            stop_sequences: None,
        };

        Ok(CanonicalRequest {
            messages,
            system,
            tools,
            config: Some(config),
            thinking: None,
            metadata: Some(RequestMetadata {
                model: body.get("model").and_then(Value::as_str).map(str::to_string),
                ..Default::default()
            }),
        })
    }

    /// Always `store:false`; always internal streaming (§4.2); instructions
    /// fall back to the Codex-instructions table when the canonical request
    /// carries no `system` text.
    fn emit_request(&self, request: &CanonicalRequest, model: &str) -> Result<Value, ProxyError> {
        let mut input = Vec::new();
        for message in &request.messages {
            let role = match message.role {
                Role::System => "developer",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "user",
            };
            let text: String = message
                .content
                .iter()
                .filter_map(|p| match p {
                    Part::Text { text } => Some(text.clone()),
                    Part::ToolResult { content, .. } => Some(content.clone()),
                    _ => None,
                })
                .collect();
            if !text.is_empty() {
                input.push(json!({"role": role, "content": text}));
            }
        }

        let instructions = request
            .system
            .clone()
            .unwrap_or_else(|| DefaultCodexInstructions.instructions_for(model));

        let mut body = Map::new();
        body.insert("model".to_string(), json!(model));
        body.insert("input".to_string(), json!(input));
        body.insert("instructions".to_string(), json!(instructions));
        body.insert("store".to_string(), json!(false));
        body.insert("stream".to_string(), json!(true));

        if let Some(config) = &request.config {
            if let Some(max_tokens) = config.max_tokens {
                body.insert("max_output_tokens".to_string(), json!(max_tokens));
            }
            if let Some(t) = config.temperature {
                body.insert("temperature".to_string(), json!(t));
            }
        }
        if let Some(tools) = &request.tools {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| json!({"type": "function", "name": t.name, "description": t.description, "parameters": t.parameters}))
                .collect();
            body.insert("tools".to_string(), json!(tools));
        }

        Ok(Value::Object(body))
    }

    fn parse_response(&self, body: &Value) -> Result<CanonicalResponse, ProxyError> {
        let output = body.get("output").and_then(Value::as_array).cloned().unwrap_or_default();
        let mut content = Vec::new();
        for item in &output {
            if item.get("type").and_then(Value::as_str) != Some("message") {
                continue;
            }
            if let Some(parts) = item.get("content").and_then(Value::as_array) {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        content.push(Part::Text { text: text.to_string() });
                    }
                }
            }
        }

        let usage = body.get("usage").map(|u| Usage {
            input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(Value::as_u64).map(|n| n as u32),
            cached_tokens: None,
            thinking_tokens: None,
        });

        Ok(CanonicalResponse {
            id: body.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            content,
            stop_reason: finish_reason_to_stop(body.get("status").and_then(Value::as_str)),
            usage,
            model: body.get("model").and_then(Value::as_str).map(str::to_string),
            thinking: None,
        })
    }

    fn emit_response(&self, response: &CanonicalResponse) -> Result<Value, ProxyError> {
        let text: String = response
            .content
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect();

        Ok(json!({
            "id": response.id,
            "object": "response",
            "model": response.model,
            "status": stop_to_status(response.stop_reason),
            "store": false,
            "output": [{
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": text}],
            }],
            "usage": response.usage.as_ref().map(|u| json!({
                "input_tokens": u.input_tokens,
                "output_tokens": u.output_tokens,
                "total_tokens": u.total_tokens.unwrap_or(u.input_tokens + u.output_tokens),
            })),
        }))
    }

    fn parse_stream_chunk(
        &self,
        raw_event: &str,
        _ctx: &mut StreamParseContext,
    ) -> Result<Vec<StreamChunk>, ProxyError> {
        let Some(data) = raw_event.lines().find_map(|l| l.strip_prefix("data:")) else {
            return Ok(Vec::new());
        };
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(Vec::new());
        }
        let event: Value = serde_json::from_str(data)
            .map_err(|e| ProxyError::InvalidRequest(format!("openai-web: bad stream json: {e}")))?;

        let mut out = Vec::new();
        match event.get("type").and_then(Value::as_str) {
            Some("response.output_text.delta") => {
                if let Some(text) = event.get("delta").and_then(Value::as_str) {
                    out.push(StreamChunk {
                        chunk_type: StreamChunkType::Content,
                        delta: Some(Part::Text { text: text.to_string() }),
                        block_type: Some(BlockType::Text),
                        ..Default::default()
                    });
                }
            }
            Some("response.reasoning_summary_text.delta") => {
                if let Some(text) = event.get("delta").and_then(Value::as_str) {
                    out.push(StreamChunk {
                        chunk_type: StreamChunkType::Thinking,
                        delta: Some(Part::Thinking { text: text.to_string(), signature: None, redacted: None }),
                        block_type: Some(BlockType::Thinking),
                        ..Default::default()
                    });
                }
            }
            Some("response.function_call_arguments.delta") => {
                if let Some(delta) = event.get("delta").and_then(Value::as_str) {
                    let id = event.get("item_id").and_then(Value::as_str).unwrap_or_default().to_string();
                    out.push(StreamChunk {
                        chunk_type: StreamChunkType::ToolCall,
                        delta: Some(Part::ToolCall {
                            id: id.clone(),
                            name: event.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                            arguments: proxy_core::model::ToolArguments::Partial(delta.to_string()),
                        }),
                        block_type: Some(BlockType::ToolUse),
                        ..Default::default()
                    });
                }
            }
            Some("response.completed") | Some("response.failed") | Some("response.incomplete") => {
                let status = event
                    .get("response")
                    .and_then(|r| r.get("status"))
                    .and_then(Value::as_str);
                out.push(StreamChunk {
                    chunk_type: StreamChunkType::Done,
                    stop_reason: Some(finish_reason_to_stop(status)),
                    ..Default::default()
                });
            }
            _ => {}
        }
        Ok(out)
    }

    fn emit_stream_chunk(
        &self,
        chunk: &StreamChunk,
        ctx: &mut StreamEmitContext,
    ) -> Result<Vec<String>, ProxyError> {
        let response_id = ctx
            .stream_id
            .get_or_insert_with(|| format!("resp_{}", Uuid::new_v4().simple()))
            .clone();

        match chunk.chunk_type {
            StreamChunkType::Content => {
                if let Some(Part::Text { text }) = &chunk.delta {
                    return Ok(vec![sse_event(
                        "response.output_text.delta",
                        &json!({"type": "response.output_text.delta", "delta": text}),
                    )]);
                }
                Ok(vec![])
            }
            StreamChunkType::Thinking => {
                if let Some(Part::Thinking { text, .. }) = &chunk.delta {
                    return Ok(vec![sse_event(
                        "response.reasoning_summary_text.delta",
                        &json!({"type": "response.reasoning_summary_text.delta", "delta": text}),
                    )]);
                }
                Ok(vec![])
            }
            StreamChunkType::ToolCall => {
                if let Some(Part::ToolCall { id, name, arguments }) = &chunk.delta {
                    return Ok(vec![sse_event(
                        "response.function_call_arguments.delta",
                        &json!({
                            "type": "response.function_call_arguments.delta",
                            "item_id": id, "name": name,
                            "delta": arguments.as_partial().unwrap_or_default(),
                        }),
                    )]);
                }
                Ok(vec![])
            }
            StreamChunkType::Done => {
                let status = stop_to_status(chunk.stop_reason.unwrap_or(StopReason::EndTurn));
                Ok(vec![sse_event(
                    "response.completed",
                    &json!({"type": "response.completed", "response": {"id": response_id, "status": status}}),
                )])
            }
            StreamChunkType::Error => Ok(vec![sse_event(
                "error",
                &json!({"type": "error", "message": chunk.error.clone().unwrap_or_default()}),
            )]),
            StreamChunkType::BlockStop | StreamChunkType::Usage => Ok(vec![]),
        }
    }
}

fn sse_event(event: &str, payload: &Value) -> String {
    format!("event: {event}\ndata: {payload}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_request_always_sets_store_false_and_stream_true() {
        let request = CanonicalRequest {
            messages: vec![Message::text(Role::User, "hi")],
            ..Default::default()
        };
        let body = OpenAiWebTransformer.emit_request(&request, "gpt-5-codex").unwrap();
        assert_eq!(body["store"], json!(false));
        assert_eq!(body["stream"], json!(true));
    }

    #[test]
    fn emit_request_falls_back_to_codex_instructions_when_no_system() {
        let request = CanonicalRequest {
            messages: vec![Message::text(Role::User, "hi")],
            ..Default::default()
        };
        let body = OpenAiWebTransformer.emit_request(&request, "gpt-5-codex").unwrap();
        assert!(body["instructions"].as_str().unwrap().contains("Codex"));
    }

    #[test]
    fn emit_request_prefers_explicit_system_text() {
        let request = CanonicalRequest {
            messages: vec![Message::text(Role::User, "hi")],
            system: Some("be terse".to_string()),
            ..Default::default()
        };
        let body = OpenAiWebTransformer.emit_request(&request, "gpt-5-codex").unwrap();
        assert_eq!(body["instructions"], json!("be terse"));
    }

    #[test]
    fn parse_stream_chunk_reads_text_delta() {
        let event = "data: {\"type\":\"response.output_text.delta\",\"delta\":\"hi\"}\n\n";
        let mut ctx = StreamParseContext::default();
        let chunks = OpenAiWebTransformer.parse_stream_chunk(event, &mut ctx).unwrap();
        assert!(matches!(&chunks[0].delta, Some(Part::Text { text }) if text == "hi"));
    }

    #[test]
    fn parse_stream_chunk_ignores_done_marker() {
        let mut ctx = StreamParseContext::default();
        let chunks = OpenAiWebTransformer.parse_stream_chunk("data: [DONE]\n\n", &mut ctx).unwrap();
        assert!(chunks.is_empty());
    }
}
