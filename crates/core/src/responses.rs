//! OpenAI Responses-API adapter (C10 / §4.9).
//!
//! Registered in the transformer registry under the name `"responses"` and
//! used only as a *source* dialect: clients that POST to `/v1/responses` or
//! `/backend-api/codex/responses` speak this wire format, but it is never an
//! `effectiveProvider` an upstream request is routed to — that role belongs
//! to the `openai-web` dialect, which this adapter sits in front of. It
//! wraps the canonical chunk stream C8 produces and re-frames it as
//! Responses-API events (`response.created`, `response.output_text.delta`,
//! `response.completed`, ...) instead of chat-completion chunks.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::model::{
    BlockType, CanonicalRequest, CanonicalResponse, GenerationConfig, Message, Part,
    RequestMetadata, Role, StopReason, StreamChunk, StreamChunkType, Tool, ToolArguments, Usage,
};
use crate::stream::ParserType;
use crate::transformer::{StreamEmitContext, StreamParseContext, Transformer};

pub struct ResponsesTransformer;

pub fn transformer() -> &'static ResponsesTransformer {
    &ResponsesTransformer
}

fn finish_reason_to_stop(reason: Option<&str>) -> StopReason {
    match reason {
        Some("completed") => StopReason::EndTurn,
        Some("max_output_tokens") => StopReason::MaxTokens,
        Some("requires_action") => StopReason::ToolUse,
        Some("content_filter") => StopReason::ContentFilter,
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

impl Transformer for ResponsesTransformer {
    fn name(&self) -> &'static str {
        "responses"
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
            .ok_or_else(|| ProxyError::InvalidRequest("responses: missing input[]".into()))?;

        let mut messages = Vec::new();
        for item in raw_input {
            // A bare string item is shorthand for one user message.
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
            let text = input_item_to_text(item);
            if canonical_role == Role::System {
                continue;
            }
            messages.push(Message::text(canonical_role, text));
        }

        let system = body
            .get("instructions")
            .and_then(Value::as_str)
            .map(str::to_string);

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
            max_tokens: body
                .get("max_output_tokens")
                .and_then(Value::as_u64)
                .map(|n| n as u32),
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

        let mut body = Map::new();
        body.insert("model".to_string(), json!(model));
        body.insert("input".to_string(), json!(input));
        body.insert("store".to_string(), json!(false));
        if let Some(system) = &request.system {
            body.insert("instructions".to_string(), json!(system));
        }
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

        let usage = response.usage.as_ref().map(|u| {
            json!({
                "input_tokens": u.input_tokens,
                "output_tokens": u.output_tokens,
                "total_tokens": u.total_tokens.unwrap_or(u.input_tokens + u.output_tokens),
            })
        });

        Ok(json!({
            "id": response.id,
            "object": "response",
            "model": response.model,
            "status": stop_to_status(response.stop_reason),
            "output": [{
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": text}],
            }],
            "usage": usage,
        }))
    }

    /// Responses-API requests aren't themselves routed upstream (see module
    /// doc), so parsing their own SSE is never exercised by the dispatch
    /// engine in practice; implemented for symmetry and direct testing.
    fn parse_stream_chunk(
        &self,
        raw_event: &str,
        _ctx: &mut StreamParseContext,
    ) -> Result<Vec<StreamChunk>, ProxyError> {
        let Some(data) = extract_data_line(raw_event) else {
            return Ok(Vec::new());
        };
        let event: Value = serde_json::from_str(data)
            .map_err(|e| ProxyError::InvalidRequest(format!("responses: bad stream json: {e}")))?;

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
            Some("response.completed") => {
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

    /// Translates one canonical chunk into the Responses-API event(s) it
    /// corresponds to, lazily opening `response.created` /
    /// `response.output_item.added` / `response.content_part.added` on first
    /// appearance the way the upstream API itself does.
    fn emit_stream_chunk(
        &self,
        chunk: &StreamChunk,
        ctx: &mut StreamEmitContext,
    ) -> Result<Vec<String>, ProxyError> {
        let mut out = Vec::new();
        let response_id = ctx
            .stream_id
            .get_or_insert_with(|| format!("resp_{}", Uuid::new_v4().simple()))
            .clone();

        const CREATED: u32 = u32::MAX;
        const ITEM_ADDED: u32 = u32::MAX - 1;
        const ITEM_ID_INDEX: u32 = 0;

        if !ctx.started_blocks.contains(&CREATED) {
            ctx.started_blocks.insert(CREATED);
            out.push(sse_event(
                "response.created",
                &json!({"type": "response.created", "response": {"id": response_id, "status": "in_progress"}}),
            ));
        }

        match chunk.chunk_type {
            StreamChunkType::Content => {
                if let Some(Part::Text { text }) = &chunk.delta {
                    if !ctx.started_blocks.contains(&ITEM_ADDED) {
                        ctx.started_blocks.insert(ITEM_ADDED);
                        out.push(sse_event(
                            "response.output_item.added",
                            &json!({
                                "type": "response.output_item.added",
                                "output_index": 0,
                                "item": {"id": item_id(ITEM_ID_INDEX), "type": "message", "role": "assistant", "content": []},
                            }),
                        ));
                        out.push(sse_event(
                            "response.content_part.added",
                            &json!({
                                "type": "response.content_part.added",
                                "item_id": item_id(ITEM_ID_INDEX),
                                "output_index": 0,
                                "content_index": 0,
                                "part": {"type": "output_text", "text": ""},
                            }),
                        ));
                    }
                    out.push(sse_event(
                        "response.output_text.delta",
                        &json!({
                            "type": "response.output_text.delta",
                            "item_id": item_id(ITEM_ID_INDEX),
                            "output_index": 0,
                            "content_index": 0,
                            "delta": text,
                        }),
                    ));
                }
            }
            StreamChunkType::ToolCall => {
                if let Some(Part::ToolCall { id, name, arguments }) = &chunk.delta {
                    let arg_fragment = arguments.as_partial().unwrap_or_default();
                    out.push(sse_event(
                        "response.function_call_arguments.delta",
                        &json!({
                            "type": "response.function_call_arguments.delta",
                            "item_id": id,
                            "name": name,
                            "delta": arg_fragment,
                        }),
                    ));
                }
            }
            StreamChunkType::Done => {
                if ctx.started_blocks.contains(&ITEM_ADDED) {
                    out.push(sse_event(
                        "response.output_text.done",
                        &json!({"type": "response.output_text.done", "item_id": item_id(ITEM_ID_INDEX), "output_index": 0, "content_index": 0}),
                    ));
                    out.push(sse_event(
                        "response.output_item.done",
                        &json!({"type": "response.output_item.done", "output_index": 0, "item": {"id": item_id(ITEM_ID_INDEX), "type": "message"}}),
                    ));
                }
                let status = stop_to_status(chunk.stop_reason.unwrap_or(StopReason::EndTurn));
                out.push(sse_event(
                    "response.completed",
                    &json!({"type": "response.completed", "response": {"id": response_id, "status": status}}),
                ));
            }
            StreamChunkType::Error => {
                out.push(sse_event(
                    "error",
                    &json!({"type": "error", "message": chunk.error.clone().unwrap_or_default()}),
                ));
            }
            StreamChunkType::Thinking | StreamChunkType::BlockStop | StreamChunkType::Usage => {}
        }

        Ok(out)
    }
}

fn item_id(index: u32) -> String {
    format!("msg_{index}")
}

fn extract_data_line(raw_event: &str) -> Option<&str> {
    raw_event.lines().find_map(|line| line.strip_prefix("data:")).map(str::trim)
}

fn sse_event(event: &str, payload: &Value) -> String {
    format!("event: {event}\ndata: {payload}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_reads_instructions_as_system() {
        let body = json!({
            "model": "gpt-5",
            "input": [{"role": "user", "content": "hi"}],
            "instructions": "be terse",
        });
        let req = ResponsesTransformer.parse_request(&body).unwrap();
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn parse_request_accepts_bare_string_input_item() {
        let body = json!({"model": "gpt-5", "input": ["hello"]});
        let req = ResponsesTransformer.parse_request(&body).unwrap();
        assert_eq!(req.messages[0].role, Role::User);
    }

    #[test]
    fn emit_stream_chunk_opens_response_created_once() {
        let mut ctx = StreamEmitContext::default();
        let chunk = StreamChunk {
            chunk_type: StreamChunkType::Content,
            delta: Some(Part::Text { text: "hi".into() }),
            block_type: Some(BlockType::Text),
            ..Default::default()
        };
        let first = ResponsesTransformer.emit_stream_chunk(&chunk, &mut ctx).unwrap();
        assert!(first.iter().any(|e| e.contains("response.created")));
        assert!(first.iter().any(|e| e.contains("response.output_item.added")));

        let second_chunk = StreamChunk {
            chunk_type: StreamChunkType::Content,
            delta: Some(Part::Text { text: " there".into() }),
            block_type: Some(BlockType::Text),
            ..Default::default()
        };
        let second = ResponsesTransformer.emit_stream_chunk(&second_chunk, &mut ctx).unwrap();
        assert!(!second.iter().any(|e| e.contains("response.created")));
        assert!(second.iter().any(|e| e.contains("response.output_text.delta")));
    }

    #[test]
    fn emit_stream_chunk_done_closes_item_and_completes() {
        let mut ctx = StreamEmitContext::default();
        let start = StreamChunk {
            chunk_type: StreamChunkType::Content,
            delta: Some(Part::Text { text: "hi".into() }),
            block_type: Some(BlockType::Text),
            ..Default::default()
        };
        ResponsesTransformer.emit_stream_chunk(&start, &mut ctx).unwrap();

        let done = StreamChunk {
            chunk_type: StreamChunkType::Done,
            stop_reason: Some(StopReason::EndTurn),
            ..Default::default()
        };
        let out = ResponsesTransformer.emit_stream_chunk(&done, &mut ctx).unwrap();
        assert!(out.iter().any(|e| e.contains("response.output_item.done")));
        assert!(out.iter().any(|e| e.contains("response.completed")));
    }

    #[test]
    fn not_supported_without_input_array() {
        let body = json!({"model": "gpt-5", "messages": []});
        assert!(!ResponsesTransformer.is_supported_request(&body));
    }
}
