//! Anthropic messages-API dialect transformer (C2 / §4.2 "Anthropic").
//!
//! `max_tokens` is required (default 4096); `system` is a top-level string
//! or `[{type:text,text}]`; content blocks are tagged
//! `text|image|thinking|redacted_thinking|tool_use|tool_result`; streams are
//! event-named SSE.

use proxy_core::error::ProxyError;
use proxy_core::model::{
    BlockType, CanonicalRequest, CanonicalResponse, GenerationConfig, Message, Part,
    RequestMetadata, Role, StopReason, StreamChunk, StreamChunkType, ThinkingBlock, ThinkingConfig,
    Tool, ToolArguments, Usage,
};
use proxy_core::stream::ParserType;
use proxy_core::transformer::{StreamEmitContext, StreamParseContext, Transformer};
use serde_json::{json, Value};

const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicTransformer;

pub fn transformer() -> &'static AnthropicTransformer {
    &AnthropicTransformer
}

fn stop_reason_to_canonical(reason: Option<&str>) -> StopReason {
    match reason {
        Some("end_turn") => StopReason::EndTurn,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("tool_use") => StopReason::ToolUse,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::Null,
    }
}

/// Anthropic cannot represent `content_filter` — it maps to `end_turn`
/// (documented lossy mapping, §8 invariant 1).
fn canonical_to_stop_reason(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::ContentFilter | StopReason::Error | StopReason::Null => {
            "end_turn"
        }
        StopReason::MaxTokens => "max_tokens",
        StopReason::ToolUse => "tool_use",
        StopReason::StopSequence => "stop_sequence",
    }
}

fn system_to_string(system: &Value) -> Option<String> {
    match system {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let joined = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            Some(joined)
        }
        _ => None,
    }
}

fn parse_content_blocks(blocks: &[Value]) -> Vec<Part> {
    let mut out = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => out.push(Part::Text {
                text: block.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            Some("image") => {
                let source = block.get("source").cloned().unwrap_or_default();
                out.push(Part::Image {
                    mime_type: source
                        .get("media_type")
                        .and_then(Value::as_str)
                        .unwrap_or("image/png")
                        .to_string(),
                    data: source.get("data").and_then(Value::as_str).map(str::to_string),
                    url: source.get("url").and_then(Value::as_str).map(str::to_string),
                });
            }
            Some("thinking") => out.push(Part::Thinking {
                text: block
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                signature: block.get("signature").and_then(Value::as_str).map(str::to_string),
                redacted: None,
            }),
            // Dropped on parse but recorded in the response's thinking list
            // for CanonicalResponse; in a replayed request we keep a
            // placeholder so downstream block alignment survives.
            Some("redacted_thinking") => out.push(Part::Thinking {
                text: String::new(),
                signature: None,
                redacted: Some(true),
            }),
            Some("tool_use") => out.push(Part::ToolCall {
                id: block.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                arguments: ToolArguments::Value(block.get("input").cloned().unwrap_or(json!({}))),
            }),
            Some("tool_result") => {
                let content = match block.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(""),
                    _ => String::new(),
                };
                out.push(Part::ToolResult {
                    tool_call_id: block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    content,
                    is_error: block.get("is_error").and_then(Value::as_bool),
                });
            }
            _ => {}
        }
    }
    out
}

fn emit_content_blocks(parts: &[Part]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(json!({"type": "text", "text": text})),
            Part::Image { mime_type, data, url } => Some(json!({
                "type": "image",
                "source": if let Some(data) = data {
                    json!({"type": "base64", "media_type": mime_type, "data": data})
                } else {
                    json!({"type": "url", "url": url})
                },
            })),
            Part::Thinking {
                text,
                signature,
                redacted,
            } => {
                if redacted == &Some(true) {
                    // Lossy: original `data` wasn't preserved through parse.
                    Some(json!({"type": "redacted_thinking", "data": ""}))
                } else {
                    Some(json!({"type": "thinking", "thinking": text, "signature": signature}))
                }
            }
            Part::ToolCall {
                id,
                name,
                arguments,
            } => Some(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": arguments.as_value().cloned().unwrap_or(json!({})),
            })),
            Part::ToolResult {
                tool_call_id,
                content,
                is_error,
            } => Some(json!({
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content,
                "is_error": is_error,
            })),
        })
        .collect()
}

impl Transformer for AnthropicTransformer {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn is_supported_request(&self, body: &Value) -> bool {
        body.get("model").is_some()
            && body.get("messages").map(Value::is_array) == Some(true)
            && body.get("contents").is_none()
            && body.get("system").is_some()
    }

    fn parser_type(&self) -> ParserType {
        ParserType::SseStandard
    }

    fn parse_request(&self, body: &Value) -> Result<CanonicalRequest, ProxyError> {
        let raw_messages = body
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| ProxyError::InvalidRequest("anthropic: missing messages[]".into()))?;

        let mut messages = Vec::new();
        for raw in raw_messages {
            let role = match raw.get("role").and_then(Value::as_str) {
                Some("assistant") => Role::Assistant,
                _ => Role::User,
            };
            let content = match raw.get("content") {
                Some(Value::String(s)) => vec![Part::Text { text: s.clone() }],
                Some(Value::Array(blocks)) => parse_content_blocks(blocks),
                _ => Vec::new(),
            };
            messages.push(Message {
                role,
                content,
            });
        }

        let system = body.get("system").and_then(system_to_string);

        let tools = body.get("tools").and_then(Value::as_array).map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    Some(Tool {
                        name: t.get("name")?.as_str()?.to_string(),
                        description: t
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        parameters: t
                            .get("input_schema")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    })
                })
                .collect()
        });

        let thinking = body.get("thinking").map(|t| ThinkingConfig {
            enabled: t.get("type").and_then(Value::as_str) == Some("enabled"),
            budget: t.get("budget_tokens").and_then(Value::as_u64).map(|n| n as u32),
            include_thoughts: Some(true),
        });

        let config = GenerationConfig {
            max_tokens: Some(
                body.get("max_tokens")
                    .and_then(Value::as_u64)
                    .map(|n| n as u32)
                    .unwrap_or(DEFAULT_MAX_TOKENS),
            ),
            temperature: body.get("temperature").and_then(Value::as_f64).map(|n| n as f32),
            top_p: body.get("top_p").and_then(Value::as_f64).map(|n| n as f32),
            top_k: body.get("top_k").and_then(Value::as_u64).map(|n| n as u32),
            stop_sequences: body
                .get("stop_sequences")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
        };

        Ok(CanonicalRequest {
            messages,
            system,
            tools,
            config: Some(config),
            thinking,
            metadata: Some(RequestMetadata {
                model: body.get("model").and_then(Value::as_str).map(str::to_string),
                ..Default::default()
            }),
        })
    }

    fn emit_request(&self, request: &CanonicalRequest, model: &str) -> Result<Value, ProxyError> {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = if m.role == Role::Assistant {
                    "assistant"
                } else {
                    "user"
                };
                json!({"role": role, "content": emit_content_blocks(&m.content)})
            })
            .collect();

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(model));
        body.insert("messages".to_string(), json!(messages));
        body.insert(
            "max_tokens".to_string(),
            json!(request
                .config
                .as_ref()
                .and_then(|c| c.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS)),
        );

        if let Some(system) = &request.system {
            body.insert("system".to_string(), json!(system));
        }
        if let Some(config) = &request.config {
            if let Some(t) = config.temperature {
                body.insert("temperature".to_string(), json!(t));
            }
            if let Some(p) = config.top_p {
                body.insert("top_p".to_string(), json!(p));
            }
            if let Some(k) = config.top_k {
                body.insert("top_k".to_string(), json!(k));
            }
            if let Some(stop) = &config.stop_sequences {
                body.insert("stop_sequences".to_string(), json!(stop));
            }
        }
        if let Some(tools) = &request.tools {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body.insert("tools".to_string(), json!(tools));
        }
        if let Some(thinking) = &request.thinking {
            if thinking.enabled {
                body.insert(
                    "thinking".to_string(),
                    json!({
                        "type": "enabled",
                        "budget_tokens": thinking.budget.unwrap_or(1024),
                    }),
                );
            }
        }

        Ok(Value::Object(body))
    }

    fn parse_response(&self, body: &Value) -> Result<CanonicalResponse, ProxyError> {
        let blocks = body
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut content = Vec::new();
        let mut thinking = Vec::new();

        for block in &blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("redacted_thinking") => thinking.push(ThinkingBlock {
                    text: String::new(),
                    signature: None,
                    redacted: Some(true),
                }),
                Some("thinking") => {
                    let text = block
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let signature = block.get("signature").and_then(Value::as_str).map(str::to_string);
                    content.push(Part::Thinking {
                        text: text.clone(),
                        signature: signature.clone(),
                        redacted: None,
                    });
                    thinking.push(ThinkingBlock {
                        text,
                        signature,
                        redacted: None,
                    });
                }
                _ => content.extend(parse_content_blocks(std::slice::from_ref(block))),
            }
        }

        let usage = body.get("usage").map(|u| Usage {
            input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            total_tokens: None,
            cached_tokens: u
                .get("cache_read_input_tokens")
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            thinking_tokens: None,
        });

        Ok(CanonicalResponse {
            id: body.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            content,
            stop_reason: stop_reason_to_canonical(body.get("stop_reason").and_then(Value::as_str)),
            usage,
            model: body.get("model").and_then(Value::as_str).map(str::to_string),
            thinking: if thinking.is_empty() { None } else { Some(thinking) },
        })
    }

    fn emit_response(&self, response: &CanonicalResponse) -> Result<Value, ProxyError> {
        let mut content = emit_content_blocks(&response.content);

        // Redacted blocks recorded only in `thinking` (not already in
        // `content`, since they were dropped on parse) are re-inserted so
        // the emitted transcript still reflects that a thinking step ran.
        if let Some(thinking) = &response.thinking {
            let mut redacted_prefix = Vec::new();
            for block in thinking {
                if block.redacted == Some(true) {
                    redacted_prefix.push(json!({"type": "redacted_thinking", "data": ""}));
                }
            }
            redacted_prefix.extend(content);
            content = redacted_prefix;
        }

        let usage = response.usage.as_ref().map(|u| {
            let mut obj = json!({
                "input_tokens": u.input_tokens,
                "output_tokens": u.output_tokens,
            });
            if let Some(cached) = u.cached_tokens {
                obj["cache_read_input_tokens"] = json!(cached);
            }
            obj
        });

        Ok(json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": content,
            "stop_reason": canonical_to_stop_reason(response.stop_reason),
            "stop_sequence": null,
            "usage": usage,
        }))
    }

    fn parse_stream_chunk(
        &self,
        raw_event: &str,
        ctx: &mut StreamParseContext,
    ) -> Result<Vec<StreamChunk>, ProxyError> {
        let event_name = raw_event
            .lines()
            .find_map(|l| l.strip_prefix("event:"))
            .map(str::trim)
            .unwrap_or("");
        let Some(data_line) = raw_event.lines().find_map(|l| l.strip_prefix("data:")) else {
            return Ok(Vec::new());
        };
        let data: Value = serde_json::from_str(data_line.trim())
            .map_err(|e| ProxyError::InvalidRequest(format!("anthropic: bad stream json: {e}")))?;
        let event_name = if event_name.is_empty() {
            data.get("type").and_then(Value::as_str).unwrap_or("")
        } else {
            event_name
        };

        match event_name {
            "ping" | "message_start" => Ok(Vec::new()),
            "error" => {
                let message = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error")
                    .to_string();
                Ok(vec![StreamChunk::error(message)])
            }
            "content_block_start" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let block = data.get("content_block").cloned().unwrap_or_default();
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                        let name = block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        ctx.tool_json_buffers.insert(index, format!("{id}\u{0}{name}"));
                        ctx.block_types.insert(index, BlockType::ToolUse);
                        Ok(vec![StreamChunk {
                            chunk_type: StreamChunkType::ToolCall,
                            delta: Some(Part::ToolCall {
                                id,
                                name,
                                arguments: ToolArguments::Partial(String::new()),
                            }),
                            block_type: Some(BlockType::ToolUse),
                            block_index: Some(index),
                            ..Default::default()
                        }])
                    }
                    Some("thinking") => {
                        ctx.block_types.insert(index, BlockType::Thinking);
                        Ok(vec![StreamChunk {
                            chunk_type: StreamChunkType::Thinking,
                            delta: Some(Part::Thinking {
                                text: block
                                    .get("thinking")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                signature: None,
                                redacted: None,
                            }),
                            block_type: Some(BlockType::Thinking),
                            block_index: Some(index),
                            ..Default::default()
                        }])
                    }
                    Some("redacted_thinking") => {
                        ctx.block_types.insert(index, BlockType::Thinking);
                        Ok(vec![StreamChunk {
                            chunk_type: StreamChunkType::Thinking,
                            delta: Some(Part::Thinking {
                                text: String::new(),
                                signature: None,
                                redacted: Some(true),
                            }),
                            block_type: Some(BlockType::Thinking),
                            block_index: Some(index),
                            ..Default::default()
                        }])
                    }
                    _ => {
                        ctx.block_types.insert(index, BlockType::Text);
                        Ok(vec![StreamChunk {
                            chunk_type: StreamChunkType::Content,
                            delta: Some(Part::Text {
                                text: block.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                            }),
                            block_type: Some(BlockType::Text),
                            block_index: Some(index),
                            ..Default::default()
                        }])
                    }
                }
            }
            "content_block_delta" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let delta = data.get("delta").cloned().unwrap_or_default();
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => Ok(vec![StreamChunk {
                        chunk_type: StreamChunkType::Content,
                        delta: Some(Part::Text {
                            text: delta.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                        }),
                        block_type: Some(BlockType::Text),
                        block_index: Some(index),
                        ..Default::default()
                    }]),
                    Some("thinking_delta") => Ok(vec![StreamChunk {
                        chunk_type: StreamChunkType::Thinking,
                        delta: Some(Part::Thinking {
                            text: delta.get("thinking").and_then(Value::as_str).unwrap_or_default().to_string(),
                            signature: None,
                            redacted: None,
                        }),
                        block_type: Some(BlockType::Thinking),
                        block_index: Some(index),
                        ..Default::default()
                    }]),
                    Some("signature_delta") => Ok(vec![StreamChunk {
                        chunk_type: StreamChunkType::Thinking,
                        delta: Some(Part::Thinking {
                            text: String::new(),
                            signature: delta.get("signature").and_then(Value::as_str).map(str::to_string),
                            redacted: None,
                        }),
                        block_type: Some(BlockType::Thinking),
                        block_index: Some(index),
                        ..Default::default()
                    }]),
                    Some("input_json_delta") => {
                        let packed = ctx.tool_json_buffers.get(&index).cloned().unwrap_or_default();
                        let mut parts = packed.splitn(2, '\u{0}');
                        let id = parts.next().unwrap_or_default().to_string();
                        let name = parts.next().unwrap_or_default().to_string();
                        Ok(vec![StreamChunk {
                            chunk_type: StreamChunkType::ToolCall,
                            delta: Some(Part::ToolCall {
                                id,
                                name,
                                arguments: ToolArguments::Partial(
                                    delta.get("partial_json").and_then(Value::as_str).unwrap_or_default().to_string(),
                                ),
                            }),
                            block_type: Some(BlockType::ToolUse),
                            block_index: Some(index),
                            ..Default::default()
                        }])
                    }
                    _ => Ok(Vec::new()),
                }
            }
            "content_block_stop" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let block_type = ctx.block_types.remove(&index);
                Ok(vec![StreamChunk {
                    chunk_type: StreamChunkType::BlockStop,
                    block_type,
                    block_index: Some(index),
                    ..Default::default()
                }])
            }
            "message_delta" => {
                let stop_reason = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str);
                let usage = data.get("usage").map(|u| Usage {
                    input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                    output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                    total_tokens: None,
                    cached_tokens: None,
                    thinking_tokens: None,
                });
                if stop_reason.is_none() && usage.is_none() {
                    return Ok(Vec::new());
                }
                Ok(vec![StreamChunk {
                    chunk_type: StreamChunkType::Done,
                    stop_reason: stop_reason.map(|s| stop_reason_to_canonical(Some(s))),
                    usage,
                    ..Default::default()
                }])
            }
            "message_stop" => Ok(vec![StreamChunk {
                chunk_type: StreamChunkType::Done,
                ..Default::default()
            }]),
            _ => Ok(Vec::new()),
        }
    }

    fn emit_stream_chunk(
        &self,
        chunk: &StreamChunk,
        ctx: &mut StreamEmitContext,
    ) -> Result<Vec<String>, ProxyError> {
        match chunk.chunk_type {
            StreamChunkType::Content | StreamChunkType::Thinking => {
                let index = chunk.block_index.unwrap_or(0);
                let first_appearance = ctx.started_blocks.insert(index);
                match &chunk.delta {
                    Some(Part::Text { text }) => {
                        if first_appearance {
                            Ok(vec![sse_event(
                                "content_block_start",
                                &json!({"type": "content_block_start", "index": index,
                                    "content_block": {"type": "text", "text": ""}}),
                            )])
                        } else {
                            Ok(vec![sse_event(
                                "content_block_delta",
                                &json!({"type": "content_block_delta", "index": index,
                                    "delta": {"type": "text_delta", "text": text}}),
                            )])
                        }
                    }
                    Some(Part::Thinking {
                        text,
                        signature,
                        redacted,
                    }) => {
                        if redacted == &Some(true) {
                            return Ok(vec![sse_event(
                                "content_block_start",
                                &json!({"type": "content_block_start", "index": index,
                                    "content_block": {"type": "redacted_thinking", "data": ""}}),
                            )]);
                        }
                        if first_appearance {
                            return Ok(vec![sse_event(
                                "content_block_start",
                                &json!({"type": "content_block_start", "index": index,
                                    "content_block": {"type": "thinking", "thinking": ""}}),
                            )]);
                        }
                        if let Some(sig) = signature {
                            Ok(vec![sse_event(
                                "content_block_delta",
                                &json!({"type": "content_block_delta", "index": index,
                                    "delta": {"type": "signature_delta", "signature": sig}}),
                            )])
                        } else {
                            Ok(vec![sse_event(
                                "content_block_delta",
                                &json!({"type": "content_block_delta", "index": index,
                                    "delta": {"type": "thinking_delta", "thinking": text}}),
                            )])
                        }
                    }
                    _ => Ok(Vec::new()),
                }
            }
            StreamChunkType::ToolCall => {
                let index = chunk.block_index.unwrap_or(0);
                let first_appearance = ctx.started_blocks.insert(index);
                let Some(Part::ToolCall { id, name, arguments }) = &chunk.delta else {
                    return Ok(Vec::new());
                };
                if first_appearance {
                    Ok(vec![sse_event(
                        "content_block_start",
                        &json!({"type": "content_block_start", "index": index,
                            "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}}),
                    )])
                } else {
                    Ok(vec![sse_event(
                        "content_block_delta",
                        &json!({"type": "content_block_delta", "index": index,
                            "delta": {"type": "input_json_delta",
                                "partial_json": arguments.as_partial().unwrap_or_default()}}),
                    )])
                }
            }
            StreamChunkType::BlockStop => Ok(vec![sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": chunk.block_index.unwrap_or(0)}),
            )]),
            StreamChunkType::Done => {
                if chunk.stop_reason.is_none() && chunk.usage.is_none() {
                    return Ok(vec![sse_event("message_stop", &json!({"type": "message_stop"}))]);
                }
                let stop_reason = chunk.stop_reason.unwrap_or(StopReason::EndTurn);
                ctx.last_stop_reason_was_tool_use = stop_reason == StopReason::ToolUse;
                let usage = chunk.usage.as_ref().map(|u| {
                    json!({"output_tokens": u.output_tokens})
                });
                let mut out = vec![sse_event(
                    "message_delta",
                    &json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": canonical_to_stop_reason(stop_reason), "stop_sequence": null},
                        "usage": usage,
                    }),
                )];
                out.push(sse_event("message_stop", &json!({"type": "message_stop"})));
                Ok(out)
            }
            StreamChunkType::Usage => Ok(Vec::new()),
            StreamChunkType::Error => Ok(vec![sse_event(
                "error",
                &json!({"type": "error", "error": {"type": "api_error", "message": chunk.error.clone().unwrap_or_default()}}),
            )]),
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
    fn parse_request_requires_system_key() {
        let body = json!({"model": "claude-3", "messages": [], "system": null});
        assert!(AnthropicTransformer.is_supported_request(&body));
    }

    #[test]
    fn parse_request_defaults_max_tokens() {
        let body = json!({"model": "claude-3", "messages": [{"role":"user","content":"hi"}]});
        let req = AnthropicTransformer.parse_request(&body).unwrap();
        assert_eq!(req.config.unwrap().max_tokens, Some(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn redacted_thinking_is_dropped_from_content_but_kept_in_thinking_list() {
        let body = json!({
            "id": "msg_1", "model": "claude-3",
            "content": [{"type": "redacted_thinking", "data": "opaque"}, {"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1},
        });
        let resp = AnthropicTransformer.parse_response(&body).unwrap();
        assert_eq!(resp.content.len(), 1);
        assert!(matches!(resp.content[0], Part::Text { .. }));
        let thinking = resp.thinking.unwrap();
        assert_eq!(thinking.len(), 1);
        assert_eq!(thinking[0].redacted, Some(true));
    }

    #[test]
    fn stream_content_block_start_then_delta() {
        let mut ctx = StreamParseContext::default();
        let start = "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n";
        let chunks = AnthropicTransformer.parse_stream_chunk(start, &mut ctx).unwrap();
        assert_eq!(chunks[0].chunk_type, StreamChunkType::Content);

        let mut emit_ctx = StreamEmitContext::default();
        let out = AnthropicTransformer.emit_stream_chunk(&chunks[0], &mut emit_ctx).unwrap();
        assert!(out[0].contains("content_block_start"));

        let delta = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"42\"}}\n\n";
        let chunks = AnthropicTransformer.parse_stream_chunk(delta, &mut ctx).unwrap();
        let out = AnthropicTransformer.emit_stream_chunk(&chunks[0], &mut emit_ctx).unwrap();
        assert!(out[0].contains("content_block_delta"));
        assert!(out[0].contains("42"));
    }

    #[test]
    fn stream_tool_use_start_carries_id_and_name() {
        let mut ctx = StreamParseContext::default();
        let start = "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_123\",\"name\":\"get_weather\"}}\n\n";
        let chunks = AnthropicTransformer.parse_stream_chunk(start, &mut ctx).unwrap();
        match &chunks[0].delta {
            Some(Part::ToolCall { id, name, .. }) => {
                assert_eq!(id, "toolu_123");
                assert_eq!(name, "get_weather");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
