//! OpenAI chat-completions dialect transformer (C2 / §4.2 "OpenAI").
//!
//! `max_tokens` is optional; `system` is modeled as the first message with
//! `role: "system"`; tool calls live in `message.tool_calls[]`; streaming is
//! `choices[].delta` framed as standard SSE, terminated by `data: [DONE]`.

use std::collections::HashMap;

use proxy_core::error::ProxyError;
use proxy_core::model::{
    BlockType, CanonicalRequest, CanonicalResponse, GenerationConfig, Message, Part,
    RequestMetadata, Role, StopReason, StreamChunk, StreamChunkType, Tool, ToolArguments, Usage,
};
use proxy_core::stream::ParserType;
use proxy_core::transformer::{StreamEmitContext, StreamParseContext, Transformer};
use serde_json::{json, Map, Value};

pub struct OpenAiTransformer;

pub fn transformer() -> &'static OpenAiTransformer {
    &OpenAiTransformer
}

fn finish_reason_to_stop(reason: Option<&str>) -> StopReason {
    match reason {
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") => StopReason::ToolUse,
        Some("content_filter") => StopReason::ContentFilter,
        _ => StopReason::Null,
    }
}

fn stop_to_finish_reason(reason: StopReason) -> Option<&'static str> {
    match reason {
        StopReason::EndTurn => Some("stop"),
        StopReason::MaxTokens => Some("length"),
        StopReason::ToolUse => Some("tool_calls"),
        StopReason::StopSequence => Some("stop"),
        StopReason::ContentFilter => Some("content_filter"),
        StopReason::Error | StopReason::Null => None,
    }
}

fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl Transformer for OpenAiTransformer {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn is_supported_request(&self, body: &Value) -> bool {
        body.get("model").is_some() && body.get("messages").map(Value::is_array) == Some(true)
            && body.get("system").is_none()
    }

    fn parser_type(&self) -> ParserType {
        ParserType::SseStandard
    }

    fn parse_request(&self, body: &Value) -> Result<CanonicalRequest, ProxyError> {
        let raw_messages = body
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| ProxyError::InvalidRequest("openai: missing messages[]".into()))?;

        let mut system = None;
        let mut messages = Vec::new();

        for raw in raw_messages {
            let role = raw.get("role").and_then(Value::as_str).unwrap_or("user");
            if role == "system" {
                let text = content_to_text(raw.get("content").unwrap_or(&Value::Null));
                system = Some(match system {
                    Some(existing) => format!("{existing}\n{text}"),
                    None => text,
                });
                continue;
            }

            let canonical_role = match role {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                _ => Role::User,
            };

            let mut content = Vec::new();

            if canonical_role == Role::Tool {
                let tool_call_id = raw
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                content.push(Part::ToolResult {
                    tool_call_id,
                    content: content_to_text(raw.get("content").unwrap_or(&Value::Null)),
                    is_error: None,
                });
            } else {
                if let Some(raw_content) = raw.get("content") {
                    match raw_content {
                        Value::String(s) if !s.is_empty() => {
                            content.push(Part::Text { text: s.clone() })
                        }
                        Value::Array(parts) => {
                            for part in parts {
                                match part.get("type").and_then(Value::as_str) {
                                    Some("text") => content.push(Part::Text {
                                        text: part
                                            .get("text")
                                            .and_then(Value::as_str)
                                            .unwrap_or_default()
                                            .to_string(),
                                    }),
                                    Some("image_url") => {
                                        let url = part
                                            .get("image_url")
                                            .and_then(|u| u.get("url"))
                                            .and_then(Value::as_str)
                                            .unwrap_or_default()
                                            .to_string();
                                        content.push(Part::Image {
                                            mime_type: "image/png".to_string(),
                                            data: None,
                                            url: Some(url),
                                        });
                                    }
                                    _ => {}
                                }
                            }
                        }
                        _ => {}
                    }
                }

                if let Some(tool_calls) = raw.get("tool_calls").and_then(Value::as_array) {
                    for tc in tool_calls {
                        let id = tc.get("id").and_then(Value::as_str).unwrap_or_default();
                        let function = tc.get("function").cloned().unwrap_or_default();
                        let name = function
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let args_str = function
                            .get("arguments")
                            .and_then(Value::as_str)
                            .unwrap_or("{}");
                        let arguments = serde_json::from_str::<Value>(args_str)
                            .map(ToolArguments::Value)
                            .unwrap_or_else(|_| ToolArguments::Partial(args_str.to_string()));
                        content.push(Part::ToolCall {
                            id: id.to_string(),
                            name: name.to_string(),
                            arguments,
                        });
                    }
                }
            }

            messages.push(Message {
                role: canonical_role,
                content,
            });
        }

        let tools = body.get("tools").and_then(Value::as_array).map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let function = t.get("function")?;
                    Some(Tool {
                        name: function.get("name")?.as_str()?.to_string(),
                        description: function
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        parameters: function
                            .get("parameters")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    })
                })
                .collect()
        });

        let config = GenerationConfig {
            max_tokens: body
                .get("max_tokens")
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            temperature: body
                .get("temperature")
                .and_then(Value::as_f64)
                .map(|n| n as f32),
            top_p: body.get("top_p").and_then(Value::as_f64).map(|n| n as f32),
            top_k: None,
            stop_sequences: match body.get("stop") {
                Some(Value::String(s)) => Some(vec![s.clone()]),
                Some(Value::Array(a)) => {
                    Some(a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                }
                _ => None,
            },
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
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }

        for message in &request.messages {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };

            // A tool_result part is emitted as its own `role: tool` message;
            // other parts accumulate into one message of the original role.
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();

            for part in &message.content {
                match part {
                    Part::Text { text } => text_parts.push(text.clone()),
                    Part::ToolCall {
                        id,
                        name,
                        arguments,
                    } => {
                        let arguments_str = match arguments {
                            ToolArguments::Value(v) => v.to_string(),
                            ToolArguments::Partial(s) => s.clone(),
                        };
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": arguments_str},
                        }));
                    }
                    Part::ToolResult {
                        tool_call_id,
                        content,
                        ..
                    } => {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": content,
                        }));
                    }
                    Part::Image { url: Some(url), .. } => text_parts.push(url.clone()),
                    _ => {}
                }
            }

            if !text_parts.is_empty() || !tool_calls.is_empty() {
                let mut out = Map::new();
                out.insert("role".to_string(), json!(role));
                if !text_parts.is_empty() {
                    out.insert("content".to_string(), json!(text_parts.join("")));
                } else {
                    out.insert("content".to_string(), Value::Null);
                }
                if !tool_calls.is_empty() {
                    out.insert("tool_calls".to_string(), json!(tool_calls));
                }
                messages.push(Value::Object(out));
            }
        }

        let mut body = Map::new();
        body.insert("model".to_string(), json!(model));
        body.insert("messages".to_string(), json!(messages));

        if let Some(config) = &request.config {
            if let Some(max_tokens) = config.max_tokens {
                body.insert("max_tokens".to_string(), json!(max_tokens));
            }
            if let Some(t) = config.temperature {
                body.insert("temperature".to_string(), json!(t));
            }
            if let Some(p) = config.top_p {
                body.insert("top_p".to_string(), json!(p));
            }
            if let Some(stop) = &config.stop_sequences {
                body.insert("stop".to_string(), json!(stop));
            }
        }

        if let Some(tools) = &request.tools {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body.insert("tools".to_string(), json!(tools));
        }

        Ok(Value::Object(body))
    }

    fn parse_response(&self, body: &Value) -> Result<CanonicalResponse, ProxyError> {
        let choice = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .ok_or_else(|| ProxyError::InvalidRequest("openai: missing choices[0]".into()))?;
        let message = choice.get("message").cloned().unwrap_or_default();

        let mut content = Vec::new();
        if let Some(text) = message.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                content.push(Part::Text {
                    text: text.to_string(),
                });
            }
        }
        if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
            for tc in tool_calls {
                let id = tc.get("id").and_then(Value::as_str).unwrap_or_default();
                let function = tc.get("function").cloned().unwrap_or_default();
                let name = function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let args_str = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}");
                let arguments = serde_json::from_str::<Value>(args_str)
                    .map(ToolArguments::Value)
                    .unwrap_or_else(|_| ToolArguments::Partial(args_str.to_string()));
                content.push(Part::ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                });
            }
        }

        let usage = body.get("usage").map(|u| Usage {
            input_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            output_tokens: u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(Value::as_u64).map(|n| n as u32),
            cached_tokens: None,
            thinking_tokens: None,
        });

        Ok(CanonicalResponse {
            id: body
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content,
            stop_reason: finish_reason_to_stop(choice.get("finish_reason").and_then(Value::as_str)),
            usage,
            model: body
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            thinking: None,
        })
    }

    fn emit_response(&self, response: &CanonicalResponse) -> Result<Value, ProxyError> {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in &response.content {
            match part {
                Part::Text { text: t } => text.push_str(t),
                Part::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    let arguments_str = match arguments {
                        ToolArguments::Value(v) => v.to_string(),
                        ToolArguments::Partial(s) => s.clone(),
                    };
                    tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": arguments_str},
                    }));
                }
                _ => {}
            }
        }

        let mut message = Map::new();
        message.insert("role".to_string(), json!("assistant"));
        message.insert(
            "content".to_string(),
            if text.is_empty() {
                Value::Null
            } else {
                json!(text)
            },
        );
        if !tool_calls.is_empty() {
            message.insert("tool_calls".to_string(), json!(tool_calls));
        }

        let usage = response.usage.as_ref().map(|u| {
            json!({
                "prompt_tokens": u.input_tokens,
                "completion_tokens": u.output_tokens,
                "total_tokens": u.total_tokens.unwrap_or(u.input_tokens + u.output_tokens),
            })
        });

        Ok(json!({
            "id": response.id,
            "object": "chat.completion",
            "model": response.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": stop_to_finish_reason(response.stop_reason),
            }],
            "usage": usage,
        }))
    }

    fn parse_stream_chunk(
        &self,
        raw_event: &str,
        ctx: &mut StreamParseContext,
    ) -> Result<Vec<StreamChunk>, ProxyError> {
        let Some(data) = extract_data_line(raw_event) else {
            return Ok(Vec::new());
        };
        if data.trim() == "[DONE]" {
            return Ok(Vec::new());
        }
        let event: Value = serde_json::from_str(data)
            .map_err(|e| ProxyError::InvalidRequest(format!("openai: bad stream json: {e}")))?;

        let Some(choice) = event.get("choices").and_then(Value::as_array).and_then(|c| c.first())
        else {
            return Ok(Vec::new());
        };
        let delta = choice.get("delta").cloned().unwrap_or_default();
        let mut out = Vec::new();

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            out.push(StreamChunk {
                chunk_type: StreamChunkType::Content,
                delta: Some(Part::Text {
                    text: text.to_string(),
                }),
                block_type: Some(BlockType::Text),
                ..Default::default()
            });
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for tc in tool_calls {
                let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let function = tc.get("function").cloned().unwrap_or_default();
                let arg_fragment = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();

                let (id, name) = if let Some(id) = tc.get("id").and_then(Value::as_str) {
                    let name = function
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    ctx.tool_json_buffers
                        .insert(index, format!("{id}\u{0}{name}"));
                    (id.to_string(), name)
                } else {
                    let packed = ctx
                        .tool_json_buffers
                        .get(&index)
                        .cloned()
                        .unwrap_or_default();
                    let mut parts = packed.splitn(2, '\u{0}');
                    (
                        parts.next().unwrap_or_default().to_string(),
                        parts.next().unwrap_or_default().to_string(),
                    )
                };

                out.push(StreamChunk {
                    chunk_type: StreamChunkType::ToolCall,
                    delta: Some(Part::ToolCall {
                        id,
                        name,
                        arguments: ToolArguments::Partial(arg_fragment),
                    }),
                    block_type: Some(BlockType::ToolUse),
                    block_index: Some(index),
                    ..Default::default()
                });
            }
        }

        if let Some(finish_reason) = choice.get("finish_reason").and_then(Value::as_str) {
            out.push(StreamChunk {
                chunk_type: StreamChunkType::Done,
                stop_reason: Some(finish_reason_to_stop(Some(finish_reason))),
                ..Default::default()
            });
        }

        if let Some(usage) = event.get("usage") {
            out.push(StreamChunk {
                chunk_type: StreamChunkType::Usage,
                usage: Some(Usage {
                    input_tokens: usage
                        .get("prompt_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                    output_tokens: usage
                        .get("completion_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                    total_tokens: usage.get("total_tokens").and_then(Value::as_u64).map(|n| n as u32),
                    cached_tokens: None,
                    thinking_tokens: None,
                }),
                ..Default::default()
            });
        }

        Ok(out)
    }

    fn emit_stream_chunk(
        &self,
        chunk: &StreamChunk,
        _ctx: &mut StreamEmitContext,
    ) -> Result<Vec<String>, ProxyError> {
        match chunk.chunk_type {
            StreamChunkType::Content => {
                if let Some(Part::Text { text }) = &chunk.delta {
                    return Ok(vec![sse_frame(&json!({
                        "object": "chat.completion.chunk",
                        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}],
                    }))]);
                }
                Ok(vec![])
            }
            StreamChunkType::ToolCall => {
                if let Some(Part::ToolCall {
                    id,
                    name,
                    arguments,
                }) = &chunk.delta
                {
                    let arg_fragment = arguments.as_partial().unwrap_or_default();
                    let mut function = json!({"arguments": arg_fragment});
                    if !name.is_empty() {
                        function["name"] = json!(name);
                    }
                    let mut tool_call = json!({
                        "index": chunk.block_index.unwrap_or(0),
                        "function": function,
                    });
                    if !id.is_empty() {
                        tool_call["id"] = json!(id);
                        tool_call["type"] = json!("function");
                    }
                    return Ok(vec![sse_frame(&json!({
                        "object": "chat.completion.chunk",
                        "choices": [{"index": 0, "delta": {"tool_calls": [tool_call]}, "finish_reason": null}],
                    }))]);
                }
                Ok(vec![])
            }
            StreamChunkType::Thinking => Ok(vec![]),
            StreamChunkType::BlockStop => Ok(vec![]),
            StreamChunkType::Done => {
                let mut out = vec![sse_frame(&json!({
                    "object": "chat.completion.chunk",
                    "choices": [{
                        "index": 0,
                        "delta": {},
                        "finish_reason": stop_to_finish_reason(chunk.stop_reason.unwrap_or(StopReason::EndTurn)),
                    }],
                }))];
                out.push("data: [DONE]\n\n".to_string());
                Ok(out)
            }
            StreamChunkType::Usage => Ok(vec![]),
            StreamChunkType::Error => Ok(vec![sse_frame(&json!({
                "error": {"message": chunk.error.clone().unwrap_or_default()},
            }))]),
        }
    }
}

fn extract_data_line(raw_event: &str) -> Option<&str> {
    raw_event
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
}

fn sse_frame(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_request() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hello"}],
        });
        let req = OpenAiTransformer.parse_request(&body).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::User);
    }

    #[test]
    fn emit_response_maps_tool_use_finish_reason() {
        let response = CanonicalResponse {
            id: "resp_1".into(),
            content: vec![Part::ToolCall {
                id: "call_1".into(),
                name: "get_weather".into(),
                arguments: ToolArguments::Value(json!({"location": "NYC"})),
            }],
            stop_reason: StopReason::ToolUse,
            usage: None,
            model: Some("gpt-4".into()),
            thinking: None,
        };
        let out = OpenAiTransformer.emit_response(&response).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], json!("tool_calls"));
    }

    #[test]
    fn detects_not_supported_when_system_key_present() {
        let body = json!({"model": "x", "messages": [], "system": "hi"});
        assert!(!OpenAiTransformer.is_supported_request(&body));
    }

    #[test]
    fn stream_tool_call_chunks_remember_id_across_deltas() {
        let mut ctx = StreamParseContext::default();
        let first = "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"{\\\"x\\\":1\"}}]}}]}";
        let chunks = OpenAiTransformer.parse_stream_chunk(first, &mut ctx).unwrap();
        assert_eq!(chunks.len(), 1);

        let second = "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"}\"}}]}}]}";
        let chunks = OpenAiTransformer.parse_stream_chunk(second, &mut ctx).unwrap();
        match &chunks[0].delta {
            Some(Part::ToolCall { id, name, .. }) => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "get_weather");
            }
            other => panic!("expected tool call delta, got {other:?}"),
        }
    }
}
