//! Google Gemini `generateContent` dialect transformer (C2 / §4.2 "Gemini").
//!
//! `contents[].role ∈ {user, model}`; parts carry
//! `text|inlineData|functionCall|functionResponse|thought`; system prompt is
//! `systemInstruction.parts[0].text`. JSON-Schema `type` values are
//! UPPERCASE on the wire, lowercase in canonical. Streams are line-delimited
//! `data: {...}` with no `[DONE]`; the terminal event is a candidate whose
//! `finishReason` is set.
//!
//! The part/schema/finish-reason helpers below are `pub` (rather than
//! private) so `dialect-antigravity` can reuse them for its own
//! Gemini-shaped inner payload instead of re-deriving the same mapping.

use proxy_core::error::ProxyError;
use proxy_core::model::{
    BlockType, CanonicalRequest, CanonicalResponse, GenerationConfig, Message, Part, Role,
    StopReason, StreamChunk, StreamChunkType, Tool, ToolArguments, Usage,
};
use proxy_core::stream::ParserType;
use proxy_core::transformer::{StreamEmitContext, StreamParseContext, Transformer};
use serde_json::{json, Map, Value};

pub struct GeminiTransformer;

pub fn transformer() -> &'static GeminiTransformer {
    &GeminiTransformer
}

pub fn finish_reason_to_stop(reason: Option<&str>) -> StopReason {
    match reason {
        Some("STOP") => StopReason::EndTurn,
        Some("MAX_TOKENS") => StopReason::MaxTokens,
        Some("SAFETY") | Some("RECITATION") => StopReason::ContentFilter,
        None => StopReason::Null,
        Some(_) => StopReason::EndTurn,
    }
}

pub fn stop_to_finish_reason(reason: StopReason, has_tool_call: bool) -> &'static str {
    if has_tool_call {
        return "STOP";
    }
    match reason {
        StopReason::MaxTokens => "MAX_TOKENS",
        StopReason::ContentFilter => "SAFETY",
        _ => "STOP",
    }
}

/// Recursively upper/lower-cases JSON-Schema `type` string(s), descending
/// into the nodes that can themselves carry schemas.
pub fn schema_case(schema: &Value, upper: bool) -> Value {
    match schema {
        Value::Object(obj) => {
            let mut out = Map::new();
            for (key, value) in obj {
                if key == "type" {
                    out.insert(key.clone(), transform_type_value(value, upper));
                } else if matches!(
                    key.as_str(),
                    "properties" | "$defs" | "definitions"
                ) {
                    if let Value::Object(inner) = value {
                        let mut converted = Map::new();
                        for (k, v) in inner {
                            converted.insert(k.clone(), schema_case(v, upper));
                        }
                        out.insert(key.clone(), Value::Object(converted));
                    } else {
                        out.insert(key.clone(), value.clone());
                    }
                } else if matches!(key.as_str(), "items" | "additionalProperties") {
                    out.insert(key.clone(), schema_case(value, upper));
                } else if matches!(key.as_str(), "anyOf" | "oneOf" | "allOf") {
                    if let Value::Array(items) = value {
                        out.insert(
                            key.clone(),
                            Value::Array(items.iter().map(|v| schema_case(v, upper)).collect()),
                        );
                    } else {
                        out.insert(key.clone(), value.clone());
                    }
                } else {
                    out.insert(key.clone(), value.clone());
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn transform_type_value(value: &Value, upper: bool) -> Value {
    match value {
        Value::String(s) => json!(if upper { s.to_uppercase() } else { s.to_lowercase() }),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| transform_type_value(v, upper))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn parse_parts(parts: &[Value]) -> Vec<Part> {
    let mut out = Vec::new();
    for part in parts {
        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            out.push(Part::Thinking {
                text: part.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                signature: part
                    .get("thoughtSignature")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                redacted: None,
            });
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push(Part::Text {
                text: text.to_string(),
            });
            continue;
        }
        if let Some(inline) = part.get("inlineData") {
            out.push(Part::Image {
                mime_type: inline
                    .get("mimeType")
                    .and_then(Value::as_str)
                    .unwrap_or("image/png")
                    .to_string(),
                data: inline.get("data").and_then(Value::as_str).map(str::to_string),
                url: None,
            });
            continue;
        }
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let arguments = match call.get("args") {
                Some(Value::String(s)) => ToolArguments::Partial(s.clone()),
                Some(value) => ToolArguments::Value(value.clone()),
                None => ToolArguments::Value(json!({})),
            };
            out.push(Part::ToolCall {
                id: name.clone(),
                name,
                arguments,
            });
            continue;
        }
        if let Some(response) = part.get("functionResponse") {
            let name = response.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let content = response
                .get("response")
                .map(|v| v.to_string())
                .unwrap_or_default();
            out.push(Part::ToolResult {
                tool_call_id: name,
                content,
                is_error: None,
            });
        }
    }
    out
}

pub fn emit_parts(parts: &[Part]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(json!({"text": text})),
            Part::Image { mime_type, data, .. } => data
                .as_ref()
                .map(|data| json!({"inlineData": {"mimeType": mime_type, "data": data}})),
            Part::Thinking { text, signature, .. } => {
                let mut obj = json!({"text": text, "thought": true});
                if let Some(sig) = signature {
                    obj["thoughtSignature"] = json!(sig);
                }
                Some(obj)
            }
            Part::ToolCall { name, arguments, .. } => Some(json!({
                "functionCall": {
                    "name": name,
                    "args": arguments.as_value().cloned().unwrap_or(json!({})),
                },
            })),
            Part::ToolResult { tool_call_id, content, .. } => Some(json!({
                "functionResponse": {
                    "name": tool_call_id,
                    "response": serde_json::from_str::<Value>(content)
                        .unwrap_or_else(|_| json!({"result": content})),
                },
            })),
        })
        .collect()
}

impl Transformer for GeminiTransformer {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn is_supported_request(&self, body: &Value) -> bool {
        body.get("contents").map(Value::is_array) == Some(true) && body.get("project").is_none()
    }

    fn parser_type(&self) -> ParserType {
        ParserType::SseLineDelimited
    }

    fn parse_request(&self, body: &Value) -> Result<CanonicalRequest, ProxyError> {
        let raw_contents = body
            .get("contents")
            .and_then(Value::as_array)
            .ok_or_else(|| ProxyError::InvalidRequest("gemini: missing contents[]".into()))?;

        let messages = raw_contents
            .iter()
            .map(|c| {
                let role = match c.get("role").and_then(Value::as_str) {
                    Some("model") => Role::Assistant,
                    _ => Role::User,
                };
                let parts = c.get("parts").and_then(Value::as_array).cloned().unwrap_or_default();
                Message {
                    role,
                    content: parse_parts(&parts),
                }
            })
            .collect();

        let system = body
            .get("systemInstruction")
            .and_then(|s| s.get("parts"))
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .and_then(|p| p.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let tools = body.get("tools").and_then(Value::as_array).map(|tools| {
            tools
                .iter()
                .flat_map(|t| {
                    t.get("functionDeclarations")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default()
                })
                .filter_map(|decl| {
                    Some(Tool {
                        name: decl.get("name")?.as_str()?.to_string(),
                        description: decl.get("description").and_then(Value::as_str).map(str::to_string),
                        parameters: schema_case(
                            &decl
                                .get("parameters")
                                .cloned()
                                .unwrap_or_else(|| json!({"type": "OBJECT", "properties": {}})),
                            false,
                        ),
                    })
                })
                .collect()
        });

        let gen_config = body.get("generationConfig");
        let config = GenerationConfig {
            max_tokens: gen_config
                .and_then(|c| c.get("maxOutputTokens"))
                .and_then(Value::as_u64)
                .map(|n| n as u32),
            temperature: gen_config
                .and_then(|c| c.get("temperature"))
                .and_then(Value::as_f64)
                .map(|n| n as f32),
            top_p: gen_config.and_then(|c| c.get("topP")).and_then(Value::as_f64).map(|n| n as f32),
            top_k: gen_config.and_then(|c| c.get("topK")).and_then(Value::as_u64).map(|n| n as u32),
            stop_sequences: gen_config
                .and_then(|c| c.get("stopSequences"))
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()),
        };

        Ok(CanonicalRequest {
            messages,
            system,
            tools,
            config: Some(config),
            thinking: None,
            metadata: None,
        })
    }

    fn emit_request(&self, request: &CanonicalRequest, _model: &str) -> Result<Value, ProxyError> {
        let contents: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                json!({"role": role, "parts": emit_parts(&m.content)})
            })
            .collect();

        let mut body = Map::new();
        body.insert("contents".to_string(), json!(contents));

        if let Some(system) = &request.system {
            body.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": system}]}),
            );
        }

        if let Some(tools) = &request.tools {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": schema_case(&t.parameters, true),
                    })
                })
                .collect();
            body.insert(
                "tools".to_string(),
                json!([{"functionDeclarations": declarations}]),
            );
        }

        if let Some(config) = &request.config {
            let mut gen = Map::new();
            if let Some(v) = config.max_tokens {
                gen.insert("maxOutputTokens".to_string(), json!(v));
            }
            if let Some(v) = config.temperature {
                gen.insert("temperature".to_string(), json!(v));
            }
            if let Some(v) = config.top_p {
                gen.insert("topP".to_string(), json!(v));
            }
            if let Some(v) = config.top_k {
                gen.insert("topK".to_string(), json!(v));
            }
            if let Some(v) = &config.stop_sequences {
                gen.insert("stopSequences".to_string(), json!(v));
            }
            if !gen.is_empty() {
                body.insert("generationConfig".to_string(), Value::Object(gen));
            }
        }

        Ok(Value::Object(body))
    }

    fn parse_response(&self, body: &Value) -> Result<CanonicalResponse, ProxyError> {
        let candidate = body
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .ok_or_else(|| ProxyError::InvalidRequest("gemini: missing candidates[0]".into()))?;

        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let content = parse_parts(&parts);

        let thinking: Vec<_> = content
            .iter()
            .filter_map(|p| match p {
                Part::Thinking { text, signature, .. } => Some(proxy_core::model::ThinkingBlock {
                    text: text.clone(),
                    signature: signature.clone(),
                    redacted: None,
                }),
                _ => None,
            })
            .collect();

        let has_tool_call = content.iter().any(|p| matches!(p, Part::ToolCall { .. }));
        let mut stop_reason = finish_reason_to_stop(candidate.get("finishReason").and_then(Value::as_str));
        if has_tool_call && stop_reason == StopReason::EndTurn {
            stop_reason = StopReason::ToolUse;
        }

        let usage = body.get("usageMetadata").map(|u| Usage {
            input_tokens: u.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
            output_tokens: u.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
            total_tokens: u.get("totalTokenCount").and_then(Value::as_u64).map(|n| n as u32),
            cached_tokens: None,
            thinking_tokens: u.get("thoughtsTokenCount").and_then(Value::as_u64).map(|n| n as u32),
        });

        Ok(CanonicalResponse {
            id: body.get("responseId").and_then(Value::as_str).unwrap_or_default().to_string(),
            content,
            stop_reason,
            usage,
            model: body.get("modelVersion").and_then(Value::as_str).map(str::to_string),
            thinking: if thinking.is_empty() { None } else { Some(thinking) },
        })
    }

    fn emit_response(&self, response: &CanonicalResponse) -> Result<Value, ProxyError> {
        let has_tool_call = response.content.iter().any(|p| matches!(p, Part::ToolCall { .. }));
        let usage = response.usage.as_ref().map(|u| {
            json!({
                "promptTokenCount": u.input_tokens,
                "candidatesTokenCount": u.output_tokens,
                "totalTokenCount": u.total_tokens.unwrap_or(u.input_tokens + u.output_tokens),
            })
        });

        Ok(json!({
            "candidates": [{
                "content": {"role": "model", "parts": emit_parts(&response.content)},
                "finishReason": stop_to_finish_reason(response.stop_reason, has_tool_call),
                "index": 0,
            }],
            "usageMetadata": usage,
            "modelVersion": response.model,
        }))
    }

    fn parse_stream_chunk(
        &self,
        raw_event: &str,
        ctx: &mut StreamParseContext,
    ) -> Result<Vec<StreamChunk>, ProxyError> {
        let Some(data) = raw_event.lines().find_map(|l| l.strip_prefix("data:")) else {
            return Ok(Vec::new());
        };
        let event: Value = serde_json::from_str(data.trim())
            .map_err(|e| ProxyError::InvalidRequest(format!("gemini: bad stream json: {e}")))?;

        let Some(candidate) = event.get("candidates").and_then(Value::as_array).and_then(|c| c.first())
        else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for (tool_index, part) in parts.iter().enumerate() {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                out.push(StreamChunk {
                    chunk_type: StreamChunkType::Thinking,
                    delta: Some(Part::Thinking {
                        text: part.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                        signature: part.get("thoughtSignature").and_then(Value::as_str).map(str::to_string),
                        redacted: None,
                    }),
                    block_type: Some(BlockType::Thinking),
                    ..Default::default()
                });
                continue;
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                out.push(StreamChunk {
                    chunk_type: StreamChunkType::Content,
                    delta: Some(Part::Text { text: text.to_string() }),
                    block_type: Some(BlockType::Text),
                    ..Default::default()
                });
                continue;
            }
            if let Some(call) = part.get("functionCall") {
                let index = tool_index as u32;
                let has_name = call.get("name").and_then(Value::as_str).is_some();
                let name = if has_name {
                    let name = call.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                    ctx.tool_json_buffers.insert(index, name.clone());
                    name
                } else {
                    ctx.tool_json_buffers.get(&index).cloned().unwrap_or_default()
                };
                let arguments = match call.get("args") {
                    Some(Value::String(s)) => ToolArguments::Partial(s.clone()),
                    Some(value) => ToolArguments::Value(value.clone()),
                    None => ToolArguments::Partial(String::new()),
                };
                out.push(StreamChunk {
                    chunk_type: StreamChunkType::ToolCall,
                    delta: Some(Part::ToolCall {
                        id: name.clone(),
                        name,
                        arguments,
                    }),
                    block_type: Some(BlockType::ToolUse),
                    block_index: Some(index),
                    ..Default::default()
                });
            }
        }

        if let Some(finish_reason) = candidate.get("finishReason").and_then(Value::as_str) {
            out.push(StreamChunk {
                chunk_type: StreamChunkType::Done,
                stop_reason: Some(finish_reason_to_stop(Some(finish_reason))),
                ..Default::default()
            });
        }

        if let Some(usage) = event.get("usageMetadata") {
            out.push(StreamChunk {
                chunk_type: StreamChunkType::Usage,
                usage: Some(Usage {
                    input_tokens: usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
                    output_tokens: usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
                    total_tokens: usage.get("totalTokenCount").and_then(Value::as_u64).map(|n| n as u32),
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
                    return Ok(vec![frame(&json!({
                        "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}, "index": 0}],
                    }))]);
                }
                Ok(vec![])
            }
            StreamChunkType::Thinking => {
                if let Some(Part::Thinking { text, signature, .. }) = &chunk.delta {
                    let mut part = json!({"text": text, "thought": true});
                    if let Some(sig) = signature {
                        part["thoughtSignature"] = json!(sig);
                    }
                    return Ok(vec![frame(&json!({
                        "candidates": [{"content": {"role": "model", "parts": [part]}, "index": 0}],
                    }))]);
                }
                Ok(vec![])
            }
            StreamChunkType::ToolCall => {
                if let Some(Part::ToolCall { name, arguments, .. }) = &chunk.delta {
                    let args = match arguments {
                        ToolArguments::Value(v) => v.clone(),
                        ToolArguments::Partial(s) => json!(s),
                    };
                    return Ok(vec![frame(&json!({
                        "candidates": [{
                            "content": {"role": "model", "parts": [{"functionCall": {"name": name, "args": args}}]},
                            "index": 0,
                        }],
                    }))]);
                }
                Ok(vec![])
            }
            StreamChunkType::BlockStop => Ok(vec![]),
            StreamChunkType::Done => Ok(vec![frame(&json!({
                "candidates": [{
                    "content": {"role": "model", "parts": []},
                    "finishReason": stop_to_finish_reason(
                        chunk.stop_reason.unwrap_or(StopReason::EndTurn),
                        chunk.stop_reason == Some(StopReason::ToolUse),
                    ),
                    "index": 0,
                }],
            }))]),
            StreamChunkType::Usage => Ok(vec![]),
            StreamChunkType::Error => Ok(vec![frame(&json!({
                "error": {"message": chunk.error.clone().unwrap_or_default()},
            }))]),
        }
    }
}

pub fn frame(payload: &Value) -> String {
    format!("data: {payload}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_request_with_system_instruction() {
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "systemInstruction": {"parts": [{"text": "be nice"}]},
        });
        let req = GeminiTransformer.parse_request(&body).unwrap();
        assert_eq!(req.system.as_deref(), Some("be nice"));
        assert_eq!(req.messages[0].role, Role::User);
    }

    #[test]
    fn schema_types_are_uppercased_on_emit() {
        let schema = json!({"type": "object", "properties": {"x": {"type": "integer"}}});
        let upper = schema_case(&schema, true);
        assert_eq!(upper["type"], json!("OBJECT"));
        assert_eq!(upper["properties"]["x"]["type"], json!("INTEGER"));
    }

    #[test]
    fn partial_function_call_args_accumulate_across_chunks() {
        let mut ctx = StreamParseContext::default();
        let fragments = ["{\"x\":10", ", \"y\":20", "}"];
        let mut collected = String::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let event = if i == 0 {
                format!(
                    "data: {{\"candidates\":[{{\"content\":{{\"parts\":[{{\"functionCall\":{{\"name\":\"f\",\"args\":{:?}}}}}]}}}}]}}",
                    fragment
                )
            } else {
                format!(
                    "data: {{\"candidates\":[{{\"content\":{{\"parts\":[{{\"functionCall\":{{\"args\":{:?}}}}}]}}}}]}}",
                    fragment
                )
            };
            let chunks = GeminiTransformer.parse_stream_chunk(&event, &mut ctx).unwrap();
            if let Some(Part::ToolCall { arguments: ToolArguments::Partial(s), .. }) = &chunks[0].delta {
                collected.push_str(s);
            }
        }
        assert_eq!(collected, "{\"x\":10, \"y\":20}");
        assert_eq!(
            serde_json::from_str::<Value>(&collected).unwrap(),
            json!({"x": 10, "y": 20})
        );
    }

    #[test]
    fn finish_reason_safety_maps_to_content_filter() {
        assert_eq!(finish_reason_to_stop(Some("SAFETY")), StopReason::ContentFilter);
    }
}
