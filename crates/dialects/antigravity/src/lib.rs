//! Antigravity wrapper dialect transformer (C2 / §4.2 "Antigravity").
//!
//! Wraps a Gemini-shaped `payload` inside `{project, model, userAgent,
//! requestId, payload:{...}}`; responses are wrapped as `{response:{...},
//! responseId?, traceId?}`. Tool-call `functionCall` parts may carry a
//! `thoughtSignature` to satisfy Claude-compat validators; when the target
//! model is a Claude-family model, `thinkingConfig` must use snake_case
//! keys (`include_thoughts`, `thinking_budget`) instead of Gemini's own
//! camelCase. The part/schema/finish-reason mapping itself is identical to
//! plain Gemini, so it's reused from `dialect_gemini` rather than
//! re-derived here.

use proxy_core::error::ProxyError;
use proxy_core::model::{
    CanonicalRequest, CanonicalResponse, GenerationConfig, Message, RequestMetadata, Role,
    StreamChunk, ThinkingConfig, Tool, Usage,
};
use proxy_core::stream::ParserType;
use proxy_core::transformer::{StreamEmitContext, StreamParseContext, Transformer};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub struct AntigravityTransformer;

pub fn transformer() -> &'static AntigravityTransformer {
    &AntigravityTransformer
}

/// Model-family check used to decide `thinkingConfig` key casing (§4.2).
fn is_claude_family(model: &str) -> bool {
    model.to_lowercase().contains("claude")
}

fn thinking_config_from_payload(payload: &Value) -> Option<ThinkingConfig> {
    let tc = payload.get("thinkingConfig").or_else(|| payload.get("thinking_config"))?;
    let include_thoughts = tc
        .get("includeThoughts")
        .or_else(|| tc.get("include_thoughts"))
        .and_then(Value::as_bool);
    let budget = tc
        .get("thinkingBudget")
        .or_else(|| tc.get("thinking_budget"))
        .and_then(Value::as_u64)
        .map(|n| n as u32);
    Some(ThinkingConfig {
        enabled: true,
        budget,
        include_thoughts,
    })
}

fn emit_thinking_config(thinking: &proxy_core::model::ThinkingConfig, model: &str) -> Value {
    if is_claude_family(model) {
        json!({
            "include_thoughts": thinking.include_thoughts.unwrap_or(true),
            "thinking_budget": thinking.budget,
        })
    } else {
        json!({
            "includeThoughts": thinking.include_thoughts.unwrap_or(true),
            "thinkingBudget": thinking.budget,
        })
    }
}

impl Transformer for AntigravityTransformer {
    fn name(&self) -> &'static str {
        "antigravity"
    }

    fn is_supported_request(&self, body: &Value) -> bool {
        body.get("payload")
            .and_then(|p| p.get("contents"))
            .map(Value::is_array)
            == Some(true)
    }

    fn parser_type(&self) -> ParserType {
        ParserType::SseLineDelimited
    }

    fn parse_request(&self, body: &Value) -> Result<CanonicalRequest, ProxyError> {
        let payload = body
            .get("payload")
            .ok_or_else(|| ProxyError::InvalidRequest("antigravity: missing payload".into()))?;
        let raw_contents = payload
            .get("contents")
            .and_then(Value::as_array)
            .ok_or_else(|| ProxyError::InvalidRequest("antigravity: missing payload.contents[]".into()))?;

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
                    content: dialect_gemini::parse_parts(&parts),
                }
            })
            .collect();

        let system = payload
            .get("systemInstruction")
            .and_then(|s| s.get("parts"))
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .and_then(|p| p.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let tools = payload.get("tools").and_then(Value::as_array).map(|tools| {
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
                        parameters: dialect_gemini::schema_case(
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

        let gen_config = payload.get("generationConfig");
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
            thinking: thinking_config_from_payload(payload),
            metadata: Some(RequestMetadata {
                model: body.get("model").and_then(Value::as_str).map(str::to_string),
                ..Default::default()
            }),
        })
    }

    fn emit_request(&self, request: &CanonicalRequest, model: &str) -> Result<Value, ProxyError> {
        let contents: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = if m.role == Role::Assistant { "model" } else { "user" };
                json!({"role": role, "parts": dialect_gemini::emit_parts(&m.content)})
            })
            .collect();

        let mut payload = Map::new();
        payload.insert("contents".to_string(), json!(contents));

        if let Some(system) = &request.system {
            payload.insert(
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
                        "parameters": dialect_gemini::schema_case(&t.parameters, true),
                    })
                })
                .collect();
            payload.insert(
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
                payload.insert("generationConfig".to_string(), Value::Object(gen));
            }
        }

        if let Some(thinking) = &request.thinking {
            if thinking.enabled {
                payload.insert("thinkingConfig".to_string(), emit_thinking_config(thinking, model));
            }
        }

        Ok(json!({
            "project": request.metadata.as_ref().and_then(|m| m.project.clone()),
            "model": model,
            "userAgent": "antigravity-proxy",
            "requestId": Uuid::new_v4().to_string(),
            "payload": Value::Object(payload),
        }))
    }

    fn parse_response(&self, body: &Value) -> Result<CanonicalResponse, ProxyError> {
        let inner = body.get("response").unwrap_or(body);
        let mut response = parse_gemini_shaped_response(inner)?;
        if let Some(id) = body.get("responseId").and_then(Value::as_str) {
            response.id = id.to_string();
        }
        Ok(response)
    }

    fn emit_response(&self, response: &CanonicalResponse) -> Result<Value, ProxyError> {
        let has_tool_call = response
            .content
            .iter()
            .any(|p| matches!(p, proxy_core::model::Part::ToolCall { .. }));
        let usage = response.usage.as_ref().map(|u| {
            json!({
                "promptTokenCount": u.input_tokens,
                "candidatesTokenCount": u.output_tokens,
                "totalTokenCount": u.total_tokens.unwrap_or(u.input_tokens + u.output_tokens),
            })
        });

        Ok(json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": dialect_gemini::emit_parts(&response.content)},
                    "finishReason": dialect_gemini::stop_to_finish_reason(response.stop_reason, has_tool_call),
                    "index": 0,
                }],
                "usageMetadata": usage,
                "modelVersion": response.model,
            },
            "responseId": response.id,
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
            .map_err(|e| ProxyError::InvalidRequest(format!("antigravity: bad stream json: {e}")))?;
        let inner = event.get("response").cloned().unwrap_or(event);
        parse_gemini_shaped_stream_chunk(&inner, ctx)
    }

    fn emit_stream_chunk(
        &self,
        chunk: &StreamChunk,
        ctx: &mut StreamEmitContext,
    ) -> Result<Vec<String>, ProxyError> {
        // Delegate to Gemini's own framing, then wrap the candidate payload
        // under a `response` key per this dialect's envelope.
        let frames = dialect_gemini::transformer().emit_stream_chunk(chunk, ctx)?;
        Ok(frames
            .into_iter()
            .filter_map(|f| {
                let data = f.lines().find_map(|l| l.strip_prefix("data: "))?;
                let inner: Value = serde_json::from_str(data).ok()?;
                Some(dialect_gemini::frame(&json!({"response": inner})))
            })
            .collect())
    }
}

fn parse_gemini_shaped_response(inner: &Value) -> Result<CanonicalResponse, ProxyError> {
    let candidate = inner
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| ProxyError::InvalidRequest("antigravity: missing candidates[0]".into()))?;

    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let content = dialect_gemini::parse_parts(&parts);

    let thinking: Vec<_> = content
        .iter()
        .filter_map(|p| match p {
            proxy_core::model::Part::Thinking { text, signature, .. } => {
                Some(proxy_core::model::ThinkingBlock {
                    text: text.clone(),
                    signature: signature.clone(),
                    redacted: None,
                })
            }
            _ => None,
        })
        .collect();

    let has_tool_call = content
        .iter()
        .any(|p| matches!(p, proxy_core::model::Part::ToolCall { .. }));
    let mut stop_reason = dialect_gemini::finish_reason_to_stop(candidate.get("finishReason").and_then(Value::as_str));
    if has_tool_call && stop_reason == proxy_core::model::StopReason::EndTurn {
        stop_reason = proxy_core::model::StopReason::ToolUse;
    }

    let usage = inner.get("usageMetadata").map(|u| Usage {
        input_tokens: u.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
        output_tokens: u.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
        total_tokens: u.get("totalTokenCount").and_then(Value::as_u64).map(|n| n as u32),
        cached_tokens: None,
        thinking_tokens: u.get("thoughtsTokenCount").and_then(Value::as_u64).map(|n| n as u32),
    });

    Ok(CanonicalResponse {
        id: String::new(),
        content,
        stop_reason,
        usage,
        model: inner.get("modelVersion").and_then(Value::as_str).map(str::to_string),
        thinking: if thinking.is_empty() { None } else { Some(thinking) },
    })
}

fn parse_gemini_shaped_stream_chunk(
    inner: &Value,
    ctx: &mut StreamParseContext,
) -> Result<Vec<StreamChunk>, ProxyError> {
    use proxy_core::model::{BlockType, Part, StreamChunkType, ToolArguments};

    let Some(candidate) = inner.get("candidates").and_then(Value::as_array).and_then(|c| c.first()) else {
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
                delta: Some(Part::ToolCall { id: name.clone(), name, arguments }),
                block_type: Some(BlockType::ToolUse),
                block_index: Some(index),
                ..Default::default()
            });
        }
    }

    if let Some(finish_reason) = candidate.get("finishReason").and_then(Value::as_str) {
        out.push(StreamChunk {
            chunk_type: StreamChunkType::Done,
            stop_reason: Some(dialect_gemini::finish_reason_to_stop(Some(finish_reason))),
            ..Default::default()
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_core::model::{Part, StopReason};

    fn wrapped_request() -> Value {
        json!({
            "project": "proj-1",
            "model": "gemini-claude-sonnet",
            "userAgent": "test",
            "requestId": "r1",
            "payload": {
                "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            },
        })
    }

    #[test]
    fn detects_by_payload_contents() {
        assert!(AntigravityTransformer.is_supported_request(&wrapped_request()));
    }

    #[test]
    fn parse_request_reads_wrapped_contents() {
        let req = AntigravityTransformer.parse_request(&wrapped_request()).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert!(matches!(&req.messages[0].content[0], Part::Text { text } if text == "hi"));
    }

    #[test]
    fn emit_request_uses_snake_case_thinking_for_claude_models() {
        let request = CanonicalRequest {
            messages: vec![Message::text(Role::User, "hi")],
            thinking: Some(ThinkingConfig {
                enabled: true,
                budget: Some(1024),
                include_thoughts: Some(true),
            }),
            ..Default::default()
        };
        let body = AntigravityTransformer.emit_request(&request, "claude-3-opus").unwrap();
        let tc = &body["payload"]["thinkingConfig"];
        assert!(tc.get("include_thoughts").is_some());
        assert!(tc.get("thinking_budget").is_some());
        assert!(tc.get("includeThoughts").is_none());
    }

    #[test]
    fn emit_request_uses_camel_case_thinking_for_non_claude_models() {
        let request = CanonicalRequest {
            messages: vec![Message::text(Role::User, "hi")],
            thinking: Some(ThinkingConfig {
                enabled: true,
                budget: Some(1024),
                include_thoughts: Some(true),
            }),
            ..Default::default()
        };
        let body = AntigravityTransformer.emit_request(&request, "gemini-pro").unwrap();
        let tc = &body["payload"]["thinkingConfig"];
        assert!(tc.get("includeThoughts").is_some());
        assert!(tc.get("thinking_budget").is_none());
    }

    #[test]
    fn parse_response_unwraps_response_envelope_and_maps_id() {
        let body = json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "hello"}]},
                    "finishReason": "STOP",
                    "index": 0,
                }],
            },
            "responseId": "resp-1",
        });
        let response = AntigravityTransformer.parse_response(&body).unwrap();
        assert_eq!(response.id, "resp-1");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn emit_response_wraps_under_response_key() {
        let response = CanonicalResponse {
            id: "r1".to_string(),
            content: vec![Part::Text { text: "hi".into() }],
            stop_reason: StopReason::EndTurn,
            usage: None,
            model: None,
            thinking: None,
        };
        let body = AntigravityTransformer.emit_response(&response).unwrap();
        assert!(body.get("response").is_some());
        assert_eq!(body["responseId"], json!("r1"));
    }
}
