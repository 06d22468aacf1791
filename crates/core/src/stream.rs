//! SSE stream-processing block-state machine (C8): re-frames an upstream
//! event stream into the client's dialect while preserving block ordering,
//! signatures, and tool-call semantics.

use std::sync::Arc;

use crate::error::ProxyError;
use crate::model::{BlockType, Part, StopReason, StreamChunk, StreamChunkType};
use crate::signature_cache::{entry_key, SignatureStore};
use crate::transformer::{StreamEmitContext, StreamParseContext, Transformer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserType {
    /// Events separated by `\n\n`.
    SseStandard,
    /// Each non-empty `data:` line is one event; no blank-line framing.
    SseLineDelimited,
}

/// Splits `buffer` into complete events per `parser_type`, leaving any
/// trailing partial event in `buffer`.
pub(crate) fn split_events(buffer: &mut String, parser_type: ParserType) -> Vec<String> {
    let mut events = Vec::new();
    match parser_type {
        ParserType::SseStandard => {
            while let Some(pos) = buffer.find("\n\n") {
                let event = buffer[..pos].to_string();
                *buffer = buffer[pos + 2..].to_string();
                if !event.trim().is_empty() {
                    events.push(event);
                }
            }
        }
        ParserType::SseLineDelimited => {
            let mut consumed = 0;
            for line in buffer.split_inclusive('\n') {
                if !line.ends_with('\n') {
                    break; // incomplete trailing line, keep in buffer
                }
                consumed += line.len();
                let trimmed = line.trim_end_matches('\n').trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(data) = trimmed.strip_prefix("data:") {
                    let data = data.trim();
                    if data == "[DONE]" {
                        continue;
                    }
                    events.push(format!("data: {data}"));
                }
            }
            *buffer = buffer[consumed..].to_string();
        }
    }
    events
}

pub struct SignatureContext {
    pub store: Arc<dyn SignatureStore>,
    pub session_id: String,
    pub model: String,
    pub family: String,
    pub context_text: String,
}

#[derive(Default)]
pub struct StreamProcessor {
    buffer: String,
    current_block_type: Option<BlockType>,
    /// The most recently opened block's type, kept set across an explicit
    /// `content_block_stop` (unlike `current_block_type`) so the tool_use
    /// stop-reason patch (invariant 11) still fires when the block was
    /// already explicitly closed before `message_delta`/`message_stop`.
    last_block_type: Option<BlockType>,
    current_block_index: i64,
    accumulated_text: String,
    accumulated_thinking: String,
    chunk_count: u64,
    total_bytes: u64,
    error_reported: bool,
    signature_ctx: Option<SignatureContext>,
}

impl StreamProcessor {
    pub fn new(signature_ctx: Option<SignatureContext>) -> Self {
        Self {
            signature_ctx,
            current_block_index: -1,
            ..Default::default()
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Processes one batch of upstream bytes, returning output events
    /// already framed for the client's dialect.
    pub async fn process_bytes(
        &mut self,
        data: &[u8],
        parsing: &dyn Transformer,
        source: &dyn Transformer,
        parse_ctx: &mut StreamParseContext,
        emit_ctx: &mut StreamEmitContext,
    ) -> Result<Vec<String>, ProxyError> {
        self.total_bytes += data.len() as u64;
        self.buffer.push_str(&String::from_utf8_lossy(data));
        let events = split_events(&mut self.buffer, parsing.parser_type());
        let mut out = Vec::new();
        for raw_event in events {
            self.process_event(&raw_event, parsing, source, parse_ctx, emit_ctx, &mut out)
                .await?;
        }
        Ok(out)
    }

    /// Drains any buffered partial event at end-of-body. If no chunk was
    /// ever observed and no error was reported, synthesizes a terminal
    /// error event per §4.7 Flush.
    pub async fn flush(
        &mut self,
        parsing: &dyn Transformer,
        source: &dyn Transformer,
        parse_ctx: &mut StreamParseContext,
        emit_ctx: &mut StreamEmitContext,
    ) -> Result<Vec<String>, ProxyError> {
        let mut out = Vec::new();
        if !self.buffer.trim().is_empty() {
            let leftover = std::mem::take(&mut self.buffer);
            self.process_event(&leftover, parsing, source, parse_ctx, emit_ctx, &mut out)
                .await?;
        }
        if self.chunk_count == 0 && !self.error_reported {
            let chunk = StreamChunk::error("Upstream model returned empty response (0 tokens)");
            out.extend(source.emit_stream_chunk(&chunk, emit_ctx)?);
        }
        Ok(out)
    }

    async fn process_event(
        &mut self,
        raw_event: &str,
        parsing: &dyn Transformer,
        source: &dyn Transformer,
        parse_ctx: &mut StreamParseContext,
        emit_ctx: &mut StreamEmitContext,
        out: &mut Vec<String>,
    ) -> Result<(), ProxyError> {
        if source.name() == "anthropic"
            && !parse_ctx.message_start_sent
            && is_contentful_event(raw_event)
        {
            out.push(synthetic_message_start());
            parse_ctx.message_start_sent = true;
        }

        let chunks = parsing.parse_stream_chunk(raw_event, parse_ctx)?;
        for mut chunk in chunks {
            if parsing.name() == "antigravity" {
                normalize_antigravity_bash_args(&mut chunk);
            }
            if chunk.chunk_type == StreamChunkType::Error {
                self.error_reported = true;
            } else {
                self.chunk_count += 1;
            }

            self.apply_block_bookkeeping(&mut chunk, source, emit_ctx, out)?;

            if let Some(sig_ctx) = &self.signature_ctx {
                if let Some(Part::Thinking {
                    signature: Some(sig),
                    ..
                }) = &chunk.delta
                {
                    let key = entry_key(&sig_ctx.model, &sig_ctx.context_text);
                    sig_ctx
                        .store
                        .store(&sig_ctx.session_id, &key, sig, &sig_ctx.family)
                        .await;
                }
            }

            match chunk.delta {
                Some(Part::Text { ref text }) => self.accumulated_text.push_str(text),
                Some(Part::Thinking { ref text, .. }) => self.accumulated_thinking.push_str(text),
                _ => {}
            }

            out.extend(source.emit_stream_chunk(&chunk, emit_ctx)?);
        }
        Ok(())
    }

    /// Detects implicit block starts/stops, bumps `currentBlockIndex`,
    /// patches stop-reason when a tool_use block is open, and stamps the
    /// chunk's `block_index` to the current value (invariants 3, 4, 11).
    fn apply_block_bookkeeping(
        &mut self,
        chunk: &mut StreamChunk,
        source: &dyn Transformer,
        emit_ctx: &mut StreamEmitContext,
        out: &mut Vec<String>,
    ) -> Result<(), ProxyError> {
        if chunk.chunk_type == StreamChunkType::Done {
            if self.last_block_type == Some(BlockType::ToolUse)
                && chunk.stop_reason == Some(StopReason::EndTurn)
            {
                chunk.stop_reason = Some(StopReason::ToolUse);
            }
            return Ok(());
        }

        if chunk.chunk_type == StreamChunkType::BlockStop {
            // An explicit stop already closes the current block; clearing
            // `current_block_type` here stops the next transition from
            // emitting a second, synthetic stop for the same index.
            // `last_block_type` is left alone so the Done patch above still
            // sees what was open.
            chunk.block_index = Some(self.current_block_index as u32);
            self.current_block_type = None;
            return Ok(());
        }

        let Some(block_type) = chunk.block_type else {
            return Ok(());
        };

        if self.current_block_type != Some(block_type) {
            // implicit block transition: close the previous block first.
            if self.current_block_type.is_some() {
                let stop = StreamChunk {
                    chunk_type: StreamChunkType::BlockStop,
                    block_index: Some(self.current_block_index as u32),
                    ..Default::default()
                };
                out.extend(source.emit_stream_chunk(&stop, emit_ctx)?);
            }
            self.current_block_index += 1;
            self.current_block_type = Some(block_type);
            self.last_block_type = Some(block_type);

            // implicit tool_use starts are forbidden: the transformer must
            // have already emitted an explicit start for those.
            if block_type != BlockType::ToolUse {
                let is_empty_text = matches!(
                    &chunk.delta,
                    Some(Part::Text { text }) if text.is_empty()
                );
                if !is_empty_text {
                    let start = StreamChunk {
                        chunk_type: chunk.chunk_type,
                        block_index: Some(self.current_block_index as u32),
                        block_type: Some(block_type),
                        delta: Some(empty_delta(block_type)),
                        ..Default::default()
                    };
                    out.extend(source.emit_stream_chunk(&start, emit_ctx)?);
                }
            }
        }

        chunk.block_index = Some(self.current_block_index as u32);
        Ok(())
    }
}

fn empty_delta(block_type: BlockType) -> Part {
    match block_type {
        BlockType::Text => Part::Text { text: String::new() },
        BlockType::Thinking => Part::Thinking {
            text: String::new(),
            signature: None,
            redacted: None,
        },
        BlockType::ToolUse => Part::Text { text: String::new() },
    }
}

/// When the parsing provider is Antigravity and a tool_call targets
/// `bash` but supplies `cmd`/`code` instead of `command`, copy the value
/// to `command` without removing the original field (§4.7, non-destructive
/// rewrite applied before `emitStreamChunk`).
fn normalize_antigravity_bash_args(chunk: &mut StreamChunk) {
    let Some(Part::ToolCall { name, arguments, .. }) = &mut chunk.delta else {
        return;
    };
    if !name.eq_ignore_ascii_case("bash") {
        return;
    }
    if let crate::model::ToolArguments::Value(serde_json::Value::Object(obj)) = arguments {
        if obj.contains_key("command") {
            return;
        }
        let alt = obj.get("cmd").or_else(|| obj.get("code")).cloned();
        if let Some(value) = alt {
            obj.insert("command".to_string(), value);
        }
    }
}

fn is_contentful_event(raw_event: &str) -> bool {
    !raw_event.contains("\"type\":\"ping\"") && !raw_event.contains("\"type\":\"error\"")
}

fn synthetic_message_start() -> String {
    let payload = serde_json::json!({
        "type": "message_start",
        "message": {
            "id": "",
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": "",
            "stop_reason": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }
    });
    format!("event: message_start\ndata: {payload}\n\n")
}

/// Block-type detection tokens from the GLOSSARY, usable when a raw event
/// must be classified without a full parse (fallback path; the primary
/// path classifies off the already-translated canonical chunk's
/// `block_type`).
pub fn detect_block_type_from_tokens(raw_event: &str) -> Option<BlockType> {
    if raw_event.contains("\"type\":\"thinking\"")
        || raw_event.contains("\"type\":\"thinking_delta\"")
        || raw_event.contains("\"type\":\"signature_delta\"")
    {
        Some(BlockType::Thinking)
    } else if raw_event.contains("\"type\":\"text\"") || raw_event.contains("\"type\":\"text_delta\"") {
        Some(BlockType::Text)
    } else if raw_event.contains("\"type\":\"tool_use\"") || raw_event.contains("\"type\":\"input_json_delta\"") {
        Some(BlockType::ToolUse)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_sse_standard_events() {
        let mut buf = "event: a\ndata: 1\n\nevent: b\ndata: 2\n\n".to_string();
        let events = split_events(&mut buf, ParserType::SseStandard);
        assert_eq!(events.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_sse_standard_keeps_partial_in_buffer() {
        let mut buf = "event: a\ndata: 1\n\nevent: b\ndata: 2".to_string();
        let events = split_events(&mut buf, ParserType::SseStandard);
        assert_eq!(events.len(), 1);
        assert_eq!(buf, "event: b\ndata: 2");
    }

    #[test]
    fn split_line_delimited_skips_done() {
        let mut buf = "data: {\"a\":1}\ndata: [DONE]\n".to_string();
        let events = split_events(&mut buf, ParserType::SseLineDelimited);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn detects_known_tokens() {
        assert_eq!(
            detect_block_type_from_tokens("{\"type\":\"thinking_delta\"}"),
            Some(BlockType::Thinking)
        );
        assert_eq!(
            detect_block_type_from_tokens("{\"type\":\"input_json_delta\"}"),
            Some(BlockType::ToolUse)
        );
    }
}
