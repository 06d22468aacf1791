//! The per-dialect transformer capability set (§9) and its process-global
//! registry. Each dialect crate under `crates/dialects/*` implements
//! [`Transformer`] for one dialect; the gateway binary populates the
//! registry once at startup (§9: "immutable after init, no plug-in
//! loading from disk").

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ProxyError;
use crate::model::{BlockType, CanonicalRequest, CanonicalResponse, StreamChunk};
use crate::stream::ParserType;

/// Per-stream mutable context a transformer may need across calls to
/// `parse_stream_chunk` within one upstream response (e.g. to remember
/// whether `message_start` has already been synthesized). Owned
/// exclusively by the handler processing that one stream.
#[derive(Debug, Default)]
pub struct StreamParseContext {
    pub message_start_sent: bool,
    /// Accumulates partial-JSON tool-call arguments by block index, so a
    /// transformer can hand back a parsed value once closed.
    pub tool_json_buffers: HashMap<u32, String>,
    /// Remembers which block type an explicit `content_block_start` opened
    /// at a given upstream index, so a later `content_block_stop` for that
    /// index can be tagged with the same `block_type` and get correctly
    /// reindexed by the stream processor's bookkeeping.
    pub block_types: HashMap<u32, BlockType>,
}

#[derive(Debug, Default)]
pub struct StreamEmitContext {
    pub last_stop_reason_was_tool_use: bool,
    /// Block indices for which this stream has already emitted a
    /// `content_block_start`-equivalent frame. Lets an emitter distinguish
    /// "first appearance of this block" (start framing) from "continuation"
    /// (delta framing) without re-deriving it from delta content alone.
    pub started_blocks: std::collections::HashSet<u32>,
    /// Lazily-generated identifier for the whole response, used by
    /// emitters whose wire format names the stream itself (e.g. the
    /// Responses-API adapter's `response.created` event).
    pub stream_id: Option<String>,
}

pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Used by format-detection (§6) when delegating to a priority-ordered
    /// list of transformers instead of (or alongside) the explicit rules.
    fn is_supported_request(&self, body: &Value) -> bool;

    /// Which SSE framing this dialect's streams use.
    fn parser_type(&self) -> ParserType;

    fn parse_request(&self, body: &Value) -> Result<CanonicalRequest, ProxyError>;

    /// `model` supplies the D-mandated envelope field (e.g. Anthropic's
    /// top-level `model`) the canonical request doesn't itself carry.
    fn emit_request(&self, request: &CanonicalRequest, model: &str) -> Result<Value, ProxyError>;

    fn parse_response(&self, body: &Value) -> Result<CanonicalResponse, ProxyError>;

    fn emit_response(&self, response: &CanonicalResponse) -> Result<Value, ProxyError>;

    /// One raw SSE event string in, zero or more canonical chunks out.
    fn parse_stream_chunk(
        &self,
        raw_event: &str,
        ctx: &mut StreamParseContext,
    ) -> Result<Vec<StreamChunk>, ProxyError>;

    /// One canonical chunk in, zero or more framed SSE event strings out
    /// (already including the dialect's `event:`/`data:` framing).
    fn emit_stream_chunk(
        &self,
        chunk: &StreamChunk,
        ctx: &mut StreamEmitContext,
    ) -> Result<Vec<String>, ProxyError>;
}

/// Process-global map `name -> Transformer`, immutable after
/// construction.
pub struct TransformerRegistry {
    transformers: HashMap<&'static str, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transformers.keys().copied().collect()
    }
}

#[derive(Default)]
pub struct TransformerRegistryBuilder {
    transformers: HashMap<&'static str, Arc<dyn Transformer>>,
}

impl TransformerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.insert(transformer.name(), transformer);
        self
    }

    pub fn build(self) -> TransformerRegistry {
        TransformerRegistry {
            transformers: self.transformers,
        }
    }
}
