//! Canonical chat model shared by every format parser and emitter.
//!
//! All supported wire formats (OpenAI Chat Completions, OpenAI Responses,
//! Claude Messages, Gemini/Vertex, Ollama, Cline) are parsed into these types
//! and serialized back out of them. Nothing here touches the network.

pub mod event;
pub mod ir;
pub mod toolid;

pub use event::{FinishReason, UnifiedEvent};
pub use ir::{
    ContentPart, ImageSource, Message, Role, Sampling, ThinkingConfig, ThinkingEffort, ToolCall,
    ToolChoice, ToolSpec, UnifiedRequest, Usage,
};
pub use toolid::{normalize_tool_id, to_wire_tool_id, ToolIdAllocator, ToolIdStyle};
