//! Format translation between the supported LLM wire dialects.
//!
//! Every request, response and stream chunk passes through the neutral model
//! in `hydra-protocol`: a `FormatParser` lifts wire bytes into it, a
//! `FormatEmitter` lowers it back out. `pipeline::StreamTranslator` drives the
//! two against a live byte stream, one chunk at a time.

pub mod context;
pub mod formats;
pub mod pipeline;
pub mod registry;
pub mod schema;
pub mod sse;

pub use context::StreamContext;
pub use pipeline::{translate_request, translate_response, StreamTranslator};
pub use registry::{emitter_for, parser_for, Format, FormatEmitter, FormatParser};
