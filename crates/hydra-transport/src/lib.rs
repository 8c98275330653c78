//! HTTP plumbing shared by every executor: one tuned connection pool, a
//! proxy-keyed client cache, and the idle-aware stream reader that guards
//! long-lived response bodies.

pub mod client;
pub mod reader;

pub use client::{shared_client, ClientCache};
pub use reader::{CloseReason, StreamReader};
