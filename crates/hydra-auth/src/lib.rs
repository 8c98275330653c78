//! Credential pool and token lifecycle.
//!
//! Credentials are registered at runtime and read on every request; token
//! refresh happens just-in-time behind a per-credential single-flight so
//! concurrent requests never race the upstream token endpoint.

pub mod auth;
pub mod refresh;
pub mod store;

pub use auth::{Auth, meta};
pub use refresh::{CopilotRefresher, QwenRefresher, TokenManager, TokenRefresher, TokenUpdate};
pub use store::AuthStore;
