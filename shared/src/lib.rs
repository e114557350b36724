//! Shared types and utilities for Vigil
//!
//! Metric definitions, samples, counter sets and the text exposition
//! renderer used by the agent's pipeline and its local exposition server.

pub mod render;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use render::{render, RenderError};
pub use types::metric::*;
