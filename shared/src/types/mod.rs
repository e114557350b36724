//! Data model shared across the agent

pub mod metric;
