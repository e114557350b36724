//! Error types for the agent
//!
//! Startup errors (`Config`, `Connect`, `Registration`, `Io`) abort the
//! generation and surface to the caller. Per-cycle errors (`Aggregation`,
//! `Render`, `Forward`) are logged by the pipeline and never abort it.

use std::time::Duration;
use thiserror::Error;
use vigil_shared::RenderError;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed user catalog or invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Telemetry backend unreachable
    #[error("failed to connect to remote hostengine at {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A derived-metric collector is enabled but cannot be constructed
    #[error("{collector} collector cannot be initialized: {reason}")]
    Registration { collector: String, reason: String },

    /// The registry failed to gather from one of its collectors
    #[error("failed to gather metrics from the {collector} collector")]
    Aggregation {
        collector: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    /// Producer or exposition server did not stop within the bound
    #[error("pipeline tasks did not terminate within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn config(msg: impl Into<String>) -> Self {
        AgentError::Config(msg.into())
    }
}

/// Failure to push one snapshot to the remote endpoint
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to construct POST request to proxy: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("failed to forward metrics to proxy: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("failed to forward metrics to proxy. Got status: {code}({status:?})")]
    Status { code: u16, status: String },
}
