//! Vigil agent library
//!
//! Resolves the watched counters, runs the collection pipeline against a
//! standalone hostengine, exposes snapshots locally and forwards them to a
//! remote endpoint. [`pipeline::Agent`] is the entry point.

pub mod catalog;
pub mod config;
pub mod counters;
pub mod derived;
pub mod error;
pub mod forward;
pub mod hostengine;
pub mod metrics;
pub mod pipeline;
pub mod producer;
pub mod reader;
pub mod registry;
pub mod server;
pub mod signals;
pub mod system_info;

pub use config::{AgentConfig, FileConfig, ForwardConfig};
pub use error::{AgentError, ForwardError};
pub use pipeline::{Agent, Collaborators, DcgmCollaborators, Lifecycle, SNAPSHOT_BUFFER};
pub use signals::{ControlSignal, SignalSource};
