//! Standalone hostengine backend
//!
//! The agent never embeds the engine: it expects an already running
//! `nv-hostengine` so users can keep their own exporters alongside. Field
//! values are read with the vendor CLI (`dcgmi dmon`) against that engine.

use crate::error::AgentError;
use crate::reader::{EntityReading, FieldReader, Session};
use crate::system_info::EntityGroup;
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};
use vigil_shared::{MetricDefinition, SampleValue};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to the remote hostengine at `addr`. Not retried.
pub async fn connect(addr: &str, dcgmi: &Path) -> Result<Session, AgentError> {
    info!("Attempting to connect to remote hostengine at {}", addr);

    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(AgentError::Connect {
                addr: addr.to_string(),
                source: e,
            })
        }
        Err(_) => {
            return Err(AgentError::Connect {
                addr: addr.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no answer within {:?}", CONNECT_TIMEOUT),
                ),
            })
        }
    };

    let reader = Arc::new(DcgmiReader::new(dcgmi, addr));
    info!("Hostengine connection established");
    Ok(Session::with_connection(reader, stream))
}

/// Reads GPU field values through `dcgmi dmon`
#[derive(Debug, Clone)]
pub struct DcgmiReader {
    binary: PathBuf,
    host: String,
}

impl DcgmiReader {
    pub fn new(binary: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            host: host.into(),
        }
    }
}

#[async_trait]
impl FieldReader for DcgmiReader {
    async fn read(
        &self,
        group: EntityGroup,
        fields: &[MetricDefinition],
    ) -> anyhow::Result<Vec<EntityReading>> {
        if group != EntityGroup::Gpu {
            bail!("entity group {} is not supported by dcgmi dmon", group);
        }
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let ids = fields
            .iter()
            .map(|f| f.id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let output = Command::new(&self.binary)
            .args(["dmon", "--host", self.host.as_str(), "-e", ids.as_str(), "-c", "1"])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            bail!(
                "dcgmi dmon exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let readings = parse_dmon(&String::from_utf8_lossy(&output.stdout), fields)?;
        debug!("Read {} fields from {} GPUs", fields.len(), readings.len());
        Ok(readings)
    }
}

/// Parse the table printed by `dcgmi dmon -c 1`:
///
/// ```text
/// #Entity   SMCLK  MMCLK
/// ID
/// GPU 0     1410   1215
/// ```
///
/// Value columns follow the order of `fields`.
pub fn parse_dmon(output: &str, fields: &[MetricDefinition]) -> anyhow::Result<Vec<EntityReading>> {
    let mut readings = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("ID") {
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens[0] != "GPU" {
            continue;
        }
        let entity_id: u32 = tokens
            .get(1)
            .context("missing entity id")?
            .parse()
            .with_context(|| format!("invalid entity id in {:?}", line))?;

        let columns = &tokens[2..];
        if columns.len() != fields.len() {
            bail!(
                "expected {} value columns for GPU {}, got {}",
                fields.len(),
                entity_id,
                columns.len()
            );
        }

        let values = fields
            .iter()
            .zip(columns)
            .filter(|(_, raw)| **raw != "N/A")
            .map(|(field, raw)| (field.id, parse_value(raw)))
            .collect();

        readings.push(EntityReading { entity_id, values });
    }

    Ok(readings)
}

fn parse_value(raw: &str) -> SampleValue {
    if let Ok(v) = raw.parse::<i64>() {
        SampleValue::Integer(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        SampleValue::Float(v)
    } else {
        SampleValue::Text(raw.to_string())
    }
}
