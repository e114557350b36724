//! Field reads from the telemetry backend

use crate::system_info::EntityGroup;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use vigil_shared::{FieldId, MetricDefinition, SampleValue};

/// Latest values of the requested fields for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityReading {
    /// Entity index within its group (GPU ordinal, switch index, ...)
    pub entity_id: u32,

    /// Fields without a value (blank/N/A) are absent
    pub values: Vec<(FieldId, SampleValue)>,
}

impl EntityReading {
    pub fn value(&self, id: FieldId) -> Option<&SampleValue> {
        self.values.iter().find(|(f, _)| *f == id).map(|(_, v)| v)
    }
}

/// Reads the latest field values of every entity in a group
#[async_trait]
pub trait FieldReader: Send + Sync {
    async fn read(
        &self,
        group: EntityGroup,
        fields: &[MetricDefinition],
    ) -> anyhow::Result<Vec<EntityReading>>;
}

/// One generation's connection to the telemetry backend.
///
/// Dropping the session releases the connection.
pub struct Session {
    reader: Arc<dyn FieldReader>,
    _connection: Option<TcpStream>,
}

impl Session {
    pub fn new(reader: Arc<dyn FieldReader>) -> Self {
        Self {
            reader,
            _connection: None,
        }
    }

    /// Session keeping `connection` open until dropped
    pub fn with_connection(reader: Arc<dyn FieldReader>, connection: TcpStream) -> Self {
        Self {
            reader,
            _connection: Some(connection),
        }
    }

    pub fn reader(&self) -> Arc<dyn FieldReader> {
        self.reader.clone()
    }
}
