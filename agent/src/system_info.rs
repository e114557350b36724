//! Field partitioning per entity group
//!
//! Each watched field belongs to exactly one entity group. Groups without
//! any requested field are not loaded and are skipped by the producer.

use crate::config::AgentConfig;
use std::collections::BTreeMap;
use std::fmt;
use vigil_shared::{FieldId, MetricDefinition};

/// Class of entity a field is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityGroup {
    Gpu,
    NvSwitch,
    NvLink,
    Cpu,
    CpuCore,
}

impl EntityGroup {
    /// Groups considered at startup, in load order
    pub const MONITORED: [EntityGroup; 5] = [
        EntityGroup::Gpu,
        EntityGroup::NvSwitch,
        EntityGroup::NvLink,
        EntityGroup::Cpu,
        EntityGroup::CpuCore,
    ];

    /// Entity group owning a backend field
    pub fn of_field(id: FieldId) -> EntityGroup {
        match id {
            856..=869 => EntityGroup::NvSwitch,
            870..=879 => EntityGroup::NvLink,
            1100..=1129 => EntityGroup::Cpu,
            1130..=1149 => EntityGroup::CpuCore,
            _ => EntityGroup::Gpu,
        }
    }
}

/// GPU profiling (DCP) fields, only readable on GPUs with profiling support
pub fn is_profiling_field(id: FieldId) -> bool {
    (1001..=1099).contains(&id)
}

impl fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityGroup::Gpu => "GPU",
            EntityGroup::NvSwitch => "NvSwitch",
            EntityGroup::NvLink => "NvLink",
            EntityGroup::Cpu => "CPU",
            EntityGroup::CpuCore => "CPU Core",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no fields to watch for device type: {0}")]
pub struct NoFieldsError(pub EntityGroup);

/// Watched fields per entity group for one generation
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    requested: BTreeMap<EntityGroup, Vec<MetricDefinition>>,
    loaded: BTreeMap<EntityGroup, Vec<MetricDefinition>>,
}

impl SystemInfo {
    /// Partition `primary` into entity groups. Nothing is loaded yet.
    pub fn build(primary: &[MetricDefinition], _config: &AgentConfig) -> Self {
        let mut requested: BTreeMap<EntityGroup, Vec<MetricDefinition>> = BTreeMap::new();
        for counter in primary {
            requested
                .entry(EntityGroup::of_field(counter.id))
                .or_default()
                .push(counter.clone());
        }
        Self {
            requested,
            loaded: BTreeMap::new(),
        }
    }

    /// Enable collection for `group`. Fails when no field was requested for it.
    pub fn load(&mut self, group: EntityGroup) -> Result<(), NoFieldsError> {
        match self.requested.get(&group) {
            Some(fields) if !fields.is_empty() => {
                self.loaded.insert(group, fields.clone());
                Ok(())
            }
            _ => Err(NoFieldsError(group)),
        }
    }

    pub fn is_loaded(&self, group: EntityGroup) -> bool {
        self.loaded.contains_key(&group)
    }

    /// Fields watched for a loaded group
    pub fn fields(&self, group: EntityGroup) -> Option<&[MetricDefinition]> {
        self.loaded.get(&group).map(Vec::as_slice)
    }

    /// Loaded GPU fields that need profiling support
    pub fn profiling_fields(&self) -> Vec<MetricDefinition> {
        self.fields(EntityGroup::Gpu)
            .unwrap_or_default()
            .iter()
            .filter(|f| is_profiling_field(f.id))
            .cloned()
            .collect()
    }

    /// Stop watching profiling fields. The GPU group is unloaded if nothing is left.
    pub fn drop_profiling(&mut self) -> usize {
        let Some(fields) = self.loaded.get_mut(&EntityGroup::Gpu) else {
            return 0;
        };
        let before = fields.len();
        fields.retain(|f| !is_profiling_field(f.id));
        let dropped = before - fields.len();
        if fields.is_empty() {
            self.loaded.remove(&EntityGroup::Gpu);
        }
        dropped
    }

    /// Loaded groups with their fields, in group order
    pub fn loaded(&self) -> impl Iterator<Item = (EntityGroup, &[MetricDefinition])> {
        self.loaded.iter().map(|(g, f)| (*g, f.as_slice()))
    }
}
