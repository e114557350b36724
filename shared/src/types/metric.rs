//! Metric definitions and observed samples
//!
//! A [`MetricDefinition`] is the static identity of one measurable quantity.
//! A [`Sample`] is one observed value of a definition for one entity (GPU,
//! NVSwitch, NVLink, ...) during one collection cycle.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Backend field identifier
pub type FieldId = u16;

/// How a metric is exposed in the text exposition format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    Counter,
    /// Not a time series of its own: becomes a label on every sample of the entity
    Label,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
            MetricKind::Label => "label",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a metric kind string is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric kind {0:?} (expected gauge, counter or label)")]
pub struct ParseKindError(pub String);

impl FromStr for MetricKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            "label" => Ok(MetricKind::Label),
            other => Err(ParseKindError(other.to_string())),
        }
    }
}

/// Immutable identity of one metric. Uniqueness key is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricDefinition {
    pub id: FieldId,
    pub name: Cow<'static, str>,
    pub kind: MetricKind,
    pub help: Cow<'static, str>,
}

impl MetricDefinition {
    /// Definition backed by static strings, usable in `static` catalogs
    pub const fn builtin(
        id: FieldId,
        name: &'static str,
        kind: MetricKind,
        help: &'static str,
    ) -> Self {
        Self {
            id,
            name: Cow::Borrowed(name),
            kind,
            help: Cow::Borrowed(help),
        }
    }

    pub fn new(id: FieldId, name: impl Into<String>, kind: MetricKind, help: impl Into<String>) -> Self {
        Self {
            id,
            name: Cow::Owned(name.into()),
            kind,
            help: Cow::Owned(help.into()),
        }
    }

    pub fn is_label(&self) -> bool {
        self.kind == MetricKind::Label
    }
}

/// Resolved, deduplicated pair of definition lists for one pipeline generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSet {
    /// Backend fields collected every cycle
    pub primary: Vec<MetricDefinition>,

    /// Synthesized metrics, including label-kind entries copied from `primary`
    pub exporter: Vec<MetricDefinition>,
}

impl CounterSet {
    pub fn contains_primary(&self, id: FieldId) -> bool {
        self.primary.iter().any(|c| c.id == id)
    }

    pub fn contains_exporter(&self, id: FieldId) -> bool {
        self.exporter.iter().any(|c| c.id == id)
    }
}

/// Observed value of a sample
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Integer(v) => write!(f, "{}", v),
            SampleValue::Float(v) => write!(f, "{}", v),
            SampleValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for SampleValue {
    fn from(v: i64) -> Self {
        SampleValue::Integer(v)
    }
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        SampleValue::Float(v)
    }
}

impl From<&str> for SampleValue {
    fn from(v: &str) -> Self {
        SampleValue::Text(v.to_string())
    }
}

/// One observed value for one metric at one entity
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Entity index (e.g. GPU ordinal)
    pub gpu: String,
    pub gpu_uuid: String,
    pub pci_bus_id: String,
    /// Device path name, e.g. `nvidia0`
    pub device: String,
    pub model_name: String,

    /// MIG profile, only rendered when non-empty
    pub mig_profile: String,
    pub gpu_instance_id: String,

    /// Only rendered when non-empty
    pub hostname: String,

    pub value: SampleValue,

    /// Free-form labels, rendered in this order
    pub labels: Vec<(String, String)>,
}

impl Sample {
    /// Sample for entity `gpu` with every identifying label left empty
    pub fn new(gpu: impl Into<String>, value: impl Into<SampleValue>) -> Self {
        Self {
            gpu: gpu.into(),
            gpu_uuid: String::new(),
            pci_bus_id: String::new(),
            device: String::new(),
            model_name: String::new(),
            mig_profile: String::new(),
            gpu_instance_id: String::new(),
            hostname: String::new(),
            value: value.into(),
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }
}

/// Ordered mapping of metric definition to its samples for one cycle.
///
/// Iteration order is insertion order; it drives the rendered output order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsByCounter {
    entries: Vec<(MetricDefinition, Vec<Sample>)>,
}

impl MetricsByCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append samples for `counter`, merging into an existing entry with the same id
    pub fn extend(&mut self, counter: &MetricDefinition, samples: impl IntoIterator<Item = Sample>) {
        match self.entries.iter_mut().find(|(c, _)| c.id == counter.id) {
            Some((_, existing)) => existing.extend(samples),
            None => self
                .entries
                .push((counter.clone(), samples.into_iter().collect())),
        }
    }

    pub fn push(&mut self, counter: &MetricDefinition, sample: Sample) {
        self.extend(counter, std::iter::once(sample));
    }

    /// Merge `other` into `self`, keeping `self`'s order first
    pub fn merge(&mut self, other: MetricsByCounter) {
        for (counter, samples) in other.entries {
            self.extend(&counter, samples);
        }
    }

    pub fn get(&self, id: FieldId) -> Option<&[Sample]> {
        self.entries
            .iter()
            .find(|(c, _)| c.id == id)
            .map(|(_, s)| s.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricDefinition, &[Sample])> {
        self.entries.iter().map(|(c, s)| (c, s.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("gauge".parse::<MetricKind>().unwrap(), MetricKind::Gauge);
        assert_eq!(" Counter ".parse::<MetricKind>().unwrap(), MetricKind::Counter);
        assert_eq!("label".parse::<MetricKind>().unwrap(), MetricKind::Label);
        assert!("histogram".parse::<MetricKind>().is_err());
    }

    #[test]
    fn test_metrics_by_counter_merges_same_id() {
        let sm = MetricDefinition::new(100, "DCGM_FI_DEV_SM_CLOCK", MetricKind::Gauge, "SM clock");
        let mem = MetricDefinition::new(101, "DCGM_FI_DEV_MEM_CLOCK", MetricKind::Gauge, "Mem clock");

        let mut metrics = MetricsByCounter::new();
        metrics.push(&sm, Sample::new("0", 1410i64));
        metrics.push(&mem, Sample::new("0", 1215i64));
        metrics.push(&sm, Sample::new("1", 1395i64));

        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics.get(100).unwrap().len(), 2);
        let order: Vec<u16> = metrics.iter().map(|(c, _)| c.id).collect();
        assert_eq!(order, vec![100, 101]);
    }

    #[test]
    fn test_sample_value_display() {
        assert_eq!(SampleValue::Integer(42).to_string(), "42");
        assert_eq!(SampleValue::Float(61.25).to_string(), "61.25");
        assert_eq!(SampleValue::from("535.129.03").to_string(), "535.129.03");
    }
}
