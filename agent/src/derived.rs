//! Windowed derived collectors
//!
//! `DCGM_EXP_XID_ERRORS_COUNT` and `DCGM_EXP_CLOCK_EVENTS_COUNT` count
//! events observed on one backend field over a sliding time window.

use crate::catalog::{CLOCK_EVENTS_COUNT, CLOCK_THROTTLE_REASONS, XID_ERRORS, XID_ERRORS_COUNT};
use crate::reader::FieldReader;
use crate::registry::DerivedCollector;
use crate::system_info::EntityGroup;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use vigil_shared::{MetricDefinition, MetricKind, MetricsByCounter, Sample, SampleValue};

/// Derived collectors the orchestrator may register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedKind {
    XidErrors,
    ClockEvents,
}

impl DerivedKind {
    pub const ALL: [DerivedKind; 2] = [DerivedKind::XidErrors, DerivedKind::ClockEvents];

    /// Exporter metric this collector produces
    pub fn metric_id(&self) -> u16 {
        match self {
            DerivedKind::XidErrors => XID_ERRORS_COUNT,
            DerivedKind::ClockEvents => CLOCK_EVENTS_COUNT,
        }
    }

    /// Backend field the events are read from
    pub fn source_field(&self) -> MetricDefinition {
        match self {
            DerivedKind::XidErrors => MetricDefinition::builtin(
                XID_ERRORS,
                "DCGM_FI_DEV_XID_ERRORS",
                MetricKind::Gauge,
                "Value of the last XID error encountered.",
            ),
            DerivedKind::ClockEvents => MetricDefinition::builtin(
                CLOCK_THROTTLE_REASONS,
                "DCGM_FI_DEV_CLOCK_THROTTLE_REASONS",
                MetricKind::Gauge,
                "Current clock throttle reasons.",
            ),
        }
    }

    /// Whether the resolved exporter metrics ask for this collector
    pub fn is_enabled(&self, exporter: &[MetricDefinition]) -> bool {
        exporter.iter().any(|c| c.id == self.metric_id())
    }

    fn label(&self) -> &'static str {
        match self {
            DerivedKind::XidErrors => "xid",
            DerivedKind::ClockEvents => "clock_event",
        }
    }
}

impl std::fmt::Display for DerivedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DerivedKind::XidErrors => f.write_str("DCGM_EXP_XID_ERRORS_COUNT"),
            DerivedKind::ClockEvents => f.write_str("DCGM_EXP_CLOCK_EVENTS_COUNT"),
        }
    }
}

/// Clock event reasons by bit of the throttle reasons field
pub const CLOCK_EVENT_REASONS: [(i64, &str); 9] = [
    (0x1, "gpu_idle"),
    (0x2, "clocks_setting"),
    (0x4, "sw_power_cap"),
    (0x8, "hw_slowdown"),
    (0x10, "sync_boost"),
    (0x20, "sw_thermal"),
    (0x40, "hw_thermal"),
    (0x80, "hw_power_brake"),
    (0x100, "display_clock"),
];

/// Events per (entity, key) over a sliding window
#[derive(Debug)]
pub struct WindowedCounter {
    window: Duration,
    events: VecDeque<(Instant, u32, String)>,
}

impl WindowedCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    /// Events must be recorded in time order
    pub fn record(&mut self, at: Instant, entity: u32, key: impl Into<String>) {
        self.events.push_back((at, entity, key.into()));
    }

    /// Event counts within the window ending at `now`. Older events are discarded.
    pub fn counts(&mut self, now: Instant) -> BTreeMap<(u32, String), u64> {
        while let Some((at, _, _)) = self.events.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }

        let mut counts = BTreeMap::new();
        for (_, entity, key) in &self.events {
            *counts.entry((*entity, key.clone())).or_insert(0) += 1;
        }
        counts
    }
}

struct WindowState {
    counter: WindowedCounter,
    last_value: HashMap<u32, i64>,
}

/// Counts XID errors or clock events read from the backend
pub struct WindowedCollector {
    kind: DerivedKind,
    metric: MetricDefinition,
    source: MetricDefinition,
    reader: Arc<dyn FieldReader>,
    hostname: String,
    state: Mutex<WindowState>,
}

impl WindowedCollector {
    /// `metric` is the exporter definition being produced, `window` the count window.
    pub fn new(
        kind: DerivedKind,
        metric: MetricDefinition,
        reader: Arc<dyn FieldReader>,
        hostname: impl Into<String>,
        window: Duration,
    ) -> Self {
        Self {
            kind,
            metric,
            source: kind.source_field(),
            reader,
            hostname: hostname.into(),
            state: Mutex::new(WindowState {
                counter: WindowedCounter::new(window),
                last_value: HashMap::new(),
            }),
        }
    }

    fn observe(&self, state: &mut WindowState, now: Instant, entity: u32, value: &SampleValue) {
        let SampleValue::Integer(value) = *value else {
            return;
        };
        let previous = state.last_value.insert(entity, value);
        match self.kind {
            // the field holds the last XID seen, count each change
            DerivedKind::XidErrors => {
                if value != 0 && previous != Some(value) {
                    state.counter.record(now, entity, value.to_string());
                }
            }
            // count reasons on their rising edge
            DerivedKind::ClockEvents => {
                let raised = value & !previous.unwrap_or(0);
                for (bit, reason) in CLOCK_EVENT_REASONS {
                    if raised & bit != 0 {
                        state.counter.record(now, entity, reason);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DerivedCollector for WindowedCollector {
    fn name(&self) -> &str {
        &self.metric.name
    }

    async fn collect(&self) -> anyhow::Result<MetricsByCounter> {
        let readings = self
            .reader
            .read(EntityGroup::Gpu, std::slice::from_ref(&self.source))
            .await?;

        let now = Instant::now();
        let counts = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            for reading in &readings {
                if let Some(value) = reading.value(self.source.id) {
                    self.observe(&mut state, now, reading.entity_id, value);
                }
            }
            state.counter.counts(now)
        };

        let mut metrics = MetricsByCounter::new();
        for ((entity, key), count) in counts {
            let mut sample = Sample::new(entity.to_string(), count as i64)
                .with_label(self.kind.label(), key);
            sample.device = format!("nvidia{}", entity);
            sample.hostname = self.hostname.clone();
            metrics.push(&self.metric, sample);
        }
        Ok(metrics)
    }
}
