//! Primary metric producer

use crate::config::AgentConfig;
use crate::reader::{EntityReading, FieldReader};
use crate::system_info::{EntityGroup, SystemInfo};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_shared::{render, CounterSet, MetricDefinition, MetricsByCounter, Sample};

/// Emits one rendered snapshot per collection interval until cancelled
#[async_trait]
pub trait MetricsProducer: Send {
    async fn run(self: Box<Self>, snapshots: mpsc::Sender<String>, cancel: CancellationToken);
}

/// Reads every loaded entity group through a [`FieldReader`]
pub struct WatchProducer {
    interval: Duration,
    counters: Arc<CounterSet>,
    hostname: String,
    reader: Arc<dyn FieldReader>,
    system_info: Arc<SystemInfo>,
}

impl WatchProducer {
    pub fn new(
        config: &AgentConfig,
        counters: Arc<CounterSet>,
        hostname: impl Into<String>,
        reader: Arc<dyn FieldReader>,
        system_info: Arc<SystemInfo>,
    ) -> Self {
        Self {
            interval: config.collect_interval,
            counters,
            hostname: hostname.into(),
            reader,
            system_info,
        }
    }

    /// Read all loaded groups once. Groups failing to read are skipped for this cycle.
    pub async fn collect(&self) -> MetricsByCounter {
        let mut metrics = MetricsByCounter::new();
        for (group, fields) in self.system_info.loaded() {
            match self.reader.read(group, fields).await {
                Ok(readings) => self.append(&mut metrics, group, fields, &readings),
                Err(e) => warn!("Failed to read {} metrics: {:#}", group, e),
            }
        }
        metrics
    }

    fn append(
        &self,
        metrics: &mut MetricsByCounter,
        group: EntityGroup,
        fields: &[MetricDefinition],
        readings: &[EntityReading],
    ) {
        for field in fields.iter().filter(|f| !f.is_label()) {
            for reading in readings {
                let Some(value) = reading.value(field.id) else {
                    continue;
                };
                let mut sample = Sample::new(reading.entity_id.to_string(), value.clone());
                if group == EntityGroup::Gpu {
                    sample.device = format!("nvidia{}", reading.entity_id);
                }
                sample.hostname = self.hostname.clone();
                sample.labels = self.labels(fields, reading);
                metrics.push(field, sample);
            }
        }
    }

    // label-kind fields of the entity, in counter order
    fn labels(&self, fields: &[MetricDefinition], reading: &EntityReading) -> Vec<(String, String)> {
        fields
            .iter()
            .filter(|f| f.is_label())
            .filter_map(|f| {
                reading
                    .value(f.id)
                    .map(|v| (f.name.to_string(), v.to_string()))
            })
            .collect()
    }

    async fn snapshot(&self) -> Option<String> {
        let metrics = self.collect().await;
        match render(&metrics) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to render metrics: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl MetricsProducer for WatchProducer {
    async fn run(self: Box<Self>, snapshots: mpsc::Sender<String>, cancel: CancellationToken) {
        info!(
            "Collecting {} counters every {:?}",
            self.counters.primary.len(),
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(snapshot) = self.snapshot().await else {
                continue;
            };

            // blocks while the buffer is full
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = snapshots.send(snapshot) => {
                    if sent.is_err() {
                        debug!("Snapshot receiver dropped");
                        break;
                    }
                }
            }
        }

        info!("Metrics producer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS};
    use crate::pipeline::SNAPSHOT_BUFFER;
    use std::sync::atomic::{AtomicI64, Ordering};
    use vigil_shared::{MetricKind, SampleValue};

    /// Two GPUs; every read bumps the SM clock value
    struct Counting {
        reads: AtomicI64,
    }

    #[async_trait]
    impl FieldReader for Counting {
        async fn read(
            &self,
            _group: EntityGroup,
            _fields: &[MetricDefinition],
        ) -> anyhow::Result<Vec<EntityReading>> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((0..2)
                .map(|gpu| EntityReading {
                    entity_id: gpu,
                    values: vec![
                        (1, SampleValue::from("535.129.03")),
                        (100, SampleValue::Integer(n)),
                    ],
                })
                .collect())
        }
    }

    fn counters() -> Arc<CounterSet> {
        Arc::new(CounterSet {
            primary: vec![
                MetricDefinition::new(1, "DCGM_FI_DRIVER_VERSION", MetricKind::Label, "driver"),
                MetricDefinition::new(100, "DCGM_FI_DEV_SM_CLOCK", MetricKind::Gauge, "sm"),
            ],
            exporter: DEFAULT_EXPORTER_COUNTERS.to_vec(),
        })
    }

    fn producer(interval: Duration, reader: Arc<Counting>) -> WatchProducer {
        let config = AgentConfig {
            collect_interval: interval,
            ..AgentConfig::default()
        };
        let counters = counters();
        let mut info = SystemInfo::build(&counters.primary, &config);
        info.load(EntityGroup::Gpu).unwrap();
        WatchProducer::new(&config, counters, "node-1", reader, Arc::new(info))
    }

    #[tokio::test]
    async fn test_labels_attached_to_samples() {
        let reader = Arc::new(Counting { reads: AtomicI64::new(0) });
        let metrics = producer(Duration::from_secs(1), reader).collect().await;

        assert_eq!(metrics.len(), 1);
        let samples = metrics.get(100).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].gpu, "1");
        assert_eq!(samples[1].device, "nvidia1");
        assert_eq!(samples[1].hostname, "node-1");
        assert_eq!(
            samples[1].labels,
            vec![("DCGM_FI_DRIVER_VERSION".to_string(), "535.129.03".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unloaded_groups_are_not_read() {
        let reader = Arc::new(Counting { reads: AtomicI64::new(0) });
        let config = AgentConfig::default();
        let info = SystemInfo::build(DEFAULT_COUNTERS, &config);
        let p = WatchProducer::new(&config, counters(), "", reader.clone(), Arc::new(info));

        assert!(p.collect().await.is_empty());
        assert_eq!(reader.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blocks_when_buffer_full() {
        let reader = Arc::new(Counting { reads: AtomicI64::new(0) });
        let p = Box::new(producer(Duration::from_millis(5), reader.clone()));
        let (tx, mut rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(p.run(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        // 10 buffered plus one waiting to be sent
        assert_eq!(reader.reads.load(Ordering::SeqCst), SNAPSHOT_BUFFER as i64 + 1);

        for n in 1..=SNAPSHOT_BUFFER {
            let snapshot = rx.recv().await.unwrap();
            assert!(snapshot.contains(&format!("}} {}\n", n)), "{}", snapshot);
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let reader = Arc::new(Counting { reads: AtomicI64::new(0) });
        let p = Box::new(producer(Duration::from_secs(60), reader));
        let (tx, mut rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(p.run(tx, cancel.clone()));

        // first tick is immediate
        assert!(rx.recv().await.is_some());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv().await.is_none());
    }
}
