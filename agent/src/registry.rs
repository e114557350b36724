//! Derived-metric registry
//!
//! Holds the collectors computing metrics the primary producer does not
//! emit. The orchestrator gathers it once per cycle and the exposition
//! server once per scrape.

use crate::error::AgentError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::debug;
use vigil_shared::MetricsByCounter;

/// A collector gathered on demand through the [`Registry`]
#[async_trait]
pub trait DerivedCollector: Send + Sync {
    fn name(&self) -> &str;

    async fn collect(&self) -> anyhow::Result<MetricsByCounter>;

    /// Release resources held by the collector
    fn cleanup(&self) {}
}

#[derive(Default)]
pub struct Registry {
    collectors: Mutex<Vec<Arc<dyn DerivedCollector>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, collector: Arc<dyn DerivedCollector>) {
        debug!("Registering {} collector", collector.name());
        self.collectors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(collector);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collect every registered collector in registration order.
    ///
    /// The first failing collector aborts the gather.
    pub async fn gather(&self) -> Result<MetricsByCounter, AgentError> {
        let mut gathered = MetricsByCounter::new();
        for collector in self.snapshot() {
            let metrics = collector
                .collect()
                .await
                .map_err(|source| AgentError::Aggregation {
                    collector: collector.name().to_string(),
                    source,
                })?;
            gathered.merge(metrics);
        }
        Ok(gathered)
    }

    pub fn cleanup(&self) {
        let collectors = std::mem::take(
            &mut *self.collectors.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for collector in collectors {
            collector.cleanup();
        }
    }

    // the lock is never held across an await
    fn snapshot(&self) -> Vec<Arc<dyn DerivedCollector>> {
        self.collectors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cleanup();
    }
}
