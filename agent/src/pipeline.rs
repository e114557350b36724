//! Aggregation orchestrator
//!
//! One generation of the pipeline runs these tasks:
//!
//! ```text
//! producer --[snapshots: 10]--> merge --[exposed: 10]--> exposition server
//!                                 |
//!                                 +-- registry.gather() appended
//!                                 +-- spawn forward(snapshot + derived)
//! ```
//!
//! A signal drains the generation: the cancellation token is triggered and
//! the producer and exposition server must stop within the shutdown
//! timeout. A reload signal then builds a new generation from scratch.

use crate::catalog::{DEFAULT_COUNTERS, DEFAULT_EXPORTER_COUNTERS};
use crate::config::AgentConfig;
use crate::counters;
use crate::derived::{DerivedKind, WindowedCollector};
use crate::error::AgentError;
use crate::forward::{Forwarder, HyperTransport, Transport};
use crate::hostengine;
use crate::metrics;
use crate::producer::{MetricsProducer, WatchProducer};
use crate::reader::{FieldReader, Session};
use crate::registry::{DerivedCollector, Registry};
use crate::server::{ExpositionServer, HttpExpositionServer};
use crate::signals::{ControlSignal, SignalSource};
use crate::system_info::{EntityGroup, SystemInfo};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_shared::{render, CounterSet};

/// Capacity of the producer and exposition buffers
pub const SNAPSHOT_BUFFER: usize = 10;

/// Pipeline lifecycle, published on [`Agent::lifecycle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Initializing,
    Running,
    Draining,
    Terminated,
}

/// Read-only state shared by the collaborators of one generation
pub struct GenerationContext<'a> {
    pub config: &'a AgentConfig,
    pub session: &'a Session,
    pub counters: Arc<CounterSet>,
    pub system_info: Arc<SystemInfo>,
    pub hostname: String,
}

/// Factories for everything the orchestrator does not implement itself
#[async_trait]
pub trait Collaborators: Send + Sync {
    async fn connect(&self, config: &AgentConfig) -> Result<Session, AgentError>;

    fn producer(&self, ctx: &GenerationContext<'_>) -> Result<Box<dyn MetricsProducer>, AgentError>;

    fn derived_collector(
        &self,
        kind: DerivedKind,
        ctx: &GenerationContext<'_>,
    ) -> Result<Arc<dyn DerivedCollector>, AgentError>;

    fn exposition_server(
        &self,
        config: &AgentConfig,
        exposed: mpsc::Receiver<String>,
        registry: Arc<Registry>,
    ) -> Result<Box<dyn ExpositionServer>, AgentError>;
}

/// Standalone hostengine, `dcgmi` reads and the hyper exposition server
#[derive(Debug, Default, Clone, Copy)]
pub struct DcgmCollaborators;

#[async_trait]
impl Collaborators for DcgmCollaborators {
    async fn connect(&self, config: &AgentConfig) -> Result<Session, AgentError> {
        hostengine::connect(&config.remote_hostengine, &config.dcgmi_path).await
    }

    fn producer(&self, ctx: &GenerationContext<'_>) -> Result<Box<dyn MetricsProducer>, AgentError> {
        Ok(Box::new(WatchProducer::new(
            ctx.config,
            ctx.counters.clone(),
            ctx.hostname.clone(),
            ctx.session.reader(),
            ctx.system_info.clone(),
        )))
    }

    fn derived_collector(
        &self,
        kind: DerivedKind,
        ctx: &GenerationContext<'_>,
    ) -> Result<Arc<dyn DerivedCollector>, AgentError> {
        let metric = ctx
            .counters
            .exporter
            .iter()
            .find(|c| c.id == kind.metric_id())
            .cloned()
            .ok_or_else(|| AgentError::Registration {
                collector: kind.to_string(),
                reason: "metric is not in the exporter counters".to_string(),
            })?;
        let window = match kind {
            DerivedKind::XidErrors => ctx.config.xid_window,
            DerivedKind::ClockEvents => ctx.config.clock_events_window,
        };
        Ok(Arc::new(WindowedCollector::new(
            kind,
            metric,
            ctx.session.reader(),
            ctx.hostname.clone(),
            window,
        )))
    }

    fn exposition_server(
        &self,
        config: &AgentConfig,
        exposed: mpsc::Receiver<String>,
        registry: Arc<Registry>,
    ) -> Result<Box<dyn ExpositionServer>, AgentError> {
        let server = HttpExpositionServer::bind(config.listen_socket()?, exposed, registry)?;
        Ok(Box::new(server))
    }
}

/// Hostname label value, empty when disabled
pub fn resolve_hostname(config: &AgentConfig) -> Result<String, AgentError> {
    if config.no_hostname {
        return Ok(String::new());
    }
    hostname::get()?
        .into_string()
        .map_err(|h| AgentError::config(format!("hostname {:?} is not valid UTF-8", h)))
}

/// Runs pipeline generations until a terminating signal
pub struct Agent {
    config: AgentConfig,
    collaborators: Arc<dyn Collaborators>,
    transport: Arc<dyn Transport>,
    lifecycle: watch::Sender<Lifecycle>,
    generation: u64,
}

impl Agent {
    pub fn new(config: AgentConfig, collaborators: Arc<dyn Collaborators>) -> Self {
        let transport = Arc::new(HyperTransport::new(config.forward.timeout));
        let (lifecycle, _) = watch::channel(Lifecycle::Initializing);
        Self {
            config,
            collaborators,
            transport,
            lifecycle,
            generation: 0,
        }
    }

    /// Replace the HTTP transport used for forwarding
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Generations started so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Run until `signals` yields [`ControlSignal::Terminate`].
    ///
    /// Startup errors and shutdown timeouts end the run with an error.
    pub async fn run(&mut self, signals: &mut dyn SignalSource) -> Result<(), AgentError> {
        self.config.validate()?;

        loop {
            self.set_state(Lifecycle::Initializing);
            self.generation += 1;
            metrics::GENERATION.set(self.generation as f64);
            info!("Starting pipeline generation {}", self.generation);

            let generation = self.start().await?;
            self.set_state(Lifecycle::Running);

            let signal = signals.next().await;
            self.set_state(Lifecycle::Draining);
            let drained = generation.shutdown(self.config.shutdown_timeout).await;
            self.set_state(Lifecycle::Terminated);
            drained?;

            match signal {
                ControlSignal::Terminate => {
                    info!("Pipeline terminated");
                    return Ok(());
                }
                ControlSignal::Reload => info!("Restarting pipeline"),
            }
        }
    }

    fn set_state(&self, state: Lifecycle) {
        debug!("Pipeline state: {:?}", state);
        self.lifecycle.send_replace(state);
    }

    async fn start(&self) -> Result<Generation, AgentError> {
        let config = &self.config;

        let session = self.collaborators.connect(config).await?;

        let counters = Arc::new(counters::resolve(
            DEFAULT_COUNTERS,
            DEFAULT_EXPORTER_COUNTERS,
            config.collectors_path.as_deref(),
        )?);
        info!(
            "Watching {} counters, {} exporter counters",
            counters.primary.len(),
            counters.exporter.len()
        );

        let mut system_info = SystemInfo::build(&counters.primary, config);
        for group in EntityGroup::MONITORED {
            if let Err(e) = system_info.load(group) {
                info!("Not collecting {} metrics: {}", group, e);
            }
        }
        check_profiling(session.reader().as_ref(), &mut system_info).await;
        let system_info = Arc::new(system_info);

        let ctx = GenerationContext {
            config,
            session: &session,
            counters: counters.clone(),
            system_info: system_info.clone(),
            hostname: resolve_hostname(config)?,
        };

        let producer = self.collaborators.producer(&ctx)?;

        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let (exposed_tx, exposed_rx) = mpsc::channel(SNAPSHOT_BUFFER);

        let registry = Arc::new(Registry::new());
        let server = self
            .collaborators
            .exposition_server(config, exposed_rx, registry.clone())?;

        for kind in DerivedKind::ALL {
            if !kind.is_enabled(&counters.exporter) {
                continue;
            }
            if !system_info.is_loaded(EntityGroup::Gpu) {
                return Err(AgentError::Registration {
                    collector: kind.to_string(),
                    reason: "no GPU fields are watched".to_string(),
                });
            }
            registry.register(self.collaborators.derived_collector(kind, &ctx)?);
            debug!("{} collector initialized", kind);
        }
        drop(ctx);

        let cancel = CancellationToken::new();
        let producer_task = tokio::spawn(producer.run(snapshot_tx, cancel.clone()));
        let server_task = tokio::spawn(server.run(cancel.clone()));

        let merge = MergeTask {
            snapshots: snapshot_rx,
            exposed: exposed_tx,
            registry: registry.clone(),
            forwarder: Forwarder::new(&config.forward, self.transport.clone()),
            cancel: cancel.clone(),
        };
        let merge_task = tokio::spawn(merge.run());

        Ok(Generation {
            cancel,
            producer: producer_task,
            server: server_task,
            merge: merge_task,
            registry,
            _session: session,
        })
    }
}

/// Tasks and resources of one running generation
struct Generation {
    cancel: CancellationToken,
    producer: JoinHandle<()>,
    server: JoinHandle<()>,
    merge: JoinHandle<()>,
    registry: Arc<Registry>,
    // released last
    _session: Session,
}

impl Generation {
    /// Cancel and wait for the producer and exposition server.
    ///
    /// The merge task and in-flight forwards are not waited for.
    async fn shutdown(self, limit: Duration) -> Result<(), AgentError> {
        self.cancel.cancel();

        let tasks = [("producer", self.producer), ("exposition server", self.server)];
        let wait = async {
            for (name, task) in tasks {
                if let Err(e) = task.await {
                    warn!("{} task failed: {}", name, e);
                }
            }
        };

        let result = match tokio::time::timeout(limit, wait).await {
            Ok(()) => Ok(()),
            Err(_) => {
                error!("Pipeline tasks did not stop within {:?}", limit);
                Err(AgentError::ShutdownTimeout(limit))
            }
        };

        drop(self.merge);
        self.registry.cleanup();
        result
    }
}

/// Fans each producer snapshot out to the exposition server and the forwarder
struct MergeTask {
    snapshots: mpsc::Receiver<String>,
    exposed: mpsc::Sender<String>,
    registry: Arc<Registry>,
    forwarder: Forwarder,
    cancel: CancellationToken,
}

impl MergeTask {
    async fn run(mut self) {
        loop {
            let snapshot = tokio::select! {
                _ = self.cancel.cancelled() => break,
                snapshot = self.snapshots.recv() => match snapshot {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };

            let mut outgoing = snapshot.clone().into_bytes();

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = self.exposed.send(snapshot) => {
                    if sent.is_err() {
                        debug!("Exposition server no longer receives snapshots");
                    }
                }
            }

            // the primary snapshot alone is forwarded when this fails
            match self.derived().await {
                Some(text) => outgoing.extend_from_slice(text.as_bytes()),
                None => metrics::AGGREGATION_FAILURES.inc(),
            }

            let forwarder = self.forwarder.clone();
            tokio::spawn(async move {
                if let Err(e) = forwarder.forward(outgoing).await {
                    error!("{}", e);
                }
            });

            metrics::CYCLES_TOTAL.inc();
        }

        debug!("Merge task stopped");
    }

    async fn derived(&self) -> Option<String> {
        let gathered = match self.registry.gather().await {
            Ok(gathered) => gathered,
            Err(e) => {
                error!("{:#}", anyhow::Error::from(e));
                return None;
            }
        };

        match render(&gathered) {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Failed to render registry metrics: {}", e);
                None
            }
        }
    }
}

/// Read the profiling fields once. Without profiling support they are dropped,
/// otherwise every GPU read would fail.
async fn check_profiling(reader: &dyn FieldReader, system_info: &mut SystemInfo) {
    let fields = system_info.profiling_fields();
    if fields.is_empty() {
        return;
    }
    match reader.read(EntityGroup::Gpu, &fields).await {
        Ok(_) => info!("Collecting DCP metrics"),
        Err(e) => {
            let dropped = system_info.drop_profiling();
            info!("Not collecting DCP metrics: {:#}", e);
            debug!("Dropped {} profiling fields", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system_info::is_profiling_field;

    /// Fails every read that asks for a profiling field
    struct NoProfiling;

    #[async_trait]
    impl FieldReader for NoProfiling {
        async fn read(
            &self,
            _group: EntityGroup,
            fields: &[vigil_shared::MetricDefinition],
        ) -> anyhow::Result<Vec<crate::reader::EntityReading>> {
            if fields.iter().any(|f| is_profiling_field(f.id)) {
                anyhow::bail!("profiling is not supported on GPU 0");
            }
            Ok(Vec::new())
        }
    }

    fn default_system_info() -> SystemInfo {
        let mut info = SystemInfo::build(DEFAULT_COUNTERS, &AgentConfig::default());
        info.load(EntityGroup::Gpu).unwrap();
        info
    }

    #[tokio::test]
    async fn test_unsupported_profiling_is_dropped() {
        let mut info = default_system_info();
        check_profiling(&NoProfiling, &mut info).await;

        let gpu = info.fields(EntityGroup::Gpu).unwrap();
        assert!(!gpu.is_empty());
        assert!(gpu.iter().all(|f| !is_profiling_field(f.id)));
    }

    #[tokio::test]
    async fn test_supported_profiling_is_kept() {
        struct AllFields;

        #[async_trait]
        impl FieldReader for AllFields {
            async fn read(
                &self,
                _group: EntityGroup,
                _fields: &[vigil_shared::MetricDefinition],
            ) -> anyhow::Result<Vec<crate::reader::EntityReading>> {
                Ok(Vec::new())
            }
        }

        let mut info = default_system_info();
        let before = info.profiling_fields();
        check_profiling(&AllFields, &mut info).await;
        assert!(!before.is_empty());
        assert_eq!(info.profiling_fields(), before);
    }

    #[test]
    fn test_no_hostname_is_empty() {
        let config = AgentConfig {
            no_hostname: true,
            ..AgentConfig::default()
        };
        assert_eq!(resolve_hostname(&config).unwrap(), "");
    }

    #[test]
    fn test_hostname_resolved_by_default() {
        assert!(!resolve_hostname(&AgentConfig::default()).unwrap().is_empty());
    }
}
