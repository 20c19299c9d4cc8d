//! Orchestrator driving a population of nodes through a run.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{sync::watch, task::JoinHandle, time::Instant};

use super::{IntervalGenerator, LatencyGenerator, Registry, SimulationRng};
use crate::{
    codec::{BincodeCodec, Codec, CodecError},
    config::{GlobalExecutor, SimulatorConfig, TransportKind},
    message::Identifier,
    metrics::{MetricsSink, NodeMetrics, NoopMetrics},
    network::{Network, RunContext},
    node::{Node, NodeFactory},
    transport::TransportError,
};

/// First synthetic port handed out to local transports when no base port is
/// configured.
pub const LOCAL_BASE_PORT: u16 = 20_000;

const IDENTIFIER_STREAM: u64 = 0;
const LATENCY_STREAM: u64 = 1;
const SCENARIO_STREAM: u64 = 2;

/// Unrecoverable problem observed while the population was running.
#[derive(Debug, Clone)]
pub enum Fault {
    /// An inbound request could not be decoded, which means two nodes disagree
    /// on the protocol.
    Decode {
        node: Identifier,
        origin: Identifier,
        error: CodecError,
    },
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode {
                node,
                origin,
                error,
            } => write!(f, "{node} could not decode a request from {origin}: {error}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("node {id} failed to bind {address}: {source}")]
    Bind {
        id: Identifier,
        address: SocketAddr,
        #[source]
        source: TransportError,
    },
    #[error("{} node(s) not ready after {timeout:?}: {missing:?}", .missing.len())]
    ReadinessTimeout {
        timeout: Duration,
        missing: Vec<Identifier>,
    },
    #[error("the population was already brought up")]
    AlreadyStarted,
    #[error("{} fault(s) recorded during the run", .0.len())]
    Faults(Vec<Fault>),
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub nodes: usize,
    pub transport: TransportKind,
    pub elapsed: Duration,
    /// Churn restarts that bound their address again.
    pub restarts: u64,
    pub failed_restarts: u64,
    /// Totals from the metrics sink, if it keeps any.
    pub metrics: Option<NodeMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Finished,
}

struct Running<N: Node> {
    network: Network<N>,
    /// `on_create` followed by `on_start`; aborted on teardown if still running.
    lifecycle: JoinHandle<()>,
}

struct NodeSlot<N: Node> {
    id: Identifier,
    /// Requested address until the first bind, the bound address afterwards.
    address: Mutex<SocketAddr>,
    running: Mutex<Option<Running<N>>>,
}

impl<N: Node> NodeSlot<N> {
    fn network(&self) -> Option<Network<N>> {
        self.running.lock().as_ref().map(|r| r.network.clone())
    }

    /// Tears the current instance down. Returns false when nothing was running.
    async fn stop(&self) -> bool {
        let running = self.running.lock().take();
        let Some(Running { network, lifecycle }) = running else {
            return false;
        };
        network.shutdown().await;
        lifecycle.abort();
        true
    }
}

/// Everything the per-node tasks need, shared with them by `Arc`.
struct Population<N: Node> {
    cx: Arc<RunContext<N::Event>>,
    factory: Box<dyn NodeFactory<N>>,
    slots: Vec<Arc<NodeSlot<N>>>,
}

impl<N: Node> Population<N> {
    fn slot(&self, id: &Identifier) -> Option<&Arc<NodeSlot<N>>> {
        self.slots.iter().find(|slot| slot.id == *id)
    }

    /// Binds a fresh network for `slot` and publishes its address.
    async fn bind_network(&self, slot: &NodeSlot<N>) -> Result<Network<N>, SimulationError> {
        let network = Network::new(slot.id, self.cx.clone());
        let requested = *slot.address.lock();
        let bound = network
            .bind(requested)
            .await
            .map_err(|source| SimulationError::Bind {
                id: slot.id,
                address: requested,
                source,
            })?;
        *slot.address.lock() = bound;
        Ok(network)
    }

    fn create_node(&self, network: &Network<N>) -> Arc<N> {
        let node = Arc::new(self.factory.create(network.id(), network.clone()));
        network.attach(node.clone());
        node
    }

    /// Brings one node back after its down time. Unlike the initial bring-up
    /// there is no population wide barrier, the node starts once it reports
    /// ready.
    async fn restart(&self, slot: &NodeSlot<N>) -> Result<(), SimulationError> {
        let network = self.bind_network(slot).await?;
        let node = self.create_node(&network);
        let members = self.cx.members.clone();
        let registry = self.cx.registry.clone();
        let timeout = self.cx.config.readiness_timeout();
        let id = slot.id;
        let lifecycle = GlobalExecutor::spawn(async move {
            if let Err(err) = node.on_create(&members).await {
                tracing::warn!(%id, %err, "on_create failed");
            }
            if let Err(missing) = registry.wait_ready(&[id], timeout).await {
                tracing::warn!(%id, ?missing, "restarted node never became ready");
                return;
            }
            if let Err(err) = node.on_start().await {
                tracing::warn!(%id, %err, "on_start failed");
            }
        });
        *slot.running.lock() = Some(Running { network, lifecycle });
        tracing::debug!(%id, "node restarted");
        Ok(())
    }

    async fn teardown(&self) {
        join_all(self.slots.iter().map(|slot| slot.stop())).await;
    }

    fn finish(&self, report: RunReport) -> Result<RunReport, SimulationError> {
        let faults = self.cx.take_faults();
        if faults.is_empty() {
            Ok(report)
        } else {
            Err(SimulationError::Faults(faults))
        }
    }
}

/// Builds a population of nodes over one transport and drives it through a
/// steady or a churning run.
///
/// ```rust,no_run
/// # use netbed::{config::SimulatorConfig, simulation::Simulator, Network, Node, Identifier};
/// # struct Quiet;
/// # impl Node for Quiet {
/// #     type Event = String;
/// #     async fn on_create(&self, _: &[Identifier]) -> anyhow::Result<()> { Ok(()) }
/// #     async fn on_start(&self) -> anyhow::Result<()> { Ok(()) }
/// #     async fn on_stop(&self) -> anyhow::Result<()> { Ok(()) }
/// #     async fn on_new_message(&self, _: Identifier, _: String) -> anyhow::Result<()> { Ok(()) }
/// # }
/// # async fn run() -> anyhow::Result<()> {
/// let simulator = Simulator::new(
///     |_id: Identifier, network: Network<Quiet>| {
///         network.ready();
///         Quiet
///     },
///     SimulatorConfig::default(),
/// )?;
/// let report = simulator.run_steady(std::time::Duration::from_secs(5)).await?;
/// # Ok(()) }
/// ```
pub struct Simulator<N: Node> {
    population: Arc<Population<N>>,
    rng: SimulationRng,
    phase: Mutex<Phase>,
}

impl<N: Node> Simulator<N> {
    pub fn new(
        factory: impl NodeFactory<N>,
        config: SimulatorConfig,
    ) -> Result<Self, SimulationError> {
        Self::with_parts(
            factory,
            config,
            Arc::new(BincodeCodec::new()),
            Arc::new(NoopMetrics),
        )
    }

    pub fn with_parts(
        factory: impl NodeFactory<N>,
        config: SimulatorConfig,
        codec: Arc<dyn Codec<N::Event>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, SimulationError> {
        Self::assemble(Box::new(factory), config, codec, metrics)
    }

    fn assemble(
        factory: Box<dyn NodeFactory<N>>,
        config: SimulatorConfig,
        codec: Arc<dyn Codec<N::Event>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, SimulationError> {
        config
            .validate()
            .map_err(|err| SimulationError::InvalidConfig(err.to_string()))?;
        let rng = SimulationRng::new(config.seed);
        let ids_rng = rng.child_with_index(IDENTIFIER_STREAM);
        let ids: Vec<Identifier> = (0..config.node_count)
            .map(|_| Identifier::random(&ids_rng))
            .collect();
        let latency = LatencyGenerator::new(&config.latency, rng.child_with_index(LATENCY_STREAM))
            .map_err(|err| SimulationError::InvalidConfig(err.to_string()))?;

        let slots = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                Ok(Arc::new(NodeSlot {
                    id: *id,
                    address: Mutex::new(initial_address(&config, i)?),
                    running: Mutex::new(None),
                }))
            })
            .collect::<Result<Vec<_>, SimulationError>>()?;

        let cx = Arc::new(RunContext::new(
            Arc::new(Registry::new()),
            Arc::new(config),
            codec,
            metrics,
            latency,
            ids.into(),
        ));
        Ok(Self {
            population: Arc::new(Population {
                cx,
                factory,
                slots,
            }),
            rng: rng.child_with_index(SCENARIO_STREAM),
            phase: Mutex::new(Phase::Created),
        })
    }

    /// Replaces the event codec. Only effective before the population is up.
    pub fn with_codec(self, codec: impl Codec<N::Event>) -> Result<Self, SimulationError> {
        let (factory, config, metrics) = self.into_parts()?;
        Self::assemble(factory, config, Arc::new(codec), metrics)
    }

    /// Replaces the metrics sink. Only effective before the population is up.
    pub fn with_metrics(self, metrics: Arc<dyn MetricsSink>) -> Result<Self, SimulationError> {
        let codec = self.population.cx.codec.clone();
        let (factory, config, _) = self.into_parts()?;
        Self::assemble(factory, config, codec, metrics)
    }

    #[allow(clippy::type_complexity)]
    fn into_parts(
        self,
    ) -> Result<
        (
            Box<dyn NodeFactory<N>>,
            SimulatorConfig,
            Arc<dyn MetricsSink>,
        ),
        SimulationError,
    > {
        if *self.phase.lock() != Phase::Created {
            return Err(SimulationError::AlreadyStarted);
        }
        let population =
            Arc::try_unwrap(self.population).map_err(|_| SimulationError::AlreadyStarted)?;
        let config = SimulatorConfig::clone(&population.cx.config);
        let metrics = population.cx.metrics.clone();
        Ok((population.factory, config, metrics))
    }

    /// Identifiers of the population, in creation order.
    pub fn identifiers(&self) -> &[Identifier] {
        &self.population.cx.members
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.population.cx.config
    }

    /// Generator for scenario code, independent from the streams the
    /// simulator itself draws from.
    pub fn rng(&self) -> &SimulationRng {
        &self.rng
    }

    pub fn registry(&self) -> &Registry {
        &self.population.cx.registry
    }

    /// Address currently bound by `id`.
    pub fn address_of(&self, id: &Identifier) -> Option<SocketAddr> {
        self.population.cx.registry.address_of(id)
    }

    /// Sends `event` from `origin` to `target` through `origin`'s network.
    ///
    /// Returns false when `origin` is not running or the send failed.
    pub async fn submit(&self, origin: Identifier, target: Identifier, event: &N::Event) -> bool {
        let Some(network) = self.population.slot(&origin).and_then(|s| s.network()) else {
            tracing::debug!(%origin, "submit from a node that is not running");
            return false;
        };
        match network.send(target, event).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(%origin, %target, %err, "submit failed");
                false
            }
        }
    }

    /// Binds every node, runs `on_create` everywhere, waits on the readiness
    /// barrier and then runs `on_start` everywhere.
    ///
    /// On a bind failure or a barrier timeout the nodes built so far are torn
    /// down before the error is returned.
    pub async fn bring_up(&self) -> Result<(), SimulationError> {
        {
            let mut phase = self.phase.lock();
            if *phase != Phase::Created {
                return Err(SimulationError::AlreadyStarted);
            }
            *phase = Phase::Running;
        }
        let population = &self.population;
        let cx = &population.cx;
        tracing::info!(
            nodes = population.slots.len(),
            transport = %cx.config.transport,
            seed = cx.config.seed,
            "bringing up population"
        );

        let mut bound = Vec::with_capacity(population.slots.len());
        for slot in &population.slots {
            match population.bind_network(slot).await {
                Ok(network) => bound.push((slot, network)),
                Err(err) => {
                    // no node was created yet, this only releases the addresses
                    for (_, network) in &bound {
                        network.shutdown().await;
                    }
                    *self.phase.lock() = Phase::Finished;
                    return Err(err);
                }
            }
        }

        let mut pending = Vec::with_capacity(bound.len());
        for (slot, network) in bound {
            let node = population.create_node(&network);
            let members = cx.members.clone();
            let id = slot.id;
            let on_create = GlobalExecutor::spawn(async move {
                if let Err(err) = node.on_create(&members).await {
                    tracing::warn!(%id, %err, "on_create failed");
                }
                node
            });
            pending.push((slot, network, on_create));
        }

        let timeout = cx.config.readiness_timeout();
        if let Err(missing) = cx.registry.wait_ready(&cx.members, timeout).await {
            tracing::error!(?missing, ?timeout, "readiness barrier timed out");
            for (_, network, on_create) in pending {
                on_create.abort();
                network.shutdown().await;
            }
            *self.phase.lock() = Phase::Finished;
            return Err(SimulationError::ReadinessTimeout { timeout, missing });
        }

        for (slot, network, on_create) in pending {
            let id = slot.id;
            let lifecycle = GlobalExecutor::spawn(async move {
                let node = match on_create.await {
                    Ok(node) => node,
                    Err(err) => {
                        tracing::warn!(%id, %err, "on_create task did not complete");
                        return;
                    }
                };
                if let Err(err) = node.on_start().await {
                    tracing::warn!(%id, %err, "on_start failed");
                }
            });
            *slot.running.lock() = Some(Running { network, lifecycle });
        }
        tracing::info!("population ready");
        Ok(())
    }

    /// Leaves the population alone for `duration`, then tears every node down.
    pub async fn run_steady(&self, duration: Duration) -> Result<RunReport, SimulationError> {
        self.ensure_up().await?;
        let started = Instant::now();
        tokio::time::sleep(duration).await;
        let elapsed = started.elapsed();
        self.shutdown().await;
        self.population.finish(self.report(elapsed, 0, 0))
    }

    /// Repeatedly stops and restarts every node until `duration` elapses.
    ///
    /// Each node alternates between `up` time alive and `down` time absent;
    /// every restart builds a fresh node at the same identifier and address.
    pub async fn run_churn(
        &self,
        duration: Duration,
        up: impl IntervalGenerator,
        down: impl IntervalGenerator,
    ) -> Result<RunReport, SimulationError> {
        self.ensure_up().await?;
        let up: Arc<dyn IntervalGenerator> = Arc::new(up);
        let down: Arc<dyn IntervalGenerator> = Arc::new(down);
        let restarts = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let started = Instant::now();
        let loops: Vec<_> = self
            .population
            .slots
            .iter()
            .map(|slot| {
                GlobalExecutor::spawn(churn_loop(
                    self.population.clone(),
                    slot.clone(),
                    up.clone(),
                    down.clone(),
                    stop_rx.clone(),
                    restarts.clone(),
                    failed.clone(),
                ))
            })
            .collect();

        tokio::time::sleep(duration).await;
        let _ = stop_tx.send(true);
        for (slot, result) in self.population.slots.iter().zip(join_all(loops).await) {
            if let Err(err) = result {
                tracing::error!(id = %slot.id, %err, "churn loop died");
            }
        }
        let elapsed = started.elapsed();
        self.shutdown().await;

        let report = self.report(
            elapsed,
            restarts.load(Ordering::Relaxed),
            failed.load(Ordering::Relaxed),
        );
        tracing::info!(
            restarts = report.restarts,
            failed_restarts = report.failed_restarts,
            "churn finished"
        );
        self.population.finish(report)
    }

    /// Tears down every node that is still running. Idempotent.
    pub async fn shutdown(&self) {
        self.population.teardown().await;
        *self.phase.lock() = Phase::Finished;
    }

    async fn ensure_up(&self) -> Result<(), SimulationError> {
        let phase = *self.phase.lock();
        match phase {
            Phase::Created => self.bring_up().await,
            Phase::Running => Ok(()),
            Phase::Finished => Err(SimulationError::AlreadyStarted),
        }
    }

    fn report(&self, elapsed: Duration, restarts: u64, failed_restarts: u64) -> RunReport {
        RunReport {
            nodes: self.population.slots.len(),
            transport: self.population.cx.config.transport,
            elapsed,
            restarts,
            failed_restarts,
            metrics: self.population.cx.metrics.snapshot(),
        }
    }
}

fn initial_address(config: &SimulatorConfig, index: usize) -> Result<SocketAddr, SimulationError> {
    let base = match (config.transport, config.base_port) {
        (_, Some(base)) => Some(base),
        (TransportKind::Local, None) => Some(LOCAL_BASE_PORT),
        // let the OS pick, churn restarts reuse whatever was assigned
        (_, None) => None,
    };
    let port = match base {
        Some(base) => u16::try_from(base as usize + index).map_err(|_| {
            SimulationError::InvalidConfig(format!("no port left for node {index} above {base}"))
        })?,
        None => 0,
    };
    Ok(SocketAddr::new(config.host, port))
}

/// Resolves once the stop signal was sent, or after `interval` otherwise.
/// Returns true when the loop must stop.
async fn sleep_or_stop(interval: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = stop.wait_for(|stop| *stop) => true,
        _ = tokio::time::sleep(interval) => false,
    }
}

async fn churn_loop<N: Node>(
    population: Arc<Population<N>>,
    slot: Arc<NodeSlot<N>>,
    up: Arc<dyn IntervalGenerator>,
    down: Arc<dyn IntervalGenerator>,
    mut stop: watch::Receiver<bool>,
    restarts: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
) {
    loop {
        if sleep_or_stop(up.next_interval(), &mut stop).await {
            break;
        }
        if slot.stop().await {
            tracing::debug!(id = %slot.id, "node left");
        }
        if sleep_or_stop(down.next_interval(), &mut stop).await {
            break;
        }
        match population.restart(&slot).await {
            Ok(()) => {
                restarts.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::warn!(id = %slot.id, %err, "failed to restart node");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl Node for Idle {
        type Event = String;

        async fn on_create(&self, _members: &[Identifier]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_stop(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_new_message(&self, _origin: Identifier, _event: String) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn ready_idle(_id: Identifier, network: Network<Idle>) -> Idle {
        network.ready();
        Idle
    }

    #[test]
    fn local_addresses_count_from_the_base() {
        let config = SimulatorConfig::default();
        assert_eq!(initial_address(&config, 3).unwrap().port(), LOCAL_BASE_PORT + 3);

        let config = SimulatorConfig {
            transport: TransportKind::Stream,
            ..Default::default()
        };
        assert_eq!(initial_address(&config, 3).unwrap().port(), 0);

        let config = SimulatorConfig {
            transport: TransportKind::Rpc,
            base_port: Some(u16::MAX),
            ..Default::default()
        };
        assert!(initial_address(&config, 1).is_err());
    }

    #[test]
    fn identifiers_follow_the_seed() {
        let first = Simulator::new(ready_idle, SimulatorConfig::default()).unwrap();
        let second = Simulator::new(ready_idle, SimulatorConfig::default()).unwrap();
        assert_eq!(first.identifiers(), second.identifiers());
        assert_eq!(first.identifiers().len(), 5);

        let other = Simulator::new(
            ready_idle,
            SimulatorConfig {
                seed: 1,
                ..Default::default()
            },
        )
        .unwrap();
        assert_ne!(first.identifiers(), other.identifiers());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let res = Simulator::new(
            ready_idle,
            SimulatorConfig {
                node_count: 0,
                ..Default::default()
            },
        );
        assert!(matches!(res, Err(SimulationError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn population_comes_up_once() -> testresult::TestResult {
        let simulator = Simulator::new(ready_idle, SimulatorConfig::default())?;
        simulator.bring_up().await?;
        for id in simulator.identifiers() {
            assert!(simulator.registry().is_ready(id));
        }
        assert!(matches!(
            simulator.bring_up().await,
            Err(SimulationError::AlreadyStarted)
        ));
        let report = simulator.run_steady(Duration::from_millis(10)).await?;
        assert_eq!(report.nodes, 5);
        assert!(report.metrics.is_none());
        for id in simulator.identifiers() {
            assert!(!simulator.registry().is_ready(id));
            assert_eq!(simulator.address_of(id), None);
        }
        Ok(())
    }

    #[tokio::test]
    async fn bind_conflict_aborts_bring_up() -> testresult::TestResult {
        let squatter = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = squatter.local_addr()?.port();
        let config = SimulatorConfig {
            transport: TransportKind::Stream,
            node_count: 1,
            base_port: Some(port),
            ..Default::default()
        };
        let simulator = Simulator::new(ready_idle, config)?;
        let res = simulator.bring_up().await;
        assert!(matches!(
            res,
            Err(SimulationError::Bind {
                source: TransportError::AddressInUse(_),
                ..
            })
        ));
        Ok(())
    }
}
