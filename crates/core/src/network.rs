//! Per-node middle layer between application events and wire requests.
//!
//! A [`Network`] binds exactly one [`Node`] to exactly one transport. Outbound
//! events are encoded, wrapped in a [`Request`], optionally delayed by the
//! run's latency model and handed to the transport. Inbound requests are
//! decoded and delivered to the node on a task of their own, so a slow
//! callback never holds up the transport or other deliveries.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    codec::{Codec, CodecError},
    config::{GlobalExecutor, SimulatorConfig},
    message::{Event, Identifier, Request},
    metrics::MetricsSink,
    node::Node,
    simulation::{Fault, LatencyGenerator, Registry},
    transport::{AnyUnderlay, Dispatch, TransportError, Underlay, UnderlayContext},
};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("unknown destination {0}")]
    UnknownDestination(Identifier),
    #[error(transparent)]
    Encode(#[from] CodecError),
    #[error("failed to deliver to {target}: {source}")]
    Transport {
        target: Identifier,
        #[source]
        source: TransportError,
    },
    #[error("network of {0} is terminated")]
    Terminated(Identifier),
}

/// State shared by every network of one run.
pub(crate) struct RunContext<E> {
    pub registry: Arc<Registry>,
    pub config: Arc<SimulatorConfig>,
    pub codec: Arc<dyn Codec<E>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub latency: LatencyGenerator,
    pub members: Arc<[Identifier]>,
    faults: Mutex<Vec<Fault>>,
}

impl<E> RunContext<E> {
    pub fn new(
        registry: Arc<Registry>,
        config: Arc<SimulatorConfig>,
        codec: Arc<dyn Codec<E>>,
        metrics: Arc<dyn MetricsSink>,
        latency: LatencyGenerator,
        members: Arc<[Identifier]>,
    ) -> Self {
        Self {
            registry,
            config,
            codec,
            metrics,
            latency,
            members,
            faults: Mutex::new(Vec::new()),
        }
    }

    pub fn record_fault(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn take_faults(&self) -> Vec<Fault> {
        std::mem::take(&mut *self.faults.lock())
    }
}

/// Handle through which a node talks to the rest of the population.
///
/// Cheap to clone; every clone refers to the same endpoint.
pub struct Network<N: Node> {
    inner: Arc<NetworkInner<N>>,
}

impl<N: Node> Clone for Network<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct NetworkInner<N: Node> {
    id: Identifier,
    cx: Arc<RunContext<N::Event>>,
    underlay: AnyUnderlay,
    node: RwLock<Option<Arc<N>>>,
    terminated: AtomicBool,
}

/// Receiving side handed to the transport. Holds the network weakly so the
/// transport never keeps its owner alive.
struct Inbound<N: Node> {
    network: Weak<NetworkInner<N>>,
}

impl<N: Node> Dispatch for Inbound<N> {
    fn dispatch_request(&self, request: Request) {
        match self.network.upgrade() {
            Some(network) => network.receive(request),
            None => tracing::debug!(origin = %request.origin(), "network gone, dropping request"),
        }
    }
}

impl<N: Node> Network<N> {
    pub(crate) fn new(id: Identifier, cx: Arc<RunContext<N::Event>>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<NetworkInner<N>>| {
            let dispatcher = Arc::new(Inbound {
                network: weak.clone(),
            });
            let underlay = AnyUnderlay::new(
                cx.config.transport,
                UnderlayContext {
                    registry: cx.registry.clone(),
                    dispatcher,
                    config: cx.config.clone(),
                },
            );
            NetworkInner {
                id,
                cx,
                underlay,
                node: RwLock::new(None),
                terminated: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    pub fn id(&self) -> Identifier {
        self.inner.id
    }

    /// Address of the underlying transport, once bound.
    pub fn address(&self) -> Option<SocketAddr> {
        self.inner.underlay.local_addr()
    }

    /// Every identifier of the population, including this node's.
    pub fn members(&self) -> &[Identifier] {
        &self.inner.cx.members
    }

    /// Marks this node as ready. Idempotent, and a no-op once the network
    /// was shut down.
    pub fn ready(&self) {
        if self.inner.terminated.load(Ordering::Acquire) {
            tracing::debug!(id = %self.inner.id, "ignoring ready() on a terminated network");
            return;
        }
        self.inner.cx.registry.mark_ready(self.inner.id);
    }

    /// Sends `event` to `target`, best effort.
    ///
    /// Fails fast when the target has no live endpoint. Failures are not
    /// retried.
    pub async fn send(&self, target: Identifier, event: &N::Event) -> Result<(), SendError> {
        let inner = &*self.inner;
        if inner.terminated.load(Ordering::Acquire) {
            return Err(SendError::Terminated(inner.id));
        }
        let address = inner
            .cx
            .registry
            .address_of(&target)
            .ok_or(SendError::UnknownDestination(target))?;
        let payload = inner.cx.codec.encode(event)?;
        let size = payload.len();
        let request = Request::new(payload, inner.id, target);

        if inner.cx.config.latency.applies_to(inner.underlay.kind()) {
            let delay = inner.cx.latency.simulated_latency(inner.id, target, true);
            tokio::time::sleep(delay).await;
        }

        inner
            .underlay
            .send_message(address, &request)
            .await
            .map_err(|source| SendError::Transport { target, source })?;

        inner.cx.metrics.message_sent(inner.id);
        inner.cx.metrics.packet_size(inner.id, size);
        tracing::trace!(from = %inner.id, to = %target, size, event = %event.log_line(), "sent");
        Ok(())
    }

    /// Binds the transport and publishes the resulting address.
    pub(crate) async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let bound = self.inner.underlay.initialize(addr).await?;
        self.inner.cx.registry.publish_address(self.inner.id, bound);
        Ok(bound)
    }

    pub(crate) fn attach(&self, node: Arc<N>) {
        *self.inner.node.write() = Some(node);
    }

    pub(crate) fn node(&self) -> Option<Arc<N>> {
        self.inner.node.read().clone()
    }

    /// Stops the node and releases the endpoint. Delivery is closed and the
    /// identifier forgotten first, then `on_stop` runs, then the transport
    /// terminates.
    ///
    /// Once this returns the address can be bound again.
    pub(crate) async fn shutdown(&self) {
        let inner = &*self.inner;
        inner.terminated.store(true, Ordering::Release);
        // also breaks the node -> network -> node cycle
        let node = inner.node.write().take();
        inner.cx.registry.forget(&inner.id);
        if let Some(node) = node {
            if let Err(err) = node.on_stop().await {
                tracing::warn!(id = %inner.id, %err, "on_stop failed");
            }
        }
        if let Err(err) = inner.underlay.terminate().await {
            tracing::warn!(id = %inner.id, %err, "failed to terminate transport");
        }
        tracing::debug!(id = %inner.id, "network shut down");
    }
}

impl<N: Node> NetworkInner<N> {
    fn receive(&self, request: Request) {
        let origin = request.origin();
        if self.terminated.load(Ordering::Acquire) {
            tracing::debug!(id = %self.id, %origin, "network terminated, dropping request");
            return;
        }
        if request.destination() != self.id {
            tracing::warn!(
                id = %self.id,
                destination = %request.destination(),
                %origin,
                "dropping misrouted request"
            );
            return;
        }
        let event = match self.cx.codec.decode(request.payload()) {
            Ok(event) => event,
            Err(error) => {
                tracing::error!(id = %self.id, %origin, %error, "failed to decode inbound request");
                self.cx.record_fault(Fault::Decode {
                    node: self.id,
                    origin,
                    error,
                });
                return;
            }
        };
        let Some(node) = self.node.read().clone() else {
            tracing::debug!(id = %self.id, %origin, "node not running, dropping request");
            return;
        };
        self.cx.metrics.message_received(self.id);
        let id = self.id;
        GlobalExecutor::spawn(async move {
            if let Err(err) = node.on_new_message(origin, event).await {
                tracing::warn!(%id, %origin, %err, "on_new_message failed");
            }
        });
    }
}
