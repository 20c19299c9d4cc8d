//! Pluggable underlays that physically move [`Request`]s between nodes.
//!
//! Every variant satisfies the same [`Underlay`] contract:
//!
//! - `initialize` binds the endpoint and starts listening,
//! - `send_message` delivers one request to another endpoint, best effort and
//!   without retries,
//! - `terminate` releases the endpoint. It is idempotent and, once it returns,
//!   the address can be bound again.
//!
//! Inbound requests are handed to the owning network through its [`Dispatch`]
//! handle, always from a task other than the listener loop.
//!
//! The concrete variant is picked once at construction time through
//! [`AnyUnderlay`]; variants share no state besides the run's registry.

use std::{borrow::Cow, future::Future, io, net::SocketAddr, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::{SimulatorConfig, TransportKind},
    message::{Identifier, Request},
    simulation::Registry,
};

mod datagram;
mod local;
mod rpc;
mod stream;
mod wire;

pub use self::{
    datagram::{DatagramUnderlay, MAX_DATAGRAM_SIZE},
    local::LocalUnderlay,
    rpc::RpcUnderlay,
    stream::StreamUnderlay,
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("address {0} already in use")]
    AddressInUse(SocketAddr),
    #[error("transport not initialized")]
    NotInitialized,
    #[error("transport already listening on {0}")]
    AlreadyInitialized(SocketAddr),
    #[error("no endpoint bound at {0}")]
    Unreachable(SocketAddr),
    #[error("destination {0} is not ready")]
    NotReady(Identifier),
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("message too big, size: {size}, max size: {max_size}")]
    MessageTooBig { size: usize, max_size: usize },
    #[error("remote call to {0} timed out")]
    Timeout(SocketAddr),
    #[error("remote endpoint {address} rejected the call: {cause}")]
    Rejected {
        address: SocketAddr,
        cause: Cow<'static, str>,
    },
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] bincode::Error),
}

impl TransportError {
    /// Maps a bind failure, keeping "address in use" distinguishable.
    pub(crate) fn bind(addr: SocketAddr, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::AddrInUse {
            Self::AddressInUse(addr)
        } else {
            Self::IO(err)
        }
    }
}

/// Receiving side callback: the network that owns a transport.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch_request(&self, request: Request);
}

pub trait Underlay: Send + Sync + 'static {
    /// Binds the endpoint at `addr` and returns the address actually bound,
    /// which differs from `addr` when port 0 was requested or the variant moved
    /// to another port.
    fn initialize(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = Result<SocketAddr, TransportError>> + Send;

    fn send_message(
        &self,
        target: SocketAddr,
        request: &Request,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn terminate(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Everything a transport needs from its run.
#[derive(Clone)]
pub struct UnderlayContext {
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<dyn Dispatch>,
    pub config: Arc<SimulatorConfig>,
}

/// The transport selected for a run.
pub enum AnyUnderlay {
    Local(LocalUnderlay),
    Stream(StreamUnderlay),
    Datagram(DatagramUnderlay),
    Rpc(RpcUnderlay),
}

impl AnyUnderlay {
    pub fn new(kind: TransportKind, cx: UnderlayContext) -> Self {
        match kind {
            TransportKind::Local => Self::Local(LocalUnderlay::new(cx)),
            TransportKind::Stream => Self::Stream(StreamUnderlay::new(cx)),
            TransportKind::Datagram => Self::Datagram(DatagramUnderlay::new(cx)),
            TransportKind::Rpc => Self::Rpc(RpcUnderlay::new(cx)),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Local(_) => TransportKind::Local,
            Self::Stream(_) => TransportKind::Stream,
            Self::Datagram(_) => TransportKind::Datagram,
            Self::Rpc(_) => TransportKind::Rpc,
        }
    }
}

impl Underlay for AnyUnderlay {
    async fn initialize(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        match self {
            Self::Local(u) => u.initialize(addr).await,
            Self::Stream(u) => u.initialize(addr).await,
            Self::Datagram(u) => u.initialize(addr).await,
            Self::Rpc(u) => u.initialize(addr).await,
        }
    }

    async fn send_message(
        &self,
        target: SocketAddr,
        request: &Request,
    ) -> Result<(), TransportError> {
        match self {
            Self::Local(u) => u.send_message(target, request).await,
            Self::Stream(u) => u.send_message(target, request).await,
            Self::Datagram(u) => u.send_message(target, request).await,
            Self::Rpc(u) => u.send_message(target, request).await,
        }
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        match self {
            Self::Local(u) => u.terminate().await,
            Self::Stream(u) => u.terminate().await,
            Self::Datagram(u) => u.terminate().await,
            Self::Rpc(u) => u.terminate().await,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Local(u) => u.local_addr(),
            Self::Stream(u) => u.local_addr(),
            Self::Datagram(u) => u.local_addr(),
            Self::Rpc(u) => u.local_addr(),
        }
    }
}

/// A running listener loop: its bound address, the shutdown signal it selects
/// on and the task to join.
pub(crate) struct Listener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Listener {
    pub(crate) fn new(
        local_addr: SocketAddr,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            local_addr,
            shutdown,
            task,
        }
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals the loop and waits for it to exit. The loop owns the socket, so
    /// once this returns the address is free.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            if err.is_panic() {
                tracing::error!(addr = %self.local_addr, "listener loop panicked");
            }
        }
    }
}

/// Shutdown signal observed by listener loops and their handlers.
pub(crate) fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once `true` was sent on the channel or the sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Payload of a remote invocation; the reply tells whether it was accepted.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum RpcFrame {
    Call(Request),
    Reply { accepted: bool },
}
