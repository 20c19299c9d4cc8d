//! Contract implemented by the protocol under test.
//!
//! A node is written once against [`Node`] and runs unmodified over every
//! transport. Its lifecycle is driven by the [`Simulator`](crate::simulation::Simulator):
//!
//! 1. built by a [`NodeFactory`] with its identifier and a bound [`Network`] handle,
//! 2. [`Node::on_create`] with the full membership; the node must eventually call
//!    [`Network::ready`],
//! 3. once every node is ready, [`Node::on_start`],
//! 4. any number of interleaved [`Node::on_new_message`] calls,
//! 5. [`Node::on_stop`], after which the instance is dropped. By then the
//!    node receives nothing more and its network refuses sends.
//!
//! Callbacks take `&self` because inbound messages are delivered concurrently,
//! each on its own task; nodes keep their state behind locks or atomics. Errors
//! returned by a callback are logged and never reach the transport.

use std::future::Future;

use crate::{
    message::{Event, Identifier},
    network::Network,
};

pub trait Node: Send + Sync + Sized + 'static {
    type Event: Event;

    fn on_create(
        &self,
        members: &[Identifier],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn on_start(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn on_stop(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn on_new_message(
        &self,
        origin: Identifier,
        event: Self::Event,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Builds fresh node instances, both for the initial population and for every
/// churn restart.
pub trait NodeFactory<N: Node>: Send + Sync + 'static {
    fn create(&self, id: Identifier, network: Network<N>) -> N;
}

impl<N, F> NodeFactory<N> for F
where
    N: Node,
    F: Fn(Identifier, Network<N>) -> N + Send + Sync + 'static,
{
    fn create(&self, id: Identifier, network: Network<N>) -> N {
        self(id, network)
    }
}
