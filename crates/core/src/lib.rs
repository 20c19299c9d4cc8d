//! Testbed for distributed algorithms.
//!
//! A protocol is written once against [`Node`] and run unmodified over any of
//! the interchangeable transports in [`transport`], under synthetic latency,
//! with its population driven by a [`simulation::Simulator`].

/// Event encoding contract and the bundled codecs.
pub mod codec;

/// Simulator configuration and the shared task executor.
pub mod config;

/// Identifiers, wire requests and the event contract.
mod message;
pub use message::{Event, Identifier, Request};

/// Metrics collaborator call-outs.
pub mod metrics;

/// Per-node middle layer.
mod network;
pub use network::{Network, SendError};

/// Contract implemented by protocols under test.
mod node;
pub use node::{Node, NodeFactory};

/// Population orchestration, readiness barrier, latency model and churn.
pub mod simulation;

/// Logging setup.
pub mod tracing;

/// Transports moving requests between nodes.
pub mod transport;
