//! Population orchestration for protocol experiments.
//!
//! A run is owned by one [`Simulator`]: it allocates identifiers, builds one
//! network, transport and node per identifier through a factory, waits on the
//! readiness barrier and then either leaves the population alone
//! ([`Simulator::run_steady`]) or keeps stopping and restarting nodes
//! ([`Simulator::run_churn`]).
//!
//! # Shared state
//!
//! Every piece of state that crosses node boundaries lives in run-scoped
//! objects handed down at construction, never in statics:
//!
//! - [`Registry`]: readiness flags, published addresses and the in-process
//!   routes of the local transport,
//! - [`LatencyGenerator`]: per pair synthetic delay, sampled once,
//! - [`SimulationRng`]: seeded randomness for identifiers, latency and churn.
//!
//! Two simulators in one process therefore never see each other's nodes.
//!
//! # Reproducibility
//!
//! With equal seeds two runs get the same identifiers and the same per pair
//! latencies. Message interleaving is still decided by the tokio scheduler and
//! the operating system, so runs are reproducible in their inputs, not in
//! their exact event order.

mod churn;
mod latency;
mod registry;
mod rng;
mod simulator;

pub use churn::{ExponentialInterval, FixedInterval, IntervalGenerator, UniformInterval};
pub use latency::LatencyGenerator;
pub use registry::Registry;
pub use rng::SimulationRng;
pub use simulator::{Fault, RunReport, SimulationError, Simulator, LOCAL_BASE_PORT};
