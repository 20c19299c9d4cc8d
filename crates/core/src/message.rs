//! Identifiers, wire requests and the application event contract.

use std::fmt::{Debug, Display};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use ulid::Ulid;

use crate::simulation::SimulationRng;

/// Globally unique, totally ordered name of a simulated node.
///
/// An identifier is assigned once when the population is created and survives
/// churn: a node that is stopped and rejoins gets a fresh instance under the same
/// identifier, without any of the previous instance's state.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Identifier(Ulid);

impl Identifier {
    /// Draws a new identifier from the simulation RNG, so equal seeds produce
    /// equal populations.
    pub fn random(rng: &SimulationRng) -> Self {
        let high = rng.gen_u64() as u128;
        let low = rng.gen_u64() as u128;
        Self(Ulid::from((high << 64) | low))
    }

    pub fn as_u128(&self) -> u128 {
        self.0 .0
    }
}

impl From<u128> for Identifier {
    fn from(value: u128) -> Self {
        Self(Ulid::from(value))
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire envelope moved by every transport.
///
/// Requests are immutable once built; transports only ever serialize, move and
/// hand them over to the receiving network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    payload: Vec<u8>,
    origin: Identifier,
    destination: Identifier,
    sent_at: DateTime<Utc>,
}

impl Request {
    pub fn new(payload: Vec<u8>, origin: Identifier, destination: Identifier) -> Self {
        Self {
            payload,
            origin,
            destination,
            sent_at: Utc::now(),
        }
    }

    /// Encoded event bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn origin(&self) -> Identifier {
        self.origin
    }

    pub fn destination(&self) -> Identifier {
        self.destination
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }
}

/// Application defined payload exchanged between nodes.
///
/// Events are usually an enum over the protocol's message variants. The default
/// log line is the `Debug` rendering; protocols with large payloads should
/// override it with something shorter.
pub trait Event: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Approximate size of the event in bytes, used for packet size metrics
    /// before encoding.
    fn size_hint(&self) -> usize {
        std::mem::size_of_val(self)
    }

    fn log_line(&self) -> String {
        format!("{self:?}")
    }
}

impl Event for String {
    fn size_hint(&self) -> usize {
        self.len()
    }

    fn log_line(&self) -> String {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_follow_the_seed() {
        let first: Vec<_> = {
            let rng = SimulationRng::new(7);
            (0..10).map(|_| Identifier::random(&rng)).collect()
        };
        let second: Vec<_> = {
            let rng = SimulationRng::new(7);
            (0..10).map(|_| Identifier::random(&rng)).collect()
        };
        assert_eq!(first, second);

        let mut sorted = first.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 10, "identifiers must be unique");
    }

    #[test]
    fn identifiers_are_totally_ordered_by_value() {
        let low = Identifier::from(1u128);
        let high = Identifier::from(u128::MAX);
        assert!(low < high);
        assert_eq!(high.as_u128(), u128::MAX);
    }

    #[test]
    fn request_keeps_envelope_fields() {
        let origin = Identifier::from(1u128);
        let destination = Identifier::from(2u128);
        let request = Request::new(b"payload".to_vec(), origin, destination);
        assert_eq!(request.payload(), b"payload");
        assert_eq!(request.origin(), origin);
        assert_eq!(request.destination(), destination);
        assert!(request.sent_at() <= Utc::now());
    }
}
