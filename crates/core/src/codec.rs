//! Event encoding contract used by the middle layer.
//!
//! The network only depends on [`Codec`]: `encode` must be deterministic for
//! equal events and `decode` must be its left inverse. Malformed input, or bytes
//! produced for a different event type, fail with [`CodecError::Decode`] instead
//! of yielding a wrong event.

use std::marker::PhantomData;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::message::Event;

const MAGIC: [u8; 4] = *b"NBE1";
const CHECKSUM_LEN: usize = 8;
const HEADER_LEN: usize = MAGIC.len() + CHECKSUM_LEN;
/// Upper bound for a single decoded event, guards against garbage length prefixes.
const MAX_EVENT_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode event: {0}")]
    Encode(String),
    #[error("failed to decode event: {0}")]
    Decode(String),
}

pub trait Codec<E>: Send + Sync + 'static {
    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<E, CodecError>;
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_EVENT_SIZE)
        .reject_trailing_bytes()
}

fn type_tag<E>() -> &'static str {
    std::any::type_name::<E>()
}

fn checksum<E>(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(type_tag::<E>().as_bytes());
    hasher.update(body);
    let mut out = [0; CHECKSUM_LEN];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..CHECKSUM_LEN]);
    out
}

/// Compact binary codec, the default for every transport.
///
/// Frame layout: `MAGIC | blake3(type name, body)[..8] | bincode body`.
pub struct BincodeCodec<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E> BincodeCodec<E> {
    pub fn new() -> Self {
        Self {
            _event: PhantomData,
        }
    }
}

impl<E> Default for BincodeCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Codec<E> for BincodeCodec<E> {
    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        let body = bincode_options()
            .serialize(event)
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&MAGIC);
        frame.extend_from_slice(&checksum::<E>(&body));
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn decode(&self, bytes: &[u8]) -> Result<E, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Decode(format!(
                "frame too short, size: {}, min size: {HEADER_LEN}",
                bytes.len()
            )));
        }
        let (magic, rest) = bytes.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(CodecError::Decode("bad frame magic".into()));
        }
        let (sum, body) = rest.split_at(CHECKSUM_LEN);
        if sum != checksum::<E>(body) {
            return Err(CodecError::Decode(format!(
                "checksum mismatch, payload corrupted or not a `{}`",
                type_tag::<E>()
            )));
        }
        bincode_options()
            .deserialize(body)
            .map_err(|err| CodecError::Decode(err.to_string()))
    }
}

/// Human readable codec, handy when inspecting traffic.
pub struct JsonCodec<E> {
    _event: PhantomData<fn() -> E>,
}

impl<E> JsonCodec<E> {
    pub fn new() -> Self {
        Self {
            _event: PhantomData,
        }
    }
}

impl<E> Default for JsonCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct TaggedRef<'a, E> {
    r#type: &'a str,
    event: &'a E,
}

#[derive(Deserialize)]
struct Tagged<E> {
    r#type: String,
    event: E,
}

impl<E: Event> Codec<E> for JsonCodec<E> {
    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&TaggedRef {
            r#type: type_tag::<E>(),
            event,
        })
        .map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<E, CodecError> {
        let tagged: Tagged<E> =
            serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))?;
        if tagged.r#type != type_tag::<E>() {
            return Err(CodecError::Decode(format!(
                "expected a `{}`, got a `{}`",
                type_tag::<E>(),
                tagged.r#type
            )));
        }
        Ok(tagged.event)
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Vote {
        Propose { round: u64, value: String },
        Ack(u64),
        Abstain,
    }

    impl Event for Vote {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Heartbeat(u64);

    impl Event for Heartbeat {}

    fn samples() -> Vec<Vote> {
        vec![
            Vote::Propose {
                round: 3,
                value: "leader-7".into(),
            },
            Vote::Ack(u64::MAX),
            Vote::Abstain,
        ]
    }

    fn check_round_trip(codec: &dyn Codec<Vote>) {
        for vote in samples() {
            let bytes = codec.encode(&vote).unwrap();
            assert_eq!(bytes, codec.encode(&vote).unwrap(), "encode is deterministic");
            assert_eq!(codec.decode(&bytes).unwrap(), vote);
        }
    }

    fn check_garbage(codec: &dyn Codec<Vote>) {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(0xdeadbeef);
        for len in [0usize, 1, 5, 12, 64, 1024] {
            let garbage: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            assert!(matches!(codec.decode(&garbage), Err(CodecError::Decode(_))));
        }
    }

    #[test]
    fn bincode_round_trip() {
        check_round_trip(&BincodeCodec::new());
    }

    #[test]
    fn json_round_trip() {
        check_round_trip(&JsonCodec::new());
    }

    #[test]
    fn bincode_rejects_garbage() {
        check_garbage(&BincodeCodec::new());
    }

    #[test]
    fn json_rejects_garbage() {
        check_garbage(&JsonCodec::new());
    }

    #[test]
    fn bincode_rejects_corrupted_frame() {
        let codec = BincodeCodec::<Vote>::new();
        let mut bytes = codec.encode(&samples()[0]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(codec.decode(&bytes), Err(CodecError::Decode(_))));

        let mut trailing = codec.encode(&Vote::Abstain).unwrap();
        trailing.push(0);
        assert!(codec.decode(&trailing).is_err());
    }

    #[test]
    fn type_mismatch_is_a_decode_error() {
        let bytes = BincodeCodec::<Heartbeat>::new()
            .encode(&Heartbeat(1))
            .unwrap();
        assert!(matches!(
            BincodeCodec::<Vote>::new().decode(&bytes),
            Err(CodecError::Decode(_))
        ));

        let bytes = JsonCodec::<Heartbeat>::new().encode(&Heartbeat(1)).unwrap();
        assert!(matches!(
            JsonCodec::<Vote>::new().decode(&bytes),
            Err(CodecError::Decode(_))
        ));
    }
}
