//! Snowflake identifiers.
//!
//! 64-bit ids: 41 bits of milliseconds since the custom epoch, 10 bits of
//! node id, 12 bits of per-millisecond sequence. Numeric order therefore
//! implies approximate temporal order. On the wire ids are base-10 strings
//! (64-bit integers overflow JSON-consuming JavaScript clients), but the
//! deserializer also accepts bare integers.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Custom epoch, milliseconds: 2010-11-04T01:42:54.657Z.
const EPOCH_MS: u64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const STEP_BITS: u32 = 12;
const TIME_SHIFT: u32 = NODE_BITS + STEP_BITS;

/// Highest permitted node id (inclusive).
pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;

const STEP_MASK: u64 = (1 << STEP_BITS) - 1;

// ---------------------------------------------------------------------------
// SnowflakeId
// ---------------------------------------------------------------------------

/// A snowflake id. Zero is the "unset" value and never a valid id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnowflakeId(pub u64);

/// Error returned when a string is not a valid snowflake id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid snowflake id")]
pub struct InvalidSnowflakeId;

impl SnowflakeId {
    /// The millisecond Unix timestamp embedded in this id.
    pub fn timestamp_millis(self) -> u64 {
        (self.0 >> TIME_SHIFT) + EPOCH_MS
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for SnowflakeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SnowflakeId {
    type Err = InvalidSnowflakeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.parse::<u64>().map_err(|_| InvalidSnowflakeId)?;
        if raw == 0 {
            return Err(InvalidSnowflakeId);
        }
        Ok(SnowflakeId(raw))
    }
}

impl From<u64> for SnowflakeId {
    fn from(raw: u64) -> Self {
        SnowflakeId(raw)
    }
}

impl Serialize for SnowflakeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SnowflakeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = SnowflakeId;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a snowflake id as a base-10 string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let raw = v.parse::<u64>().map_err(de::Error::custom)?;
                Ok(SnowflakeId(raw))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(SnowflakeId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v).map(SnowflakeId).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Error returned for a node id outside `0..=MAX_NODE_ID`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("snowflake node id {0} out of range 0..={MAX_NODE_ID}")]
pub struct NodeIdOutOfRange(pub u16);

struct GeneratorState {
    last_millis: u64,
    step: u64,
}

/// A snowflake generator bound to one node id.
///
/// Cheap to clone; clones share the sequence state so ids stay unique
/// within the process. No global instance: construct once in `main` and
/// thread the handle through.
#[derive(Clone)]
pub struct SnowflakeGenerator {
    node: u64,
    state: Arc<Mutex<GeneratorState>>,
}

impl SnowflakeGenerator {
    pub fn new(node_id: u16) -> Result<Self, NodeIdOutOfRange> {
        if node_id > MAX_NODE_ID {
            return Err(NodeIdOutOfRange(node_id));
        }
        Ok(SnowflakeGenerator {
            node: u64::from(node_id) << STEP_BITS,
            state: Arc::new(Mutex::new(GeneratorState { last_millis: 0, step: 0 })),
        })
    }

    /// Mint the next id. Spins into the next millisecond if the 4096-per-ms
    /// sequence is exhausted.
    pub fn generate(&self) -> SnowflakeId {
        let mut state = self.state.lock().expect("snowflake state poisoned");
        let mut now = now_millis();
        if now == state.last_millis {
            state.step = (state.step + 1) & STEP_MASK;
            if state.step == 0 {
                while now <= state.last_millis {
                    now = now_millis();
                }
            }
        } else {
            state.step = 0;
        }
        state.last_millis = now;
        SnowflakeId(((now - EPOCH_MS) << TIME_SHIFT) | self.node | state.step)
    }
}

impl std::fmt::Debug for SnowflakeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeGenerator")
            .field("node", &(self.node >> STEP_BITS))
            .finish_non_exhaustive()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_monotonic() {
        let generator = SnowflakeGenerator::new(1).expect("node id in range");
        let mut previous = generator.generate();
        for _ in 0..10_000 {
            let id = generator.generate();
            assert!(id > previous, "ids must be strictly increasing");
            previous = id;
        }
    }

    #[test]
    fn generated_ids_embed_a_current_timestamp() {
        let generator = SnowflakeGenerator::new(42).expect("node id in range");
        let before = now_millis();
        let id = generator.generate();
        let after = now_millis();
        assert!(id.timestamp_millis() >= before);
        assert!(id.timestamp_millis() <= after);
    }

    #[test]
    fn node_id_is_range_checked() {
        assert!(SnowflakeGenerator::new(MAX_NODE_ID).is_ok());
        assert_eq!(
            SnowflakeGenerator::new(MAX_NODE_ID + 1).err(),
            Some(NodeIdOutOfRange(MAX_NODE_ID + 1))
        );
    }

    #[test]
    fn id_parses_from_string_and_rejects_zero_and_junk() {
        let id: SnowflakeId = "175928847299117063".parse().expect("valid id");
        assert_eq!(id.to_string(), "175928847299117063");
        assert!("0".parse::<SnowflakeId>().is_err());
        assert!("".parse::<SnowflakeId>().is_err());
        assert!("not-a-number".parse::<SnowflakeId>().is_err());
        assert!("-5".parse::<SnowflakeId>().is_err());
    }

    #[test]
    fn id_serializes_as_string_but_deserializes_from_both_forms() {
        let id = SnowflakeId(175_928_847_299_117_063);
        assert_eq!(
            serde_json::to_string(&id).expect("serialize id"),
            r#""175928847299117063""#
        );
        let from_string: SnowflakeId =
            serde_json::from_str(r#""175928847299117063""#).expect("string form");
        let from_number: SnowflakeId =
            serde_json::from_str("175928847299117063").expect("integer form");
        assert_eq!(from_string, id);
        assert_eq!(from_number, id);
    }
}
