//! Time-ordered unique identifiers (version-1 UUIDs).
//!
//! Queue fairness depends on identifier order matching arrival order, so the
//! generator never hands out the same or an earlier timestamp twice, even when
//! the wall clock has not advanced between calls.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use uuid::{Timestamp, Uuid};

use crate::error_handling::ClusterError;

/// 100ns intervals between 1582-10-15 (the UUID epoch) and 1970-01-01.
const GREGORIAN_OFFSET: u64 = 0x01B2_1DD2_1381_4000;

/// A version-1 UUID, ordered by its embedded timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeUuid(Uuid);

impl TimeUuid {
    /// Wraps a UUID if it is version 1.
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        (uuid.get_version_num() == 1).then_some(TimeUuid(uuid))
    }

    fn from_parts(ticks: u64, clock_seq: u16, node: [u8; 6]) -> Self {
        TimeUuid(Uuid::new_v1(
            Timestamp::from_gregorian_time(ticks, clock_seq),
            &node,
        ))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// 60-bit count of 100ns intervals since the UUID epoch.
    pub fn ticks(&self) -> u64 {
        self.0
            .get_timestamp()
            .map_or(0, |timestamp| timestamp.to_gregorian().0)
    }

    fn clock_seq(&self) -> u16 {
        self.0
            .get_timestamp()
            .map_or(0, |timestamp| timestamp.to_gregorian().1)
    }

    fn node(&self) -> [u8; 6] {
        self.0.get_node_id().unwrap_or_default()
    }

    /// Generation time in milliseconds since the Unix epoch.
    pub fn unix_millis(&self) -> i64 {
        (self.ticks().saturating_sub(GREGORIAN_OFFSET) / 10_000) as i64
    }

    /// Byte form whose lexicographic order equals identifier order.
    ///
    /// The timestamp goes first (big-endian), followed by the clock sequence and node.
    pub fn to_sortable_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.ticks().to_be_bytes());
        out[8..10].copy_from_slice(&self.clock_seq().to_be_bytes());
        out[10..16].copy_from_slice(&self.node());
        out
    }

    /// Inverse of [`TimeUuid::to_sortable_bytes`].
    pub fn from_sortable_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; 16] = bytes.try_into().ok()?;
        let (ticks, rest) = bytes.split_at(8);
        let (clock_seq, node) = rest.split_at(2);
        let ticks = u64::from_be_bytes(ticks.try_into().ok()?);
        let clock_seq = u16::from_be_bytes(clock_seq.try_into().ok()?);
        let node: [u8; 6] = node.try_into().ok()?;
        let rebuilt = Self::from_parts(ticks, clock_seq, node);
        // Timestamps wider than 60 bits or clock sequences wider than 14 do not survive.
        (rebuilt.to_sortable_bytes() == *bytes).then_some(rebuilt)
    }
}

impl Ord for TimeUuid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ticks()
            .cmp(&other.ticks())
            .then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl PartialOrd for TimeUuid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TimeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for TimeUuid {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| ClusterError::Decoding(format!("invalid timeuuid `{s}`: {e}")))?;
        TimeUuid::from_uuid(uuid)
            .ok_or_else(|| ClusterError::Decoding(format!("`{s}` is not a version-1 UUID")))
    }
}

/// Generates strictly increasing [`TimeUuid`]s.
///
/// Clock sequence and node id are random per generator (the node id has the
/// multicast bit set, marking it as not derived from a MAC address).
#[derive(Debug)]
pub struct TimeUuidGenerator {
    last_ticks: Mutex<u64>,
    clock_seq: u16,
    node: [u8; 6],
}

impl TimeUuidGenerator {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let mut node = [0u8; 6];
        rng.fill(&mut node);
        node[0] |= 0x01;
        Self {
            last_ticks: Mutex::new(0),
            clock_seq: rng.random::<u16>() & 0x3FFF,
            node,
        }
    }

    /// Process-wide generator shared by every queue instance, so pushes from
    /// different instances in one process are ordered too.
    pub fn shared() -> &'static TimeUuidGenerator {
        static GENERATOR: OnceLock<TimeUuidGenerator> = OnceLock::new();
        GENERATOR.get_or_init(TimeUuidGenerator::new)
    }

    pub fn now(&self) -> TimeUuid {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_nanos() / 100) as u64)
            .unwrap_or(0)
            + GREGORIAN_OFFSET;

        let mut last = self
            .last_ticks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ticks = if now > *last { now } else { *last + 1 };
        *last = ticks;
        TimeUuid::from_parts(ticks, self.clock_seq, self.node)
    }
}

impl Default for TimeUuidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_version_one() {
        let id = TimeUuidGenerator::new().now();
        assert_eq!(id.as_uuid().get_version_num(), 1);
    }

    #[test]
    fn test_generated_ids_strictly_increase() {
        let generator = TimeUuidGenerator::new();
        let ids: Vec<TimeUuid> = (0..1000).map(|_| generator.now()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_unix_millis_is_close_to_now() {
        let id = TimeUuidGenerator::new().now();
        let now = chrono::Utc::now().timestamp_millis();
        assert!((now - id.unix_millis()).abs() < 5_000);
    }

    #[test]
    fn test_sortable_bytes_round_trip_and_order() {
        let generator = TimeUuidGenerator::new();
        let a = generator.now();
        let b = generator.now();
        assert_eq!(TimeUuid::from_sortable_bytes(&a.to_sortable_bytes()), Some(a));
        assert!(a.to_sortable_bytes() < b.to_sortable_bytes());
    }

    #[test]
    fn test_from_sortable_bytes_rejects_wrong_length() {
        assert_eq!(TimeUuid::from_sortable_bytes(&[0u8; 15]), None);
    }

    #[test]
    fn test_parse_rejects_non_v1() {
        let v4 = "936da01f-9abd-4d9d-80c7-02af85c822a8";
        assert!(v4.parse::<TimeUuid>().is_err());

        let id = TimeUuidGenerator::new().now();
        assert_eq!(id.to_string().parse::<TimeUuid>().unwrap(), id);
    }
}
