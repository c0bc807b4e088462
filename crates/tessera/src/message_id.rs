use crate::types::MessageId;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2025-01-01T00:00:00Z in milliseconds since Unix epoch.
const CUSTOM_EPOCH_MS: i64 = 1_735_689_600_000;

const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Lock-free generator of strictly increasing message ids.
///
/// Layout: upper 51 bits = milliseconds since the custom epoch, lower 12 bits =
/// sequence within the millisecond. When the clock stalls or steps backward the
/// generator keeps counting from the last issued value, so ids never repeat and
/// never go down for the lifetime of the generator. Receivers rely on that to
/// advance their per-sender high-water mark.
pub struct MessageIdGenerator {
    last: AtomicI64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    /// Resume after a restart: ids issued afterwards are greater than `floor`.
    pub fn starting_after(floor: MessageId) -> Self {
        Self {
            last: AtomicI64::new(floor.0),
        }
    }

    fn clock_floor() -> i64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(CUSTOM_EPOCH_MS);
        (now_ms - CUSTOM_EPOCH_MS).max(0) << SEQUENCE_BITS
    }

    pub fn next(&self) -> MessageId {
        loop {
            let current = self.last.load(Ordering::Acquire);
            let candidate = Self::clock_floor().max(current + 1);
            if self
                .last
                .compare_exchange(current, candidate, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return MessageId(candidate);
            }
        }
    }

    /// Milliseconds since the Unix epoch encoded in an id from this generator.
    pub fn timestamp_ms(id: MessageId) -> i64 {
        (id.0 >> SEQUENCE_BITS) + CUSTOM_EPOCH_MS
    }

    /// Sequence bits of an id; non-zero when several ids share a millisecond.
    pub fn sequence(id: MessageId) -> i64 {
        id.0 & SEQUENCE_MASK
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
