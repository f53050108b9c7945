use std::sync::Mutex;

use ulid::{Generator, Ulid};

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = parlor_common::id::prefixed_ulid("con");
/// assert!(id.starts_with("con_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const CONNECTION: &str = "con";
}

/// Monotonic message-id generator.
///
/// Ids are bare 26-character ULIDs: lexicographic order equals generation
/// order, and the embedded millisecond timestamp is recoverable with
/// [`timestamp_ms`]. Within a single millisecond the underlying generator
/// increments the random component, so two ids minted back-to-back still
/// compare in mint order.
pub struct MessageIdGenerator {
    state: Mutex<Generator>,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Generator::new()),
        }
    }

    pub fn generate(&self) -> Ulid {
        let mut gen = self.state.lock().unwrap();
        loop {
            match gen.generate() {
                Ok(id) => return id,
                // Random component exhausted within this millisecond — spin
                // until the clock advances.
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Generate an id and return it with its embedded wall-clock timestamp.
    pub fn generate_with_ts(&self) -> (String, i64) {
        let id = self.generate();
        (id.to_string(), id.timestamp_ms() as i64)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the creation timestamp (ms since Unix epoch) from a ULID string.
pub fn timestamp_ms(id: &str) -> Option<i64> {
    Ulid::from_string(id).ok().map(|u| u.timestamp_ms() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn prefixed_ulid_format() {
        let id = prefixed_ulid("con");
        assert!(id.starts_with("con_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 4 + 26);
    }

    #[test]
    fn generates_unique_ids() {
        let gen = MessageIdGenerator::new();
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let id = gen.generate().to_string();
            assert!(ids.insert(id.clone()), "duplicate ulid: {id}");
        }
    }

    #[test]
    fn ids_are_monotonically_increasing() {
        let gen = MessageIdGenerator::new();
        let mut prev = String::new();
        for _ in 0..1_000 {
            let id = gen.generate().to_string();
            assert!(id > prev, "not monotonic: {prev} >= {id}");
            prev = id;
        }
    }

    #[test]
    fn id_order_agrees_with_timestamp_order() {
        let gen = MessageIdGenerator::new();
        let (a, a_ts) = gen.generate_with_ts();
        let (b, b_ts) = gen.generate_with_ts();
        assert!(a < b);
        assert!(a_ts <= b_ts);
    }

    #[test]
    fn timestamp_extraction_round_trips() {
        let gen = MessageIdGenerator::new();
        let (id, ts) = gen.generate_with_ts();
        assert_eq!(timestamp_ms(&id), Some(ts));
    }
}
