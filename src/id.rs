use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of request ids. Each client owns one, so ids never collide across
/// clients living in the same process.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// `{prefix}-{n}` with a random per-instance prefix, like the server expects.
pub struct CounterIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl CounterIdGenerator {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        Self::with_prefix(format!("{}.{}", rng.next_u32() % 65536, rng.next_u32() % 65536))
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(1),
        }
    }
}

impl Default for CounterIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for CounterIdGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

/// 16 random bytes, hex encoded.
#[derive(Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode_upper(bytes)
    }
}
