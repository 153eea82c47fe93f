//! Name tags for replacement instances.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

/// Produces the `Name` tag of each launched replacement.
pub trait NameGenerator: Send + Sync {
    fn next_name(&self) -> String;
}

/// `<prefix>-NNNNN` with a random five-digit suffix. Uniqueness is not
/// guaranteed.
#[derive(Debug, Clone)]
pub struct RandomNames {
    prefix: String,
}

impl RandomNames {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl NameGenerator for RandomNames {
    fn next_name(&self) -> String {
        let suffix: u32 = rand::rng().random_range(10000..=99999);
        format!("{}-{suffix}", self.prefix)
    }
}

/// Deterministic names counting up from 10000.
#[derive(Debug)]
pub struct SequentialNames {
    prefix: String,
    next: AtomicU32,
}

impl SequentialNames {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: AtomicU32::new(10000),
        }
    }
}

impl NameGenerator for SequentialNames {
    fn next_name(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}
