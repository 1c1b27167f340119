use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::level::Level;
use crate::value::FieldMap;

/// Derives the sampling key for [`Sampling::ConsistentKey`].
pub type SamplingKeyFn = Arc<dyn Fn(Level, &str, &FieldMap) -> String + Send + Sync>;

/// Whether a record is kept, decided before filters run.
#[derive(Clone)]
pub enum Sampling {
    /// Pass everything.
    None,
    /// Bernoulli with probability `p` in `[0, 1]`.
    Rate(f64),
    /// Keep records whose hashed key falls below `p * 2^32`; the same key
    /// is always decided the same way.
    ConsistentKey { key: SamplingKeyFn, rate: f64 },
}

impl std::fmt::Debug for Sampling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Rate(p) => write!(f, "Rate({})", p),
            Self::ConsistentKey { rate, .. } => write!(f, "ConsistentKey(rate: {})", rate),
        }
    }
}

/// xorshift64* state; good enough for sampling, cheap enough for hot paths.
#[derive(Debug)]
struct XorShift64 {
    state: AtomicU64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed | 1),
        }
    }

    fn next(&self) -> u64 {
        let mut x = self.state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state.store(x, Ordering::Relaxed);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Uniform draw in [0, 1).
    fn next_f64(&self) -> f64 {
        (self.next() >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[derive(Debug)]
pub(crate) struct Sampler {
    strategy: Sampling,
    rng: XorShift64,
}

impl Sampler {
    pub fn new(strategy: Sampling, seed: u64) -> Self {
        Self {
            strategy,
            rng: XorShift64::new(seed),
        }
    }

    pub fn set_strategy(&mut self, strategy: Sampling) {
        self.strategy = strategy;
    }

    pub fn keep(&self, level: Level, message: &str, fields: &FieldMap) -> bool {
        match &self.strategy {
            Sampling::None => true,
            Sampling::Rate(p) => {
                if *p >= 1.0 {
                    true
                } else if *p <= 0.0 {
                    false
                } else {
                    self.rng.next_f64() < *p
                }
            }
            Sampling::ConsistentKey { key, rate } => {
                if *rate >= 1.0 {
                    return true;
                }
                if *rate <= 0.0 {
                    return false;
                }
                let mut hasher = DefaultHasher::new();
                key(level, message, fields).hash(&mut hasher);
                let bucket = hasher.finish() % (1u64 << 32);
                (bucket as f64) < rate * (1u64 << 32) as f64
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FieldMap;

    #[test]
    fn none_keeps_all() {
        let s = Sampler::new(Sampling::None, 42);
        for _ in 0..100 {
            assert!(s.keep(Level::Info, "m", &FieldMap::new()));
        }
    }

    #[test]
    fn rate_extremes() {
        let all = Sampler::new(Sampling::Rate(1.0), 42);
        let none = Sampler::new(Sampling::Rate(0.0), 42);
        for _ in 0..100 {
            assert!(all.keep(Level::Info, "m", &FieldMap::new()));
            assert!(!none.keep(Level::Info, "m", &FieldMap::new()));
        }
    }

    #[test]
    fn rate_is_roughly_proportional() {
        let s = Sampler::new(Sampling::Rate(0.25), 7);
        let kept = (0..10_000)
            .filter(|_| s.keep(Level::Info, "m", &FieldMap::new()))
            .count();
        assert!(kept > 2_000 && kept < 3_000, "kept = {}", kept);
    }

    #[test]
    fn consistent_key_is_deterministic() {
        let s = Sampler::new(
            Sampling::ConsistentKey {
                key: Arc::new(|_, message, _| message.to_string()),
                rate: 0.5,
            },
            42,
        );
        let f = FieldMap::new();
        let first = s.keep(Level::Info, "request-123", &f);
        for _ in 0..50 {
            assert_eq!(s.keep(Level::Info, "request-123", &f), first);
        }
    }

    #[test]
    fn consistent_key_splits_keyspace() {
        let s = Sampler::new(
            Sampling::ConsistentKey {
                key: Arc::new(|_, message, _| message.to_string()),
                rate: 0.5,
            },
            42,
        );
        let f = FieldMap::new();
        let kept = (0..1_000)
            .filter(|i| s.keep(Level::Info, &format!("key-{}", i), &f))
            .count();
        assert!(kept > 350 && kept < 650, "kept = {}", kept);
    }
}
