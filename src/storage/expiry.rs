//! Key Expiration
//!
//! Keys with a TTL are removed in two ways:
//!
//! 1. **Passive**: every read or write path checks the key it is about to
//!    touch and evicts it first if its instant has passed.
//! 2. **Active**: before each command is dispatched, a sampling cycle may run.
//!    With a small probability it picks random keys that carry an expiry and
//!    evicts the expired ones. While a large share of the sample turns out to
//!    be expired it samples again, up to a fixed number of rounds.
//!
//! The active cycle keeps memory from filling up with keys nobody reads again,
//! while bounding the work any single command pays for it.

use crate::storage::engine::{Keyspace, StorageEngine};
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Tuning for the active expiry cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiryConfig {
    /// Chance that an incoming command triggers a cycle (default: 0.10)
    pub trigger_probability: f64,

    /// Keys sampled per round (default: 10)
    pub sample_size: usize,

    /// Sample again while more than this fraction was expired (default: 0.25)
    pub continue_threshold: f64,

    /// Upper bound on rounds per cycle (default: 20)
    pub max_rounds: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            trigger_probability: 0.10,
            sample_size: 10,
            continue_threshold: 0.25,
            max_rounds: 20,
        }
    }
}

/// What one active cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireCycleStats {
    pub rounds: usize,
    pub sampled: usize,
    pub evicted: usize,
}

impl Keyspace {
    /// True iff the key has an expiry and `now` is past it.
    pub(crate) fn is_expired(&self, key: &[u8], now: i64) -> bool {
        self.expires.get(key).is_some_and(|&at| now > at)
    }

    /// Removes the key's value and expiry together.
    pub(crate) fn evict(&mut self, key: &[u8]) {
        self.entries.remove(key);
        if self.expires.remove(key).is_some() {
            self.expired_total += 1;
        }
    }

    /// Evicts the key if it is expired. Returns true if it was.
    pub(crate) fn expire_if_needed(&mut self, key: &[u8], now: i64) -> bool {
        if self.is_expired(key, now) {
            self.evict(key);
            true
        } else {
            false
        }
    }

    /// Runs sampling rounds until the expired share drops or the round cap is hit.
    fn sample_and_evict<R: Rng + ?Sized>(
        &mut self,
        config: &ExpiryConfig,
        now: i64,
        rng: &mut R,
    ) -> ExpireCycleStats {
        let mut stats = ExpireCycleStats::default();

        while stats.rounds < config.max_rounds {
            let mut candidates: Vec<_> = self.expires.keys().cloned().collect();
            if candidates.is_empty() || config.sample_size == 0 {
                break;
            }
            stats.rounds += 1;

            candidates.shuffle(rng);
            candidates.truncate(config.sample_size);

            let sampled = candidates.len();
            let mut evicted = 0;
            for key in &candidates {
                if self.expire_if_needed(key, now) {
                    evicted += 1;
                }
            }

            stats.sampled += sampled;
            stats.evicted += evicted;

            if (evicted as f64 / sampled as f64) <= config.continue_threshold {
                break;
            }
        }

        stats
    }
}

impl StorageEngine {
    /// Rolls the trigger probability and, if it hits, runs an active cycle.
    ///
    /// Called once per incoming command before dispatch. A probability that is
    /// not a finite number never triggers.
    pub fn maybe_expire_cycle(&self, config: &ExpiryConfig) -> Option<ExpireCycleStats> {
        let probability = if config.trigger_probability.is_finite() {
            config.trigger_probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut rng = rand::thread_rng();
        if !rng.gen_bool(probability) {
            return None;
        }
        Some(self.run_expire_cycle(config, &mut rng))
    }

    /// Runs one active cycle unconditionally, holding the lock for its whole duration.
    pub fn expire_cycle(&self, config: &ExpiryConfig) -> ExpireCycleStats {
        self.run_expire_cycle(config, &mut rand::thread_rng())
    }

    fn run_expire_cycle<R: Rng + ?Sized>(
        &self,
        config: &ExpiryConfig,
        rng: &mut R,
    ) -> ExpireCycleStats {
        let stats = self.lock().sample_and_evict(config, now_ms(), rng);
        if stats.evicted > 0 {
            debug!(
                rounds = stats.rounds,
                sampled = stats.sampled,
                evicted = stats.evicted,
                "Active expiry evicted keys"
            );
        }
        stats
    }
}
