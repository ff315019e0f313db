//! Proposer configuration

use std::{future::Future, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for exponential backoff with jitter
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// No pause between attempts.
    #[must_use]
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Calculate backoff duration for a given retry count with jitter
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retries.cast_signed());
        let capped = base.min(self.max.as_secs_f64());
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        // 50% to 150% of the capped duration
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}

/// Sleep function trait, so tests can substitute their own clock
pub trait Sleep: Clone + Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Tokio-based sleep implementation
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleep;

impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Proposer configuration with RNG for jitter
pub struct ProposerConfig<S: Sleep = TokioSleep, R: Rng = StdRng> {
    /// Extra rounds attempted after the first one fails
    pub retry_limit: u32,
    /// How long one round (Prepare and Accept together) may take
    pub round_timeout: Duration,
    /// Backoff configuration for retries
    pub backoff: BackoffConfig,
    /// Sleep implementation, used for backoff and round timeouts
    pub sleep: S,
    /// RNG for jitter (seeded for deterministic tests)
    pub rng: R,
}

impl<S: Sleep, R: Rng> ProposerConfig<S, R> {
    /// Create a new proposer config with a custom RNG
    pub fn new(
        retry_limit: u32,
        round_timeout: Duration,
        backoff: BackoffConfig,
        sleep: S,
        rng: R,
    ) -> Self {
        Self {
            retry_limit,
            round_timeout,
            backoff,
            sleep,
            rng,
        }
    }
}

impl<S: Sleep> ProposerConfig<S, StdRng> {
    /// Create a proposer config with a seeded RNG for deterministic behavior
    #[must_use]
    pub fn with_seed(
        retry_limit: u32,
        round_timeout: Duration,
        backoff: BackoffConfig,
        sleep: S,
        seed: u64,
    ) -> Self {
        Self::new(
            retry_limit,
            round_timeout,
            backoff,
            sleep,
            StdRng::seed_from_u64(seed),
        )
    }
}

impl ProposerConfig<TokioSleep, StdRng> {
    /// Tokio sleep, default backoff and an OS-seeded RNG.
    #[must_use]
    pub fn with_limits(retry_limit: u32, round_timeout: Duration) -> Self {
        Self::new(
            retry_limit,
            round_timeout,
            BackoffConfig::default(),
            TokioSleep,
            StdRng::from_os_rng(),
        )
    }
}

impl Default for ProposerConfig<TokioSleep, StdRng> {
    fn default() -> Self {
        Self::with_limits(5, Duration::from_millis(500))
    }
}
