//! Agent configuration.

use std::time::Duration;

use outpost_proto::EdgeKey;
use rand::RngExt;

/// Configuration for an edge agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Decoded edge key: relay address and endpoint identity.
    pub edge_key: EdgeKey,

    /// Identity of this agent host. The relay binds it to the endpoint on
    /// the first check-in and refuses other identities afterwards.
    pub edge_id: String,

    /// Local address proxied streams are forwarded to (e.g. the Docker API).
    pub target_addr: String,

    /// Check-in interval used until the relay sends one.
    pub default_checkin_interval: Duration,

    /// Ping interval on an open tunnel.
    pub heartbeat_interval: Duration,

    /// Limit for connecting to the relay and reading its first reply.
    pub request_timeout: Duration,

    /// Backoff applied when check-ins fail.
    pub reconnect: ReconnectPolicy,
}

impl AgentConfig {
    /// Create a config with required fields and defaults.
    pub fn new(
        edge_key: EdgeKey,
        edge_id: impl Into<String>,
        target_addr: impl Into<String>,
    ) -> Self {
        Self {
            edge_key,
            edge_id: edge_id.into(),
            target_addr: target_addr.into(),
            default_checkin_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Backoff between failed check-ins: doubling from `base_delay` up to
/// `max_delay`, with part of each delay randomised.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that may be shaved off at random (0.0 to 1.0).
    pub jitter: f64,
    /// Consecutive failures tolerated before `run` returns; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay after failure number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay actually slept: [`Self::delay_for_attempt`] minus up to `jitter` of it.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return delay;
        }
        delay.mul_f64(1.0 - rand::rng().random_range(0.0..=jitter))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}
