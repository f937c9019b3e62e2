//! Probe code classification and retry budgets
//!
//! The gateway reports business failures through `errorCode`. Only three codes
//! are recoverable: an invalid token (refresh and try again) and two transient
//! codes (wait and try again with the same token). Everything else is final.

use std::time::Duration;

use fxiaoke_auth::{CODE_GATEWAY_TIMEOUT, CODE_INVALID_TOKEN, CODE_OK, CODE_PARAM_ILLEGAL};

/// How a probe response code should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Token accepted
    Ok,
    /// Token rejected as invalid or expired: invalidate and refresh
    InvalidToken,
    /// Gateway hiccup: back off and probe again with the same token
    Transient,
    /// Unrecognized business error: fail without retry
    Terminal,
}

impl ProbeVerdict {
    /// Label for metrics and logs.
    pub fn label(self) -> &'static str {
        match self {
            ProbeVerdict::Ok => "ok",
            ProbeVerdict::InvalidToken => "invalid_token",
            ProbeVerdict::Transient => "transient",
            ProbeVerdict::Terminal => "terminal",
        }
    }
}

/// Classify a gateway `errorCode`.
pub fn classify_code(code: i64) -> ProbeVerdict {
    match code {
        CODE_OK => ProbeVerdict::Ok,
        CODE_INVALID_TOKEN => ProbeVerdict::InvalidToken,
        CODE_PARAM_ILLEGAL | CODE_GATEWAY_TIMEOUT => ProbeVerdict::Transient,
        _ => ProbeVerdict::Terminal,
    }
}

/// Bounds for the probe-and-recover loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Invalidate-and-refresh cycles allowed before giving up
    pub max_invalidations: u32,
    /// Probes answered with a transient code allowed before giving up
    pub max_attempts: u32,
    /// First backoff wait
    pub base_delay: Duration,
    /// Ceiling for any single wait
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_invalidations: 3,
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before the `n`-th retry (1-based): `base * 2^(n-1)`, capped at `max_delay`.
    pub fn delay_for(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
