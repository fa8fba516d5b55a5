//! Process-wide per-platform circuit breakers.
//!
//! A breaker counts consecutive failures per name. At the threshold, calls
//! fail fast with `CIRCUIT_OPEN` until the cooldown elapses; the first call
//! after cooldown is let through, and a single success resets the counter.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use bayline_types::SourceError;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub fail_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 3,
            cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// One registry for the whole process; outlives any run.
pub struct CircuitBreakers {
    config: BreakerConfig,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Fails fast with `CIRCUIT_OPEN` while the breaker for `name` is open.
    /// After cooldown the call is admitted as a half-open probe.
    pub fn check(&self, name: &str) -> Result<(), SourceError> {
        let mut states = self.states.lock();
        let state = states.entry(name.to_string()).or_default();
        if state.consecutive_failures < self.config.fail_threshold {
            return Ok(());
        }
        match state.opened_at {
            Some(opened) if opened.elapsed() < self.config.cooldown => {
                Err(SourceError::CircuitOpen {
                    platform: name.to_string(),
                })
            }
            _ => {
                // Half-open: admit one probe; a failure re-opens immediately.
                state.opened_at = Some(Instant::now());
                Ok(())
            }
        }
    }

    pub fn record_success(&self, name: &str) {
        let mut states = self.states.lock();
        let state = states.entry(name.to_string()).or_default();
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self, name: &str) {
        let mut states = self.states.lock();
        let state = states.entry(name.to_string()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures == self.config.fail_threshold {
            state.opened_at = Some(Instant::now());
            warn!(
                target: "bayline.breaker",
                platform = name,
                failures = state.consecutive_failures,
                "circuit opened"
            );
        }
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.check(name).is_err()
    }

    /// Runs `op` guarded by the breaker for `name`. Only failures that are
    /// the platform's fault count toward opening it.
    pub async fn call<T, F, Fut>(&self, name: &str, op: F) -> Result<T, SourceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        self.check(name)?;
        match op().await {
            Ok(value) => {
                self.record_success(name);
                Ok(value)
            }
            Err(err) => {
                if counts_against_breaker(&err) {
                    self.record_failure(name);
                }
                Err(err)
            }
        }
    }
}

fn counts_against_breaker(err: &SourceError) -> bool {
    matches!(
        err,
        SourceError::PlatformDown { .. }
            | SourceError::Timeout
            | SourceError::Network { .. }
            | SourceError::Transient5xx { .. }
            | SourceError::AuthFailed { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers(threshold: u32, cooldown: Duration) -> CircuitBreakers {
        CircuitBreakers::new(BreakerConfig {
            fail_threshold: threshold,
            cooldown,
        })
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let b = breakers(3, Duration::from_secs(60));
        for _ in 0..2 {
            b.record_failure("prodemand");
            assert!(b.check("prodemand").is_ok());
        }
        b.record_failure("prodemand");
        assert_eq!(
            b.check("prodemand").unwrap_err(),
            SourceError::CircuitOpen {
                platform: "prodemand".to_string()
            }
        );
    }

    #[test]
    fn success_resets_counter() {
        let b = breakers(3, Duration::from_secs(60));
        b.record_failure("partstech");
        b.record_failure("partstech");
        b.record_success("partstech");
        b.record_failure("partstech");
        assert!(b.check("partstech").is_ok());
    }

    #[test]
    fn cooldown_admits_half_open_probe() {
        let b = breakers(1, Duration::from_millis(0));
        b.record_failure("alldata");
        // Zero cooldown: the next check is the half-open probe.
        assert!(b.check("alldata").is_ok());
        b.record_success("alldata");
        assert!(b.check("alldata").is_ok());
    }

    #[tokio::test]
    async fn call_records_outcomes() {
        let b = breakers(1, Duration::from_secs(60));
        let _ = b
            .call("identifix", || async {
                Err::<(), _>(SourceError::platform_down("identifix"))
            })
            .await;
        assert!(b.is_open("identifix"));

        // NOT_FOUND is a data miss, not a platform fault.
        let b2 = breakers(1, Duration::from_secs(60));
        let _ = b2
            .call("identifix", || async { Err::<(), _>(SourceError::NotFound) })
            .await;
        assert!(!b2.is_open("identifix"));
    }
}
