use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failing, reject all requests
    HalfOpen, // Testing if the provider recovered
}

/// Circuit breaker configuration for the cloud-provider API.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before probing again.
    pub cooldown: Duration,
    /// Successful probes required to close from half-open.
    pub success_threshold: u32,
    /// Failures older than this no longer count toward the threshold.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            success_threshold: 2,
            failure_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    last_failure: Option<Instant>,
    last_state_change: Instant,
}

/// Protects the provider API from hammering a failing upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                last_failure: None,
                last_state_change: Instant::now(),
            }),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    /// Whether a request may proceed right now.
    pub async fn should_allow_request(&self) -> bool {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let state = self.inner.read().await.state;
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let mut inner = self.inner.write().await;
                if inner.state == CircuitState::Open
                    && inner.last_state_change.elapsed() >= self.config.cooldown
                {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_state_change = Instant::now();
                    self.success_count.store(0, Ordering::Relaxed);
                    self.failure_count.store(0, Ordering::Relaxed);
                    info!("Provider circuit breaker transitioned to half-open");
                    true
                } else {
                    inner.state != CircuitState::Open
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    "Provider circuit breaker success count: {}/{}",
                    count, self.config.success_threshold
                );
                if count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.last_state_change = Instant::now();
                    self.failure_count.store(0, Ordering::Relaxed);
                    self.success_count.store(0, Ordering::Relaxed);
                    info!("Provider circuit breaker closed, provider recovered");
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::Open => {
                warn!("Success recorded while provider circuit is open");
            }
        }
    }

    pub async fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write().await;
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                let within_window = inner
                    .last_failure
                    .map(|last| now.duration_since(last) <= self.config.failure_window)
                    .unwrap_or(false);
                let count = if within_window {
                    self.failure_count.fetch_add(1, Ordering::Relaxed) + 1
                } else {
                    self.failure_count.store(1, Ordering::Relaxed);
                    1
                };
                inner.last_failure = Some(now);

                if count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_state_change = now;
                    self.success_count.store(0, Ordering::Relaxed);
                    warn!(
                        "Provider circuit breaker opened. Total requests: {}, total failures: {}",
                        self.total_requests.load(Ordering::Relaxed),
                        self.total_failures.load(Ordering::Relaxed)
                    );
                }
            }
            CircuitState::HalfOpen => {
                // A single failed probe re-opens the circuit
                inner.state = CircuitState::Open;
                inner.last_state_change = now;
                inner.last_failure = Some(now);
                self.success_count.store(0, Ordering::Relaxed);
                warn!("Provider circuit breaker re-opened from half-open");
            }
            CircuitState::Open => {
                inner.last_failure = Some(now);
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_millis(50),
            success_threshold: 1,
            failure_window: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(tight_config());

        assert!(breaker.should_allow_request().await);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.should_allow_request().await);
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(tight_config());
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.should_allow_request().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(tight_config());
        breaker.record_failure().await;
        breaker.record_failure().await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.should_allow_request().await);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_closed_failure_count() {
        let breaker = CircuitBreaker::new(tight_config());
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        // Count restarted after the success, so still closed
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }
}
