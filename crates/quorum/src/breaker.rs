//! Circuit breaker guarding calls into a failing dependency.
//!
//! State machine:
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN
//! OPEN   --(reset timeout elapsed)--> HALF_OPEN
//! HALF_OPEN --(successes >= recovery threshold)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! While OPEN, calls fail fast without invoking the wrapped operation.
//! Breakers are constructed explicitly and injected into their owner;
//! there is no shared global instance, so tests can build isolated ones.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker thresholds. All policy lives here, not in code.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing recovery.
    pub reset_timeout: Duration,
    /// Upper bound on any single wrapped call.
    pub call_timeout: Duration,
    /// Consecutive successes in HALF_OPEN required to close.
    pub recovery_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
            recovery_threshold: 3,
        }
    }
}

/// Breaker state, visible for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error from a breaker-gated call.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit breaker is open")]
    Open,

    /// The operation exceeded the call timeout. Counts as a failure.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself failed. Counts as a failure.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// A circuit breaker for one protected dependency.
///
/// Counters are behind a mutex because the tokio runtime is
/// multi-threaded; critical sections are synchronous and short, and the
/// lock is never held across an await point.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker for the named dependency.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails fast with [`BreakerError::Open`] while the circuit is open
    /// and the reset timeout has not elapsed. Otherwise the operation
    /// runs under the call timeout; success and failure feed the state
    /// machine.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.gate_allows() {
            return Err(BreakerError::Open);
        }

        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.on_failure();
                Err(BreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Gate check: reject while OPEN, transition to HALF_OPEN once the
    /// reset timeout has elapsed.
    fn gate_allows(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed < self.config.reset_timeout {
                return false;
            }
            info!("breaker '{}' probing recovery (half-open)", self.name);
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
        }
        true
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.recovery_threshold {
                info!("breaker '{}' recovered (closed)", self.name);
                inner.state = CircuitState::Closed;
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        let tripped = match inner.state {
            // Any failure while probing reopens the circuit.
            CircuitState::HalfOpen => true,
            _ => inner.failure_count >= self.config.failure_threshold,
        };
        if tripped && inner.state != CircuitState::Open {
            warn!(
                "breaker '{}' opened after {} consecutive failure(s)",
                self.name, inner.failure_count
            );
            inner.state = CircuitState::Open;
        }
    }
}

impl<E> From<BreakerError<E>> for crate::error::OrchestratorError
where
    E: Into<crate::error::OrchestratorError>,
{
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open => crate::error::OrchestratorError::CircuitOpen,
            BreakerError::Timeout(d) => {
                crate::error::OrchestratorError::Agent(crate::error::AcpError::Timeout(d))
            }
            BreakerError::Inner(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            recovery_threshold: 2,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(std::io::Error::other("boom")) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let result = breaker
            .execute(|| async { Ok::<_, std::io::Error>(()) })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", test_config());
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_invoking() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, std::io::Error>(()) }
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("test", test_config());
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        // 2 failures after the reset; threshold is 3.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_after_reset_timeout_and_recovers() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        // First probe passes through and succeeds -> HALF_OPEN.
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Second consecutive success meets the recovery threshold.
        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_while_half_open_reopens() {
        let breaker = CircuitBreaker::new("test", test_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_counts_as_failure() {
        let config = BreakerConfig {
            failure_threshold: 1,
            ..test_config()
        };
        let breaker = CircuitBreaker::new("test", config);

        let result = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, std::io::Error>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
