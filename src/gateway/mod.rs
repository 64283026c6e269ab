//! External service gateway: timeout, retry, and circuit breaking around every call to the
//! object store, the embedding provider, and the vector store.

mod breaker;
mod retry;

pub use breaker::{
    BreakerSettings, BreakerSnapshot, BreakerState, CircuitBreaker, Clock, ManualClock, Permit,
    PermitKind, SystemClock,
};
pub use retry::RetryPolicy;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Breaker name for the object store dependency.
pub const OBJECT_STORE: &str = "object_store";
/// Breaker name for the embedding dependency.
pub const EMBEDDING: &str = "embedding";
/// Breaker name for the vector store dependency.
pub const VECTOR_STORE: &str = "vector_store";

/// Classification every adapter error provides to the gateway.
pub trait Retryable {
    /// Whether repeating the same call may succeed.
    fn is_retryable(&self) -> bool;

    /// Whether the error says something about the dependency's health. Errors that do not
    /// (a missing object, a rejected payload) leave the breaker untouched.
    fn counts_as_failure(&self) -> bool {
        self.is_retryable()
    }
}

/// Outcome of a gateway call that did not succeed.
#[derive(Debug, Error)]
pub enum GatewayError<E> {
    /// Breaker is open; no network attempt was made.
    #[error("{service} unavailable: circuit open")]
    CircuitOpen {
        /// Dependency guarded by the open breaker.
        service: String,
    },
    /// The call did not finish within the configured timeout.
    #[error("{service} call `{operation}` timed out after {timeout_ms}ms")]
    Timeout {
        /// Dependency that timed out.
        service: String,
        /// Operation name.
        operation: &'static str,
        /// Timeout applied to the call.
        timeout_ms: u64,
    },
    /// The adapter returned an error.
    #[error("{0}")]
    Call(E),
}

/// Call wrapper bound to one dependency's shared breaker.
#[derive(Clone)]
pub struct Gateway {
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Gateway {
    /// Wrap calls with `breaker`, retrying per `retry` and bounding each attempt by `timeout`.
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            breaker,
            retry,
            timeout,
        }
    }

    /// Dependency name.
    pub fn service(&self) -> &str {
        self.breaker.service()
    }

    /// Shared breaker handle.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `call` under the breaker, timeout, and retry policy.
    ///
    /// An open breaker fails immediately and does not consume a retry attempt. If the breaker
    /// opens between attempts of this call, the last upstream error is returned rather than
    /// [`GatewayError::CircuitOpen`]. Timeouts and errors that [`Retryable::counts_as_failure`]
    /// feed the breaker; only [`Retryable::is_retryable`] errors and timeouts are retried.
    /// Dropping the returned future mid-call releases its breaker admission.
    pub async fn call<T, E, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, GatewayError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0;
        let mut last_error: Option<GatewayError<E>> = None;
        loop {
            let Some(permit) = self.breaker.try_acquire() else {
                if let Some(error) = last_error {
                    tracing::debug!(
                        service = self.service(),
                        operation,
                        attempt,
                        "Circuit opened between attempts; returning last failure"
                    );
                    return Err(error);
                }
                tracing::debug!(service = self.service(), operation, "Circuit open; failing fast");
                return Err(GatewayError::CircuitOpen {
                    service: self.service().to_string(),
                });
            };
            attempt += 1;

            let error = match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(value)) => {
                    permit.record_success();
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    if err.counts_as_failure() {
                        permit.record_failure();
                    } else {
                        permit.record_success();
                    }
                    if !err.is_retryable() {
                        return Err(GatewayError::Call(err));
                    }
                    GatewayError::Call(err)
                }
                Err(_) => {
                    permit.record_failure();
                    GatewayError::Timeout {
                        service: self.service().to_string(),
                        operation,
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                }
            };

            if !self.retry.allows_retry(attempt) {
                return Err(error);
            }
            let delay = self.retry.backoff(attempt);
            tracing::warn!(
                service = self.service(),
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "External call failed; retrying"
            );
            tokio::time::sleep(delay).await;
            last_error = Some(error);
        }
    }
}

/// One gateway per external dependency, sharing breakers with every clone.
#[derive(Clone)]
pub struct Gateways {
    /// Object store calls.
    pub object_store: Gateway,
    /// Embedding calls.
    pub embedding: Gateway,
    /// Vector store calls.
    pub vector_store: Gateway,
}

impl Gateways {
    /// Build the three gateways with identical policy and a common clock.
    pub fn new(
        settings: BreakerSettings,
        retry: RetryPolicy,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let gateway = |service: &str| {
            let breaker = CircuitBreaker::with_clock(service, settings, clock.clone());
            Gateway::new(Arc::new(breaker), retry, timeout)
        };
        Self {
            object_store: gateway(OBJECT_STORE),
            embedding: gateway(EMBEDDING),
            vector_store: gateway(VECTOR_STORE),
        }
    }

    /// Breaker states for diagnostics.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        [&self.object_store, &self.embedding, &self.vector_store]
            .into_iter()
            .map(|gateway| gateway.breaker().snapshot())
            .collect()
    }
}
