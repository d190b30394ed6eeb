//! Circuit breaking with degraded fallback.
//!
//! Each breaker key (one per front end, e.g. `"grpcServer"`) owns a
//! [`failsafe`] state machine. The breaker opens after a run of consecutive
//! failures, or when the success rate over the rolling window drops below the
//! configured rate once enough requests were seen. Primary calls that outlive
//! the primary timeout count as failures.
//!
//! [`CircuitBreakers::execute`] runs the primary computation, or, when the
//! breaker is open or the primary fails, the fallback on a degraded strategy.
//! Exactly one of the two produces the outcome.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use failsafe::failure_policy::FailurePolicy as _;
use failsafe::futures::CircuitBreaker as _;
use failsafe::{Config, Instrument, StateMachine, backoff, failure_policy};
use infer_core::{BreakerSettings, Error, InferResponse, Result};
use infer_model::Strategy;

/// Failure policy shared by every breaker.
pub type BreakerPolicy = failure_policy::OrElse<
    failure_policy::ConsecutiveFailures<backoff::Constant>,
    failure_policy::SuccessRateOverTimeWindow<backoff::Constant>,
>;

/// A single circuit breaker.
pub type Breaker = StateMachine<BreakerPolicy, TracingInstrument>;

// ============================================================================
// Instrumentation
// ============================================================================

/// Logs breaker state transitions.
#[derive(Debug, Clone)]
pub struct TracingInstrument {
    key: Arc<str>,
}

impl TracingInstrument {
    /// Create an instrument for a breaker key.
    pub fn new(key: &str) -> Self {
        Self { key: Arc::from(key) }
    }
}

impl Instrument for TracingInstrument {
    fn on_call_rejected(&self) {
        tracing::debug!(breaker = %self.key, "breaker open, primary call rejected");
    }

    fn on_open(&self) {
        tracing::warn!(breaker = %self.key, "breaker opened");
    }

    fn on_half_open(&self) {
        tracing::info!(breaker = %self.key, "breaker half-open, probing primary");
    }

    fn on_closed(&self) {
        tracing::info!(breaker = %self.key, "breaker closed");
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Result of a protected call.
#[derive(Debug)]
pub enum CircuitOutcome {
    /// The primary computation succeeded.
    Primary(InferResponse),

    /// The fallback succeeded on the degraded workload.
    Degraded(InferResponse),

    /// Neither path produced a response.
    Failed {
        /// The primary's error; `None` when the open breaker skipped it.
        primary: Option<Error>,
        /// The fallback's error.
        fallback: Error,
    },
}

impl CircuitOutcome {
    /// Whether the fallback path ran and succeeded.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    /// Whether the primary was skipped because the breaker was open.
    pub fn was_rejected(&self) -> bool {
        matches!(self, Self::Failed { primary: None, .. })
    }

    /// The response to hand back; the sentinel when both paths failed.
    pub fn into_response(self) -> InferResponse {
        match self {
            Self::Primary(response) | Self::Degraded(response) => response,
            Self::Failed { fallback, .. } => InferResponse::not_found().with_message(fallback.to_string()),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Breakers by key, created on first use.
pub struct CircuitBreakers {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakers {
    /// Create an empty registry.
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker settings.
    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// The breaker for `key`.
    pub fn breaker(&self, key: &str) -> Breaker {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .entry(key.to_string())
            .or_insert_with(|| self.build(key))
            .clone()
    }

    /// Whether the breaker for `key` would let a primary call through.
    pub fn is_call_permitted(&self, key: &str) -> bool {
        self.breaker(key).is_call_permitted()
    }

    fn build(&self, key: &str) -> Breaker {
        let sleep = backoff::constant(self.settings.sleep_window());
        let policy = failure_policy::consecutive_failures(self.settings.consecutive_failures, sleep.clone())
            .or_else(failure_policy::success_rate_over_time_window(
                self.settings.required_success_rate,
                self.settings.min_request_volume,
                self.settings.window(),
                sleep,
            ));

        tracing::debug!(breaker = key, "creating circuit breaker");
        Config::new()
            .failure_policy(policy)
            .instrument(TracingInstrument::new(key))
            .build()
    }

    /// Run `primary` on `strategy`, falling back to `fallback` on the
    /// degraded strategy when the breaker is open or the primary fails.
    ///
    /// Never returns an error: failures of both paths are reported through
    /// [`CircuitOutcome::Failed`].
    pub async fn execute<P, PF, F, FF>(
        &self,
        key: &str,
        strategy: Strategy,
        primary: P,
        fallback: F,
    ) -> CircuitOutcome
    where
        P: FnOnce(Strategy) -> PF,
        PF: Future<Output = Result<InferResponse>>,
        F: FnOnce(Strategy) -> FF,
        FF: Future<Output = Result<InferResponse>>,
    {
        let breaker = self.breaker(key);
        let degraded = strategy
            .clone()
            .degrade(self.settings.lower_rank_num, self.settings.lower_recall_num);
        let timeout = self.settings.primary_timeout();

        // the primary closure only runs if the breaker lets the call through
        let guarded = async move {
            match tokio::time::timeout(timeout, primary(strategy)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(timeout)),
            }
        };

        let primary_error = match breaker.call(guarded).await {
            Ok(response) => return CircuitOutcome::Primary(response),
            Err(failsafe::Error::Inner(e)) => {
                tracing::warn!(breaker = key, error = %e, "primary failed, running fallback");
                Some(e)
            }
            Err(failsafe::Error::Rejected) => None,
        };

        match fallback(degraded).await {
            Ok(response) => CircuitOutcome::Degraded(response),
            Err(e) => {
                tracing::error!(breaker = key, error = %e, "fallback failed");
                CircuitOutcome::Failed {
                    primary: primary_error,
                    fallback: e,
                }
            }
        }
    }
}

impl fmt::Debug for CircuitBreakers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = match self.breakers.lock() {
            Ok(guard) => guard.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        f.debug_struct("CircuitBreakers")
            .field("settings", &self.settings)
            .field("keys", &keys)
            .finish()
    }
}
