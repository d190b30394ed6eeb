//! Bounded, cancellation-safe request dispatch.
//!
//! Every request runs as its own spawned task. The caller waits on that task,
//! the front end's deadline and an optional cancellation signal, and sees
//! exactly one of them. A task that loses the race is aborted, so its store,
//! inference and search calls stop at their next await point instead of
//! running on unobserved.
//!
//! A panic inside the task is caught at the join boundary and answered with
//! the sentinel "not found" response.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use infer_core::{ConfigWatcher, Error, InferResponse, InferenceRequest, ServiceRegistry};
use infer_model::{ModelPipeline, Strategy};
use tracing::Instrument as _;
use uuid::Uuid;

use crate::breaker::CircuitBreakers;

// ============================================================================
// Interruption
// ============================================================================

/// Why the caller stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InterruptReason {
    /// The front end's deadline elapsed first.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller cancelled the request.
    #[error("cancelled")]
    Cancelled,
}

/// A request abandoned before its unit of work finished.
///
/// Carries the sentinel response so front ends can still answer with a
/// well-formed payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("request interrupted: {reason}")]
pub struct Interrupted {
    /// Deadline or cancellation.
    pub reason: InterruptReason,

    /// The sentinel response; identical for both reasons.
    pub response: InferResponse,
}

impl Interrupted {
    /// An interruption carrying the sentinel response.
    pub fn new(reason: InterruptReason) -> Self {
        Self {
            reason,
            response: InferResponse::not_found(),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Runs requests as isolated, deadline-bounded units of work.
///
/// Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    pipeline: Arc<ModelPipeline>,
    breakers: Arc<CircuitBreakers>,
    watcher: Arc<dyn ConfigWatcher>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        pipeline: Arc<ModelPipeline>,
        breakers: Arc<CircuitBreakers>,
        watcher: Arc<dyn ConfigWatcher>,
    ) -> Self {
        Self {
            registry,
            pipeline,
            breakers,
            watcher,
        }
    }

    /// Tenant configuration registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Circuit breakers.
    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    /// Serve `request`, giving up after `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] with [`InterruptReason::DeadlineExceeded`] when
    /// the deadline elapses before the unit of work finishes.
    pub async fn dispatch(
        &self,
        request: InferenceRequest,
        deadline: Duration,
        breaker_key: &str,
    ) -> Result<InferResponse, Interrupted> {
        self.dispatch_with_cancel(request, deadline, breaker_key, std::future::pending())
            .await
    }

    /// Serve `request`, giving up after `deadline` or when `cancelled`
    /// resolves, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] naming the reason the wait ended early.
    pub async fn dispatch_with_cancel<C>(
        &self,
        request: InferenceRequest,
        deadline: Duration,
        breaker_key: &str,
        cancelled: C,
    ) -> Result<InferResponse, Interrupted>
    where
        C: Future<Output = ()>,
    {
        let span = tracing::info_span!(
            "dispatch",
            request_id = %Uuid::new_v4(),
            tenant = %request.tenant_id(),
            user_id = %request.user_id,
            model_type = %request.model_type,
            breaker = breaker_key,
        );

        let unit = self.clone();
        let key = breaker_key.to_string();
        let mut handle =
            tokio::spawn(async move { unit.serve(request, &key).await }.instrument(span.clone()));

        tokio::pin!(cancelled);
        let reason = tokio::select! {
            biased;
            joined = &mut handle => {
                return Ok(match joined {
                    Ok(response) => response,
                    Err(e) => {
                        let err = Error::internal("unit of work failed");
                        span.in_scope(|| tracing::error!(error = %e, "{err}"));
                        InferResponse::not_found().with_message(err.to_string())
                    }
                });
            }
            () = tokio::time::sleep(deadline) => InterruptReason::DeadlineExceeded,
            () = &mut cancelled => InterruptReason::Cancelled,
        };

        handle.abort();
        span.in_scope(|| {
            tracing::warn!(reason = %reason, ?deadline, "request abandoned")
        });
        Err(Interrupted::new(reason))
    }

    /// The unit of work: validate, register, resolve, then run under the
    /// breaker.
    async fn serve(&self, request: InferenceRequest, breaker_key: &str) -> InferResponse {
        let tenant = request.tenant.clone();

        let strategy = match Strategy::select(request) {
            Ok(strategy) => strategy,
            Err(e) => {
                tracing::debug!(error = %e, "rejected request");
                return InferResponse::not_found().with_message(e.to_string());
            }
        };

        if let Err(e) = self
            .registry
            .ensure_watched(&tenant, self.watcher.as_ref())
            .await
        {
            tracing::warn!(error = %e, "tenant watch registration failed");
        }

        // one snapshot for the whole request
        let Some(config) = self.registry.resolve(&tenant.data_id) else {
            tracing::warn!("no service config for tenant");
            return InferResponse::not_found()
                .with_message(format!("no service config for tenant {}", tenant.data_id));
        };

        let pipeline = &self.pipeline;
        let config = config.as_ref();
        self.breakers
            .execute(
                breaker_key,
                strategy,
                |s| async move { pipeline.run(&s, config).await },
                |s| async move { pipeline.run(&s, config).await },
            )
            .await
            .into_response()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("breakers", &self.breakers)
            .finish_non_exhaustive()
    }
}
