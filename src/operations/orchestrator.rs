//! Managed Operation Orchestrator.
//!
//! Binds a domain service to the Operations Registry and Cancellation
//! Coordinator with a uniform contract: create the record, obtain a token,
//! schedule the worker, translate its outcome into exactly one terminal
//! transition.

use super::{OperationError, OperationKind, OperationsRegistry};
use crate::cancellation::{CancellationCoordinator, Token};
use crate::error::KtrdrError;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// What a worker reports back to the orchestrator. Workers MUST observe
/// `Token::is_requested` at cooperative checkpoints and return `Cancelled`
/// (after a graceful shutdown, e.g. checkpointing) rather than `Failed`.
pub enum WorkerOutcome {
    Completed(Value),
    Failed(KtrdrError),
    Cancelled,
}

/// Forwarded to `update_progress`; cheap to clone, safe to hold across
/// `.await` points.
#[derive(Clone)]
pub struct ProgressReporter {
    registry: OperationsRegistry,
    operation_id: String,
}

impl ProgressReporter {
    /// Constructs a reporter bound to an already-created operation, for
    /// callers (e.g. the training pipeline's own tests) that drive progress
    /// outside of [`ManagedOperationOrchestrator::start_managed_operation`].
    pub fn new(registry: OperationsRegistry, operation_id: String) -> Self {
        Self {
            registry,
            operation_id,
        }
    }

    pub fn report(
        &self,
        percentage: f64,
        current_step: impl Into<String>,
        context: HashMap<String, String>,
    ) {
        if let Err(e) = self
            .registry
            .update_progress(&self.operation_id, percentage, current_step, context)
        {
            tracing::warn!(operation_id = %self.operation_id, error = %e, "progress report dropped");
        }
    }
}

#[derive(Clone)]
pub struct ManagedOperationOrchestrator {
    registry: OperationsRegistry,
    coordinator: CancellationCoordinator,
}

pub struct StartedOperation {
    pub operation_id: String,
    pub status: &'static str,
}

impl ManagedOperationOrchestrator {
    pub fn new(registry: OperationsRegistry, coordinator: CancellationCoordinator) -> Self {
        Self {
            registry,
            coordinator,
        }
    }

    pub fn registry(&self) -> &OperationsRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &CancellationCoordinator {
        &self.coordinator
    }

    /// Creates the record, obtains a token, schedules `worker` on the
    /// cooperative scheduler, and returns immediately — the caller receives
    /// an operation id without waiting for the work to finish.
    pub fn start_managed_operation<F, Fut>(
        &self,
        kind: OperationKind,
        metadata: HashMap<String, String>,
        max_duration: Option<Duration>,
        worker: F,
    ) -> StartedOperation
    where
        F: FnOnce(ProgressReporter, Token) -> Fut + Send + 'static,
        Fut: Future<Output = WorkerOutcome> + Send + 'static,
    {
        let operation_id = self.registry.create(kind, metadata);
        let token = self.coordinator.create_token(&operation_id);
        let reporter = ProgressReporter {
            registry: self.registry.clone(),
            operation_id: operation_id.clone(),
        };

        let registry = self.registry.clone();
        let coordinator = self.coordinator.clone();
        let op_id = operation_id.clone();
        let worker_token = token.clone();

        let handle = tokio::spawn(async move {
            let outcome = if let Some(max_duration) = max_duration {
                let timeout_token = worker_token.clone();
                let op_for_timeout = op_id.clone();
                let registry_for_timeout = registry.clone();
                tokio::select! {
                    outcome = worker(reporter, worker_token) => outcome,
                    _ = tokio::time::sleep(max_duration) => {
                        timeout_token.request("timeout");
                        if let Err(e) = registry_for_timeout.request_cancel(&op_for_timeout, "timeout") {
                            tracing::warn!(operation_id = %op_for_timeout, error = %e, "could not record timeout cancellation request");
                        }
                        tracing::warn!(operation_id = %op_for_timeout, "operation exceeded its duration budget; cancellation requested");
                        WorkerOutcome::Cancelled
                    }
                }
            } else {
                worker(reporter, worker_token).await
            };

            finalize(&registry, &coordinator, &op_id, outcome);
        });

        if let Err(e) = self.registry.start(&operation_id, handle) {
            tracing::error!(operation_id = %operation_id, error = %e, "failed to record operation start");
        }

        StartedOperation {
            operation_id,
            status: "started",
        }
    }

    /// Requests cancellation; idempotent per the Cancellation Coordinator
    /// contract.
    pub fn cancel(&self, operation_id: &str, reason: impl Into<String>) -> Result<(), KtrdrError> {
        self.registry.request_cancel(operation_id, reason.into())?;
        if let Some(token) = self.coordinator.get(operation_id) {
            token.request(
                self.registry
                    .get(operation_id)
                    .and_then(|r| r.cancellation_reason)
                    .unwrap_or_default(),
            );
        }
        Ok(())
    }
}

/// Exactly one terminal transition is recorded per operation: if the
/// registry already holds a terminal status (a concurrent path finalized
/// first), the attempt here is a no-op rather than an error surfaced to the
/// caller.
fn finalize(
    registry: &OperationsRegistry,
    coordinator: &CancellationCoordinator,
    operation_id: &str,
    outcome: WorkerOutcome,
) {
    let result = match outcome {
        WorkerOutcome::Completed(summary) => registry.complete(operation_id, summary),
        WorkerOutcome::Failed(error) => {
            registry.fail(operation_id, OperationError::from(&error))
        }
        WorkerOutcome::Cancelled => registry.finalize_cancelled(operation_id),
    };
    if let Err(e) = result {
        if e.category() == "illegal-transition" {
            tracing::debug!(operation_id, "terminal transition already recorded");
        } else {
            tracing::error!(operation_id, error = %e, "failed to finalize operation");
        }
    }
    coordinator.remove(operation_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::OperationStatus;

    fn orchestrator() -> ManagedOperationOrchestrator {
        ManagedOperationOrchestrator::new(
            OperationsRegistry::new(),
            CancellationCoordinator::default(),
        )
    }

    #[tokio::test]
    async fn successful_worker_completes_the_operation() {
        let orch = orchestrator();
        let started = orch.start_managed_operation(
            OperationKind::DataLoad,
            HashMap::new(),
            None,
            |reporter, _token| async move {
                reporter.report(100.0, "done", HashMap::new());
                WorkerOutcome::Completed(serde_json::json!({"bars_loaded": 500}))
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        let record = orch.registry().get(&started.operation_id).unwrap();
        assert_eq!(record.status, OperationStatus::Completed);
        assert!(record.terminal_invariant_holds());
    }

    #[tokio::test]
    async fn cancellation_is_observed_cooperatively() {
        let orch = orchestrator();
        let started = orch.start_managed_operation(
            OperationKind::Training,
            HashMap::new(),
            None,
            |_reporter, token| async move {
                for _ in 0..200 {
                    if token.is_requested() {
                        return WorkerOutcome::Cancelled;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                WorkerOutcome::Completed(serde_json::json!({}))
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        orch.cancel(&started.operation_id, "user changed mind").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = orch.registry().get(&started.operation_id).unwrap();
        assert_eq!(record.status, OperationStatus::Cancelled);
        assert_eq!(record.cancellation_reason.unwrap(), "user changed mind");
    }

    #[tokio::test]
    async fn timeout_requests_cancellation() {
        let orch = orchestrator();
        let started = orch.start_managed_operation(
            OperationKind::Backtesting,
            HashMap::new(),
            Some(Duration::from_millis(10)),
            |_reporter, token| async move {
                loop {
                    if token.is_requested() {
                        return WorkerOutcome::Cancelled;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            },
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        let record = orch.registry().get(&started.operation_id).unwrap();
        assert_eq!(record.status, OperationStatus::Cancelled);
        assert_eq!(record.cancellation_reason.unwrap(), "timeout");
    }
}
