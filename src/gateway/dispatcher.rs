//! Request dispatch.
//!
//! # Algorithm
//! ```text
//! dispatch(service_type, request, timeout)
//!     → register task (pool registry)
//!     → deduplicate by (service_type, target) when enabled
//!     → up to max_retries stream attempts:
//!         select endpoint (breaker-allowed, untried)
//!         → acquire lease (connect failures retry elsewhere for free)
//!         → send request with the replica's slice of the deadline
//!         → stream until terminal / cancel / deadline
//!         → backoff (capped by the deadline) before the next attempt
//!     → resolve task result, drop task from the registry
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use crate::config::{DispatchConfig, GatewayConfig};
use crate::error::GatewayError;
use crate::gateway::protocol::{AnalysisOutcome, DispatchRequest, OutcomeStatus};
use crate::gateway::stream::{
    run_attempt, AttemptState, AttemptTracker, ProgressEvent, StreamContext, Terminal,
};
use crate::load_balancer::{ReplicaRegistry, ReplicaSet, ReplicaSetStats, RequestGuard};
use crate::observability::metrics;
use crate::pool::{ConnectionPool, ManagedTask, PoolStats, TaskInfo, TaskMetadata};
use crate::resilience::backoff::backoff_within;
use crate::resilience::Deadline;
use crate::transport::Connector;

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Stats for the whole dispatch core.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub pool: PoolStats,
    pub services: BTreeMap<String, ReplicaSetStats>,
}

struct Inner {
    pool: Arc<ConnectionPool>,
    registry: Arc<ReplicaRegistry>,
    config: DispatchConfig,
    progress: broadcast::Sender<ProgressEvent>,
}

/// Routes analysis requests to replicas. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(pool: Arc<ConnectionPool>, registry: Arc<ReplicaRegistry>, config: DispatchConfig) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                pool,
                registry,
                config,
                progress,
            }),
        }
    }

    /// Build the pool and replica sets described by `config`.
    pub fn from_config(config: &GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        let pool = Arc::new(ConnectionPool::new(
            config.pool.clone(),
            config.circuit_breaker.clone(),
            config.dispatch.cancel_grace(),
            connector,
        ));
        let registry = Arc::new(ReplicaRegistry::from_config(&config.services));
        Self::new(pool, registry, config.dispatch.clone())
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.inner.registry
    }

    /// Progress updates of every in-flight dispatch.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress.subscribe()
    }

    pub async fn cancel_task(&self, task_id: &str) -> bool {
        self.inner.pool.cancel_task(task_id).await
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskInfo> {
        self.inner.pool.get_task(task_id).map(|t| t.info())
    }

    pub fn get_pool_stats(&self) -> GatewayStats {
        GatewayStats {
            pool: self.inner.pool.get_stats(),
            services: self.inner.registry.stats(),
        }
    }

    /// Dispatch one request. Never fails: every error is folded into the
    /// returned outcome's status.
    pub async fn dispatch(
        &self,
        service_type: &str,
        request: DispatchRequest,
        timeout: Option<Duration>,
    ) -> AnalysisOutcome {
        let started = Instant::now();
        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let budget = timeout.unwrap_or_else(|| self.inner.config.request_timeout());
        let task = self.inner.pool.register_task(
            &task_id,
            TaskMetadata {
                service_type: Some(service_type.to_string()),
                target: request.target.clone(),
            },
        );

        tracing::info!(
            task_id = %task_id,
            service = service_type,
            request_type = %request.request_type,
            timeout = ?budget,
            "Dispatching request"
        );

        let dedup_key = if self.inner.config.deduplicate {
            request.dedup_key(service_type)
        } else {
            None
        };

        let result = match dedup_key {
            Some(key) => {
                let this = self.clone();
                let service = service_type.to_string();
                let owner = task.clone();
                let work = move || async move { this.execute(&service, &request, &owner, budget).await };
                // A joiner's own cancellation or deadline detaches it; the
                // shared work runs on the budget of the task that started it.
                let (shared, joined) = self.inner.pool.start_or_join(&key, work);
                let waiter_deadline = Deadline::after(budget);
                tokio::select! {
                    biased;
                    _ = task.cancelled() => Err(GatewayError::Cancelled { task_id: task_id.clone() }),
                    result = shared => result,
                    _ = tokio::time::sleep_until(waiter_deadline.instant()), if joined => {
                        Err(GatewayError::RequestTimeout {
                            endpoint: service_type.to_string(),
                            timeout: budget,
                        })
                    }
                }
            }
            None => self.execute(service_type, &request, &task, budget).await,
        };

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => failure_outcome(service_type, &task_id, &e),
        };
        outcome.task_id = task_id.clone();
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        task.resolve(outcome.clone());
        self.inner.pool.complete_task(&task_id);

        metrics::record_dispatch(service_type, outcome.status.as_str(), started);
        tracing::info!(
            task_id = %task_id,
            service = service_type,
            status = outcome.status.as_str(),
            attempts = outcome.attempts,
            endpoint = ?outcome.endpoint,
            duration_ms = outcome.duration_ms,
            "Dispatch finished"
        );
        outcome
    }

    async fn execute(
        &self,
        service_type: &str,
        request: &DispatchRequest,
        task: &ManagedTask,
        budget: Duration,
    ) -> Result<AnalysisOutcome, GatewayError> {
        let replicas = self
            .inner
            .registry
            .get(service_type)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownService(service_type.to_string()))?;

        let deadline = Deadline::after(budget);
        let max_attempts = self.inner.config.max_retries.max(1);
        let mut attempts = 0u32;
        let mut tried: Vec<String> = Vec::new();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_error: Option<GatewayError> = None;

        while attempts < max_attempts {
            if task.is_cancelled() {
                return Err(GatewayError::Cancelled {
                    task_id: task.id().to_string(),
                });
            }

            let guard = match replicas.select(self.inner.pool.as_ref(), &excluded) {
                Ok(guard) => guard,
                Err(e) if tried.is_empty() => return Err(e),
                Err(e) => {
                    last_error.get_or_insert(e);
                    break;
                }
            };
            let endpoint_id = guard.id().to_string();
            excluded.insert(endpoint_id.clone());
            tried.push(endpoint_id.clone());

            match self.attempt(&replicas, guard, request, task, deadline).await {
                Ok(terminal) => {
                    attempts += 1;
                    return Ok(AnalysisOutcome {
                        status: terminal.status,
                        service_type: service_type.to_string(),
                        task_id: task.id().to_string(),
                        result: terminal.body,
                        error: terminal.error,
                        endpoint: Some(endpoint_id),
                        attempts,
                        duration_ms: deadline.elapsed().as_millis() as u64,
                    });
                }
                Err(e @ GatewayError::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    if e.consumes_attempt() {
                        attempts += 1;
                    }
                    metrics::record_retry(service_type, e.kind());
                    tracing::warn!(
                        task_id = task.id(),
                        endpoint = %endpoint_id,
                        attempt = attempts,
                        error = %e,
                        "Attempt failed"
                    );
                    let out_of_time = matches!(e, GatewayError::RequestTimeout { .. })
                        || deadline.is_expired();
                    let consumed = e.consumes_attempt();
                    last_error = Some(e);
                    if out_of_time {
                        break;
                    }
                    if consumed && attempts < max_attempts {
                        self.backoff(attempts, &deadline, task).await?;
                    }
                }
            }
        }

        Err(GatewayError::RetriesExhausted {
            attempts,
            tried,
            last: Box::new(
                last_error.unwrap_or_else(|| GatewayError::Internal("no attempt was made".into())),
            ),
        })
    }

    /// One attempt against the endpoint held by `guard`.
    async fn attempt(
        &self,
        replicas: &ReplicaSet,
        guard: RequestGuard,
        request: &DispatchRequest,
        task: &ManagedTask,
        deadline: Deadline,
    ) -> Result<Terminal, GatewayError> {
        let endpoint = guard.endpoint.clone();
        let mut tracker = AttemptTracker::new(task.id(), &endpoint.id);

        let acquired = tokio::select! {
            biased;
            _ = task.cancelled() => None,
            acquired = timeout_at(deadline.instant(), self.inner.pool.acquire(&endpoint)) => Some(acquired),
        };
        let mut lease = match acquired {
            None => {
                tracker.to(AttemptState::Cancelled);
                return Err(GatewayError::Cancelled {
                    task_id: task.id().to_string(),
                });
            }
            Some(Err(_)) => {
                tracker.to(AttemptState::TimedOut);
                guard.fail_without_latency();
                return Err(GatewayError::RequestTimeout {
                    endpoint: endpoint.id,
                    timeout: deadline.budget(),
                });
            }
            Some(Ok(Err(e))) => {
                tracker.to(AttemptState::Failed);
                guard.fail_without_latency();
                return Err(e);
            }
            Some(Ok(Ok(lease))) => lease,
        };

        let replica_budget = deadline.replica_budget(self.inner.config.replica_timeout_margin());
        let frame = request.to_frame(task.id(), replica_budget.as_secs());
        let ctx = StreamContext {
            task,
            service_type: replicas.service(),
            deadline,
            progress: &self.inner.progress,
        };

        let result = run_attempt(&mut lease, frame, &ctx, &mut tracker).await;
        match &result {
            Ok(terminal) => {
                lease.record_success();
                guard.finish(terminal.status == OutcomeStatus::Success);
            }
            Err(GatewayError::Cancelled { .. }) => {}
            Err(GatewayError::Connection { .. }) => {
                lease.record_failure();
                guard.fail_without_latency();
            }
            Err(_) => {
                lease.record_failure();
                guard.finish(false);
            }
        }
        tracing::debug!(task_id = task.id(), endpoint = %endpoint.id, state = ?tracker.state(), "Attempt ended");
        result
    }

    async fn backoff(&self, attempt: u32, deadline: &Deadline, task: &ManagedTask) -> Result<(), GatewayError> {
        let config = &self.inner.config;
        let Some(delay) = backoff_within(attempt, config.backoff_base_ms, config.backoff_max_ms, deadline) else {
            return Ok(());
        };
        tracing::debug!(task_id = task.id(), ?delay, "Backing off before retry");
        tokio::select! {
            biased;
            _ = task.cancelled() => Err(GatewayError::Cancelled { task_id: task.id().to_string() }),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn failure_outcome(service_type: &str, task_id: &str, error: &GatewayError) -> AnalysisOutcome {
    let (attempts, endpoint) = match error {
        GatewayError::RetriesExhausted { attempts, tried, .. } => (*attempts, tried.last().cloned()),
        _ => (0, None),
    };
    AnalysisOutcome {
        status: error.status(),
        service_type: service_type.to_string(),
        task_id: task_id.to_string(),
        result: Value::Null,
        error: Some(error.to_string()),
        endpoint,
        attempts,
        duration_ms: 0,
    }
}
