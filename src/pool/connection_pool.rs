//! Bounded connection pool.
//!
//! # Responsibilities
//! - Bound simultaneously leased connections with one semaphore
//! - Cache idle connections per endpoint for reuse (LIFO)
//! - Own one circuit breaker per endpoint; an open breaker rejects a lease
//!   before any network call
//! - Own the task registry; cancellation always routes through the pool
//! - Deduplicate concurrent identical work
//!
//! # Lease lifecycle
//! ```text
//! acquire(endpoint)
//!     → breaker.try_acquire()?              (CircuitOpen otherwise)
//!     → semaphore permit                    (waits while at max)
//!     → idle connection, or connect with timeout
//!     → ConnectionLease
//!          drop: reusable + open → idle list, else closed; permit released;
//!                a Half-Open trial with no recorded outcome is handed back
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::{CircuitBreakerConfig, PoolConfig};
use crate::error::GatewayError;
use crate::gateway::protocol::AnalysisOutcome;
use crate::load_balancer::{AvailabilityGate, Endpoint};
use crate::observability::metrics;
use crate::pool::dedup::{Deduplicator, SharedResult};
use crate::pool::task::{ManagedTask, TaskMetadata};
use crate::resilience::{CallPermit, CircuitBreaker, CircuitSnapshot};
use crate::transport::{Connection, Connector, TransportError, TransportResult};

struct IdleConnection {
    conn: Box<dyn Connection>,
    idle_since: Instant,
}

/// Pool statistics. Observability only.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active_connections: usize,
    pub pooled_connections: usize,
    pub max_connections: usize,
    pub active_tasks: usize,
    pub pending_requests: usize,
    pub circuits: BTreeMap<String, CircuitSnapshot>,
}

/// Shared pool of replica connections.
pub struct ConnectionPool {
    config: PoolConfig,
    breaker_config: CircuitBreakerConfig,
    cancel_grace: Duration,
    connector: Arc<dyn Connector>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<HashMap<String, Vec<IdleConnection>>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    tasks: DashMap<String, Arc<ManagedTask>>,
    dedup: Deduplicator<AnalysisOutcome>,
    leased: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        breaker_config: CircuitBreakerConfig,
        cancel_grace: Duration,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let max = config.max_connections.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            config,
            breaker_config,
            cancel_grace,
            connector,
            idle: Mutex::new(HashMap::new()),
            breakers: DashMap::new(),
            tasks: DashMap::new(),
            dedup: Deduplicator::new(),
            leased: AtomicUsize::new(0),
        }
    }

    fn idle(&self) -> MutexGuard<'_, HashMap<String, Vec<IdleConnection>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Breaker for an endpoint, created closed on first use.
    pub fn breaker(&self, endpoint_id: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.get(endpoint_id) {
            return b.clone();
        }
        self.breakers
            .entry(endpoint_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(&self.breaker_config)))
            .clone()
    }

    /// Lease a connection to `endpoint`.
    pub async fn acquire(self: &Arc<Self>, endpoint: &Endpoint) -> Result<ConnectionLease, GatewayError> {
        let call = self.admit(endpoint)?;
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(GatewayError::Internal("connection pool closed".into())),
        };
        self.open_lease(endpoint, call, permit).await
    }

    /// Like [`ConnectionPool::acquire`], but `Ok(None)` instead of waiting
    /// when every pool slot is leased.
    pub async fn try_acquire(
        self: &Arc<Self>,
        endpoint: &Endpoint,
    ) -> Result<Option<ConnectionLease>, GatewayError> {
        let call = self.admit(endpoint)?;
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            return Ok(None);
        };
        self.open_lease(endpoint, call, permit).await.map(Some)
    }

    fn admit(&self, endpoint: &Endpoint) -> Result<CallPermit, GatewayError> {
        let breaker = self.breaker(&endpoint.id);
        breaker.try_acquire().ok_or_else(|| GatewayError::CircuitOpen {
            endpoint: endpoint.id.clone(),
            retry_after: breaker.retry_after().unwrap_or_default(),
        })
    }

    async fn open_lease(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        mut call: CallPermit,
        permit: OwnedSemaphorePermit,
    ) -> Result<ConnectionLease, GatewayError> {
        let conn = match self.take_idle(&endpoint.id) {
            Some(conn) => {
                tracing::trace!(endpoint = %endpoint.id, "Reusing idle connection");
                conn
            }
            None => self.connect(endpoint, &mut call).await?,
        };

        self.leased.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_leased(self.leased.load(Ordering::Relaxed));
        Ok(ConnectionLease {
            pool: self.clone(),
            endpoint: endpoint.clone(),
            conn: Some(conn),
            call,
            reusable: false,
            _permit: permit,
        })
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        call: &mut CallPermit,
    ) -> Result<Box<dyn Connection>, GatewayError> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.connector.connect(endpoint)).await {
            Ok(Ok(conn)) => {
                tracing::debug!(endpoint = %endpoint.id, "Connected to replica");
                Ok(conn)
            }
            Ok(Err(e)) => {
                call.record_failure();
                tracing::warn!(endpoint = %endpoint.id, error = %e, "Connect failed");
                Err(GatewayError::Connection {
                    endpoint: endpoint.id.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                call.record_failure();
                tracing::warn!(endpoint = %endpoint.id, ?timeout, "Connect timed out");
                Err(GatewayError::ConnectionTimeout {
                    endpoint: endpoint.id.clone(),
                    timeout,
                })
            }
        }
    }

    fn take_idle(&self, endpoint_id: &str) -> Option<Box<dyn Connection>> {
        let mut idle = self.idle();
        let list = idle.get_mut(endpoint_id)?;
        while let Some(entry) = list.pop() {
            if !entry.conn.is_closed() {
                return Some(entry.conn);
            }
        }
        None
    }

    fn release(&self, endpoint_id: &str, conn: Option<Box<dyn Connection>>) {
        self.leased.fetch_sub(1, Ordering::Relaxed);
        if let Some(conn) = conn {
            let mut idle = self.idle();
            idle.entry(endpoint_id.to_string()).or_default().push(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
        metrics::record_pool_leased(self.leased.load(Ordering::Relaxed));
    }

    /// Close idle connections older than the idle timeout. Returns how many
    /// were closed.
    pub async fn sweep_idle(&self) -> usize {
        let max_idle = self.config.idle_timeout();
        let expired: Vec<Box<dyn Connection>> = {
            let mut idle = self.idle();
            let mut expired = Vec::new();
            for list in idle.values_mut() {
                let (keep, stale): (Vec<_>, Vec<_>) = list
                    .drain(..)
                    .partition(|c| !c.conn.is_closed() && c.idle_since.elapsed() < max_idle);
                *list = keep;
                expired.extend(stale.into_iter().map(|c| c.conn));
            }
            idle.retain(|_, list| !list.is_empty());
            expired
        };
        let count = expired.len();
        for mut conn in expired {
            conn.close().await;
        }
        if count > 0 {
            tracing::debug!(count, "Closed idle connections");
        }
        count
    }

    /// Close every idle connection (shutdown).
    pub async fn close_idle(&self) {
        let all: Vec<_> = self.idle().drain().flat_map(|(_, list)| list).collect();
        for mut entry in all {
            entry.conn.close().await;
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval()
    }

    // --- Task registry ---

    /// Register a task, or return the one already registered under `id`.
    pub fn register_task(&self, id: &str, metadata: TaskMetadata) -> Arc<ManagedTask> {
        self.tasks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ManagedTask::new(id, metadata, self.cancel_grace)))
            .clone()
    }

    pub fn get_task(&self, id: &str) -> Option<Arc<ManagedTask>> {
        self.tasks.get(id).map(|t| t.clone())
    }

    /// Cancel a registered task. `false` when unknown or already cancelled.
    pub async fn cancel_task(&self, id: &str) -> bool {
        let Some(task) = self.get_task(id) else {
            tracing::debug!(task_id = id, "Cancel for unknown task");
            return false;
        };
        let cancelled = task.cancel().await;
        if cancelled {
            metrics::record_cancellation();
            tracing::info!(task_id = id, "Task cancelled");
        }
        cancelled
    }

    /// Drop a finished task from the registry.
    pub fn complete_task(&self, id: &str) {
        self.tasks.remove(id);
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// See [`Deduplicator::run`].
    pub async fn deduplicate<F, Fut>(
        &self,
        key: &str,
        work: F,
    ) -> (Result<AnalysisOutcome, GatewayError>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AnalysisOutcome, GatewayError>> + Send + 'static,
    {
        let (shared, joined) = self.start_or_join(key, work);
        (shared.await, joined)
    }

    /// See [`Deduplicator::start_or_join`].
    pub fn start_or_join<F, Fut>(&self, key: &str, work: F) -> (SharedResult<AnalysisOutcome>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AnalysisOutcome, GatewayError>> + Send + 'static,
    {
        let (shared, joined) = self.dedup.start_or_join(key, work);
        if joined {
            metrics::record_dedup_join();
        }
        (shared, joined)
    }

    pub fn get_stats(&self) -> PoolStats {
        let pooled = self.idle().values().map(Vec::len).sum();
        let circuits = self
            .breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        PoolStats {
            active_connections: self.leased.load(Ordering::Relaxed),
            pooled_connections: pooled,
            max_connections: self.config.max_connections.max(1),
            active_tasks: self.tasks.len(),
            pending_requests: self.dedup.pending(),
            circuits,
        }
    }
}

impl AvailabilityGate for ConnectionPool {
    fn is_allowed(&self, endpoint: &Endpoint) -> bool {
        match self.breakers.get(&endpoint.id) {
            Some(b) => b.is_available(),
            None => true,
        }
    }

    fn cooldown_remaining(&self, endpoint: &Endpoint) -> Option<Duration> {
        self.breakers.get(&endpoint.id).and_then(|b| b.retry_after())
    }
}

/// A leased connection. Returned to the pool on drop when marked reusable.
pub struct ConnectionLease {
    pool: Arc<ConnectionPool>,
    endpoint: Endpoint,
    conn: Option<Box<dyn Connection>>,
    call: CallPermit,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn send_text(&mut self, text: String) -> TransportResult<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.send_text(text).await,
            None => Err(TransportError::Closed),
        }
    }

    pub async fn recv_text(&mut self) -> Option<TransportResult<String>> {
        match self.conn.as_mut() {
            Some(conn) => conn.recv_text().await,
            None => None,
        }
    }

    /// The exchange finished cleanly; the connection may serve another.
    pub fn mark_reusable(&mut self) {
        self.reusable = true;
    }

    pub fn record_success(&mut self) {
        self.call.record_success();
    }

    pub fn record_failure(&mut self) {
        self.call.record_failure();
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let conn = self
            .conn
            .take()
            .filter(|c| self.reusable && !c.is_closed());
        self.pool.release(&self.endpoint.id, conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use crate::transport::mock::{ConnectMode, MockConnector, MockReplica};

    fn endpoint(n: usize) -> Endpoint {
        Endpoint::parse("static-analyzer", n, &format!("127.0.0.1:{}", 2001 + n)).unwrap()
    }

    fn pool_with(max: usize, connector: MockConnector) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            PoolConfig {
                max_connections: max,
                connect_timeout_secs: 2,
                idle_timeout_secs: 30,
                sweep_interval_secs: 10,
            },
            CircuitBreakerConfig::default(),
            Duration::from_secs(1),
            Arc::new(connector),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_leases_never_exceed_max() {
        let pool = pool_with(2, MockConnector::new());
        let e = endpoint(0);

        let a = pool.acquire(&e).await.unwrap();
        let _b = pool.acquire(&e).await.unwrap();
        assert_eq!(pool.get_stats().active_connections, 2);

        let waiter = {
            let pool = pool.clone();
            let e = e.clone();
            tokio::spawn(async move { pool.acquire(&e).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        drop(a);
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.get_stats().active_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reusable_connection_returns_to_idle() {
        let connector = MockConnector::new();
        let pool = pool_with(4, connector.clone());
        let e = endpoint(0);

        let mut lease = pool.acquire(&e).await.unwrap();
        lease.mark_reusable();
        drop(lease);
        assert_eq!(pool.get_stats().pooled_connections, 1);

        let lease = pool.acquire(&e).await.unwrap();
        assert_eq!(connector.connects(&e.id), 1);
        drop(lease);
        // Not marked reusable: closed, not cached.
        assert_eq!(pool.get_stats().pooled_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_open_breaker_without_network_calls() {
        let connector = MockConnector::new();
        connector.set("static-analyzer-1", MockReplica::refusing());
        let pool = pool_with(4, connector.clone());
        let e = endpoint(0);

        for _ in 0..5 {
            let err = pool.acquire(&e).await.err().unwrap();
            assert!(matches!(err, GatewayError::Connection { .. }));
        }
        assert_eq!(pool.breaker(&e.id).state(), CircuitState::Open);
        assert!(!pool.is_allowed(&e));

        let err = pool.acquire(&e).await.err().unwrap();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        assert_eq!(connector.connects(&e.id), 5);
        assert_eq!(pool.cooldown_remaining(&e), Some(Duration::from_secs(60)));
        assert_eq!(pool.get_stats().active_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_half_open_leases_do_not_strand_breaker() {
        let connector = MockConnector::new();
        connector.set("static-analyzer-1", MockReplica::refusing());
        let pool = pool_with(1, connector.clone());
        let e = endpoint(0);
        for _ in 0..5 {
            let _ = pool.acquire(&e).await;
        }
        connector.set("static-analyzer-1", MockReplica::healthy());
        tokio::time::advance(Duration::from_secs(60)).await;

        // Every trial slot taken and dropped without an outcome.
        for _ in 0..3 {
            drop(pool.acquire(&e).await.unwrap());
        }
        // A trial abandoned while still waiting for a pool slot.
        let blocker = pool.acquire(&endpoint(1)).await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_secs(1), pool.acquire(&e)).await;
        assert!(waiting.is_err());
        drop(blocker);

        assert_eq!(pool.breaker(&e.id).state(), CircuitState::HalfOpen);
        assert!(pool.is_allowed(&e));
        for _ in 0..3 {
            pool.acquire(&e).await.unwrap().record_success();
        }
        assert_eq!(pool.breaker(&e.id).state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let connector = MockConnector::new();
        let mut hanging = MockReplica::healthy();
        hanging.connect = ConnectMode::Hang;
        connector.set("static-analyzer-2", hanging);
        let pool = pool_with(4, connector);

        let err = pool.acquire(&endpoint(1)).await.err().unwrap();
        assert_eq!(
            err,
            GatewayError::ConnectionTimeout {
                endpoint: "static-analyzer-2".into(),
                timeout: Duration::from_secs(2),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_expired_idle() {
        let pool = pool_with(4, MockConnector::new());
        let mut a = pool.acquire(&endpoint(0)).await.unwrap();
        let mut b = pool.acquire(&endpoint(1)).await.unwrap();
        a.mark_reusable();
        b.mark_reusable();
        drop(a);
        tokio::time::advance(Duration::from_secs(20)).await;
        drop(b);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(pool.sweep_idle().await, 1);
        assert_eq!(pool.get_stats().pooled_connections, 1);

        pool.close_idle().await;
        assert_eq!(pool.get_stats().pooled_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deduplicate_shares_one_outcome() {
        let pool = pool_with(1, MockConnector::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let work = |runs: Arc<AtomicUsize>| {
            move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(AnalysisOutcome::cancelled("static-analyzer", "shared"))
            }
        };

        let (first, second) = tokio::join!(
            pool.deduplicate("static-analyzer:app-1", work(runs.clone())),
            pool.deduplicate("static-analyzer:app-1", work(runs.clone())),
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!first.1);
        assert!(second.1);
        assert_eq!(first.0.unwrap().task_id, second.0.unwrap().task_id);
        assert_eq!(pool.get_stats().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_task_registry_routes_cancellation() {
        let pool = pool_with(1, MockConnector::new());
        let t = pool.register_task("t-1", TaskMetadata::default());
        let same = pool.register_task("t-1", TaskMetadata::default());
        assert!(Arc::ptr_eq(&t, &same));
        assert_eq!(pool.get_stats().active_tasks, 1);

        assert!(pool.cancel_task("t-1").await);
        assert!(!pool.cancel_task("t-1").await);
        assert!(t.is_cancelled());
        assert!(!pool.cancel_task("missing").await);

        pool.complete_task("t-1");
        assert!(pool.get_task("t-1").is_none());
    }
}
