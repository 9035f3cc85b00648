//! Idle connection sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::pool::ConnectionPool;

/// Periodically closes idle connections past their idle timeout.
pub struct IdleSweeper {
    pool: Arc<ConnectionPool>,
}

impl IdleSweeper {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.pool.sweep_interval().max(Duration::from_secs(1));
        tracing::info!(interval = ?period, "Idle sweeper starting");

        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.pool.sweep_idle().await;
                    let stats = self.pool.get_stats();
                    crate::observability::metrics::record_pool_idle(stats.pooled_connections);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Idle sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
