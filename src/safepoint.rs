//! GC safepoint keeper
//!
//! On a distributed-storage TiDB server, history below the dump snapshot
//! must survive until the last chunk is read. The keeper heartbeats a
//! service-level safepoint lease through a coordinator client: every
//! `ttl/2` it re-registers `(service_id, ttl, snapshot_ts)`. Failures are
//! retried with backoff and logged, never fatal; a very long dump that
//! outlives a persistently failing coordinator needs the operator to extend
//! the server's global GC lifetime by hand.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Default lease TTL in seconds
pub const DEFAULT_SAFE_POINT_TTL: u64 = 300;

const UPDATE_RETRY_COUNT: usize = 10;
const UPDATE_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// PD-like coordinator client, provided by the embedding application
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Register or extend the service safepoint lease
    async fn update_service_safe_point(
        &self,
        service_id: &str,
        ttl_secs: u64,
        safe_point: u64,
    ) -> Result<()>;
}

/// Background heartbeat that keeps the snapshot's history alive
pub struct SafePointKeeper {
    coordinator: Arc<dyn Coordinator>,
    service_id: String,
    ttl_secs: u64,
    safe_point: u64,
    token: CancellationToken,
}

impl SafePointKeeper {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        safe_point: u64,
        token: CancellationToken,
    ) -> Self {
        let startup_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            coordinator,
            service_id: format!("quarry_{}", startup_nanos),
            ttl_secs: DEFAULT_SAFE_POINT_TTL,
            safe_point,
            token,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs.max(2);
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Spawn the heartbeat loop. Dropping the handle does not stop it; the
    /// cancellation token does. The lease expires on its own at most `ttl`
    /// after the last heartbeat.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let interval = Duration::from_secs(self.ttl_secs / 2);
        loop {
            self.update_once().await;
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("safepoint keeper stopping, lease {} will lapse", self.service_id);
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One heartbeat, with bounded retries. Exhausting the retries is
    /// logged and swallowed; the next tick tries again.
    async fn update_once(&self) {
        for attempt in 1..=UPDATE_RETRY_COUNT {
            match self
                .coordinator
                .update_service_safe_point(&self.service_id, self.ttl_secs, self.safe_point)
                .await
            {
                Ok(()) => {
                    debug!(
                        "safepoint lease {} extended to ts {}",
                        self.service_id, self.safe_point
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "safepoint update attempt {}/{} failed: {}",
                        attempt, UPDATE_RETRY_COUNT, e
                    );
                    if attempt == UPDATE_RETRY_COUNT {
                        return;
                    }
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        _ = tokio::time::sleep(UPDATE_RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

/// Parse the snapshot handle (a TSO) into the numeric safepoint
pub fn snapshot_to_safe_point(snapshot: &str) -> Option<u64> {
    snapshot.trim().parse::<u64>().ok()
}
