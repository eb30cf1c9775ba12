//! Instance Heartbeat
//!
//! A background task that keeps this instance's short-TTL liveness key
//! alive. Starting twice never spawns a second task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::store::SharedStore;

struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic liveness signal for one manager instance
pub struct InstanceHeartbeat {
    store: Arc<dyn SharedStore>,
    key: String,
    ttl: Duration,
    interval: Duration,
    started: AtomicBool,
    task: Mutex<Option<HeartbeatTask>>,
}

impl InstanceHeartbeat {
    pub fn new(store: Arc<dyn SharedStore>, key: String, ttl: Duration, interval: Duration) -> Self {
        Self {
            store,
            key,
            ttl,
            interval,
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Spawn the heartbeat task on the current tokio runtime.
    ///
    /// Returns false if it was already running, and `Error::Runtime` when
    /// called outside a runtime.
    pub fn start(&self) -> Result<bool> {
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let ttl = self.ttl;
        let interval = self.interval;

        let handle = runtime.spawn(async move {
            // First tick fires immediately, giving the initial beat
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = beat(store.as_ref(), &key, ttl).await {
                            tracing::error!("Heartbeat update failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Heartbeat task for {} exited", key);
        });

        *slot = Some(HeartbeatTask { cancel, handle });
        Ok(true)
    }

    /// Cancel the heartbeat task without waiting for it. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        match self.take_task() {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the heartbeat task and wait until it has exited
    pub async fn shutdown(&self) -> bool {
        let task = match self.take_task() {
            Some(task) => task,
            None => return false,
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            tracing::warn!("Heartbeat task ended abnormally: {}", e);
        }
        true
    }

    fn take_task(&self) -> Option<HeartbeatTask> {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.started.swap(false, Ordering::SeqCst) {
            return None;
        }
        slot.take()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Write the heartbeat key once
    pub async fn beat_once(&self) -> Result<()> {
        beat(self.store.as_ref(), &self.key, self.ttl).await
    }

    /// Delete the heartbeat key
    pub async fn clear(&self) -> Result<()> {
        self.store.del(&[self.key.clone()]).await?;
        Ok(())
    }
}

impl Drop for InstanceHeartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn beat(store: &dyn SharedStore, key: &str, ttl: Duration) -> Result<()> {
    let now = chrono::Utc::now().timestamp_millis().to_string();
    store.set_ex(key, &now, ttl).await?;
    tracing::trace!("Heartbeat written to {}", key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn heartbeat(store: Arc<MemoryStore>) -> InstanceHeartbeat {
        InstanceHeartbeat::new(
            store,
            "test:instance:api-1:heartbeat".to_string(),
            Duration::from_secs(60),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let hb = heartbeat(store.clone());

        assert!(!hb.is_running());
        assert!(hb.start().unwrap());
        assert!(!hb.start().unwrap());
        assert!(hb.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.exists("test:instance:api-1:heartbeat").await.unwrap());

        assert!(hb.shutdown().await);
        assert!(!hb.stop());
        assert!(!hb.is_running());

        // no beat lands after shutdown returned
        hb.clear().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.exists("test:instance:api-1:heartbeat").await.unwrap());
    }

    #[tokio::test]
    async fn test_beat_refreshes_ttl() {
        let store = Arc::new(MemoryStore::new());
        let hb = heartbeat(store.clone());
        hb.beat_once().await.unwrap();

        let ttl = store.ttl("test:instance:api-1:heartbeat").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(55));

        hb.clear().await.unwrap();
        assert!(!store.exists("test:instance:api-1:heartbeat").await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let store = Arc::new(MemoryStore::new());
        let hb = heartbeat(store);
        assert!(hb.start().unwrap());
        assert!(hb.stop());
        assert!(hb.start().unwrap());
        assert!(hb.is_running());
    }

    #[test]
    fn test_start_outside_runtime() {
        let hb = heartbeat(Arc::new(MemoryStore::new()));
        assert!(matches!(hb.start(), Err(Error::Runtime(_))));
        assert!(!hb.is_running());
    }
}
