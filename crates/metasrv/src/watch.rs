//! Shard-lease expiry watch
//!
//! Storage nodes keep a lease-bound key per shard they lead under
//! `clusters/<id>/shard_leases/`. When a lease runs out the KV store emits
//! an expiry event; the watch turns it into a callback so the scheduler can
//! drop the dead binding and reassign the shard. The static topology runs
//! the no-op implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kv::{KvStore, WatchEvent};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::metadata::{NodeName, ShardId};

#[derive(Debug, Clone)]
pub struct ShardRegisterEvent {
    pub shard_id: ShardId,
    pub leader_node: NodeName,
}

#[derive(Debug, Clone)]
pub struct ShardExpireEvent {
    pub shard_id: ShardId,
    pub old_leader_node: NodeName,
}

/// Receives shard lease transitions
#[async_trait]
pub trait ShardWatchCallback: Send + Sync {
    async fn on_shard_registered(&self, event: ShardRegisterEvent) -> Result<()>;

    async fn on_shard_expired(&self, event: ShardExpireEvent) -> Result<()>;
}

/// Watches shard leases and fans events out to registered callbacks
#[async_trait]
pub trait ShardWatch: Send + Sync {
    fn register_callback(&self, callback: Arc<dyn ShardWatchCallback>);

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// KV-backed shard watch used by the dynamic topology
pub struct KvShardWatch {
    kv: Arc<dyn KvStore>,
    prefix: String,
    callbacks: Arc<Mutex<Vec<Arc<dyn ShardWatchCallback>>>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl KvShardWatch {
    pub fn new(kv: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            handle: Mutex::new(None),
        }
    }

    fn parse_shard_id(prefix: &str, key: &str) -> Option<ShardId> {
        key.strip_prefix(prefix)?.parse().ok()
    }
}

#[async_trait]
impl ShardWatch for KvShardWatch {
    fn register_callback(&self, callback: Arc<dyn ShardWatchCallback>) {
        self.callbacks.lock().push(callback);
    }

    async fn start(&self) -> Result<()> {
        let mut events = self.kv.watch_prefix(&self.prefix).await?;
        let prefix = self.prefix.clone();
        let callbacks = self.callbacks.clone();

        let handle = tokio::spawn(async move {
            // Last known leader per shard, needed because expiry events only
            // carry the key.
            let mut leaders: HashMap<ShardId, NodeName> = HashMap::new();
            while let Some(event) = events.recv().await {
                match event {
                    WatchEvent::Put { key, value } => {
                        let Some(shard_id) = KvShardWatch::parse_shard_id(&prefix, &key) else {
                            warn!("unparsable shard lease key: {}", key);
                            continue;
                        };
                        let leader = String::from_utf8_lossy(&value).to_string();
                        leaders.insert(shard_id, leader.clone());
                        let event = ShardRegisterEvent {
                            shard_id,
                            leader_node: leader,
                        };
                        let subscribers = callbacks.lock().clone();
                        for callback in subscribers {
                            if let Err(e) = callback.on_shard_registered(event.clone()).await {
                                error!("shard register callback failed: {}", e);
                            }
                        }
                    }
                    WatchEvent::Expired { key } => {
                        let Some(shard_id) = KvShardWatch::parse_shard_id(&prefix, &key) else {
                            warn!("unparsable shard lease key: {}", key);
                            continue;
                        };
                        let Some(old_leader) = leaders.remove(&shard_id) else {
                            continue;
                        };
                        info!(
                            "shard {} lease expired, old leader {}",
                            shard_id, old_leader
                        );
                        let event = ShardExpireEvent {
                            shard_id,
                            old_leader_node: old_leader,
                        };
                        let subscribers = callbacks.lock().clone();
                        for callback in subscribers {
                            if let Err(e) = callback.on_shard_expired(event.clone()).await {
                                error!("shard expire callback failed: {}", e);
                            }
                        }
                    }
                    WatchEvent::Delete { key } => {
                        if let Some(shard_id) = KvShardWatch::parse_shard_id(&prefix, &key) {
                            leaders.remove(&shard_id);
                        }
                    }
                }
            }
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}

/// Watch that never fires, used by the static topology
pub struct NoopShardWatch;

#[async_trait]
impl ShardWatch for NoopShardWatch {
    fn register_callback(&self, _callback: Arc<dyn ShardWatchCallback>) {}

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv::MemKv;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RecordingCallback {
        tx: mpsc::UnboundedSender<ShardExpireEvent>,
    }

    #[async_trait]
    impl ShardWatchCallback for RecordingCallback {
        async fn on_shard_registered(&self, _event: ShardRegisterEvent) -> Result<()> {
            Ok(())
        }

        async fn on_shard_expired(&self, event: ShardExpireEvent) -> Result<()> {
            let _ = self.tx.send(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_expiry_reports_old_leader() {
        let kv = Arc::new(MemKv::new());
        let watch = KvShardWatch::new(kv.clone(), "/meta/clusters/0/shard_leases/");
        let (tx, mut rx) = mpsc::unbounded_channel();
        watch.register_callback(Arc::new(RecordingCallback { tx }));
        watch.start().await.unwrap();

        let lease = kv.grant_lease(Duration::from_millis(20)).await.unwrap();
        kv.put_with_lease(
            "/meta/clusters/0/shard_leases/3",
            b"n1".to_vec(),
            lease,
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        kv.sweep_expired();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.shard_id, 3);
        assert_eq!(event.old_leader_node, "n1");

        watch.stop().await.unwrap();
    }
}
