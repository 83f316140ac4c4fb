//! Leader election
//!
//! Exactly one meta server in the quorum is leader at any time. Election
//! rides on the KV store: whoever creates the lease-protected `leader` key
//! wins, keeps the lease alive on half-TTL ticks, and everyone else watches
//! the key to learn the current leader and to retry once it expires.

mod forward;

pub use forward::ForwardClient;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kv::{Compare, KvStore, Op, WatchEvent};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{MetaError, Result};

/// Reacts to this node gaining or losing leadership
#[async_trait]
pub trait LeadershipListener: Send + Sync {
    async fn on_elected(&self);

    async fn on_lost(&self);
}

pub struct Member {
    /// Advertised HTTP endpoint of this meta server
    endpoint: String,
    kv: Arc<dyn KvStore>,
    leader_key: String,
    lease: Duration,
    is_leader: AtomicBool,
    leader_addr: RwLock<Option<String>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Member {
    pub fn new(
        endpoint: impl Into<String>,
        kv: Arc<dyn KvStore>,
        leader_key: impl Into<String>,
        lease: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            kv,
            leader_key: leader_key.into(),
            lease,
            is_leader: AtomicBool::new(false),
            leader_addr: RwLock::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Current leader endpoint, read through the cache or from the store.
    pub async fn get_leader_addr(&self) -> Result<String> {
        if let Some(addr) = self.leader_addr.read().clone() {
            return Ok(addr);
        }
        match self.kv.get(&self.leader_key).await? {
            Some(raw) => {
                let addr = String::from_utf8_lossy(&raw).to_string();
                *self.leader_addr.write() = Some(addr.clone());
                Ok(addr)
            }
            None => Err(MetaError::unavailable("no leader elected yet")),
        }
    }

    /// Run the campaign loop until the process exits.
    pub fn start(self: Arc<Self>, listener: Arc<dyn LeadershipListener>) {
        let member = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = member.campaign(listener.clone()).await {
                    warn!("election round failed: {}, retrying", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.is_leader.store(false, Ordering::Release);
    }

    async fn campaign(&self, listener: Arc<dyn LeadershipListener>) -> Result<()> {
        let lease = self.kv.grant_lease(self.lease).await?;
        let won = self
            .kv
            .txn(
                vec![Compare::NotExists(self.leader_key.clone())],
                vec![Op::PutWithLease {
                    key: self.leader_key.clone(),
                    value: self.endpoint.clone().into_bytes(),
                    lease,
                }],
            )
            .await?;

        if won {
            info!("elected as leader: {}", self.endpoint);
            self.is_leader.store(true, Ordering::Release);
            *self.leader_addr.write() = Some(self.endpoint.clone());
            listener.on_elected().await;

            self.keep_leadership(lease).await;

            info!("leadership lost: {}", self.endpoint);
            self.is_leader.store(false, Ordering::Release);
            *self.leader_addr.write() = None;
            listener.on_lost().await;
            let _ = self.kv.revoke_lease(lease).await;
            return Ok(());
        }

        let _ = self.kv.revoke_lease(lease).await;
        self.observe_leader().await
    }

    /// Renew the lease until a renewal fails or the key stops being ours.
    async fn keep_leadership(&self, lease: kv::LeaseId) {
        let interval = self.lease / 3;
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.kv.keep_alive(lease).await {
                warn!("leader lease renewal failed: {}", e);
                return;
            }
            match self.kv.get(&self.leader_key).await {
                Ok(Some(raw)) if raw == self.endpoint.as_bytes() => {}
                Ok(_) => {
                    warn!("leader key no longer ours");
                    return;
                }
                Err(e) => {
                    warn!("leader key check failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Follow the current leader until its key goes away, then return so
    /// the caller campaigns again.
    async fn observe_leader(&self) -> Result<()> {
        let mut events = self.kv.watch_prefix(&self.leader_key).await?;
        if let Some(raw) = self.kv.get(&self.leader_key).await? {
            let addr = String::from_utf8_lossy(&raw).to_string();
            info!("following leader {}", addr);
            *self.leader_addr.write() = Some(addr);
        } else {
            // Leader vanished between the failed campaign and the watch.
            return Ok(());
        }
        while let Some(event) = events.recv().await {
            match event {
                WatchEvent::Put { value, .. } => {
                    *self.leader_addr.write() =
                        Some(String::from_utf8_lossy(&value).to_string());
                }
                WatchEvent::Delete { .. } | WatchEvent::Expired { .. } => {
                    info!("leader key expired, campaigning");
                    *self.leader_addr.write() = None;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv::MemKv;

    struct NopListener;

    #[async_trait]
    impl LeadershipListener for NopListener {
        async fn on_elected(&self) {}
        async fn on_lost(&self) {}
    }

    #[tokio::test]
    async fn test_single_member_wins() {
        let kv = Arc::new(MemKv::new());
        let member = Arc::new(Member::new(
            "127.0.0.1:8080",
            kv.clone(),
            "/meta/leader",
            Duration::from_secs(10),
        ));
        member.clone().start(Arc::new(NopListener));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(member.is_leader());
        assert_eq!(member.get_leader_addr().await.unwrap(), "127.0.0.1:8080");
        member.stop();
    }

    #[tokio::test]
    async fn test_second_member_follows() {
        let kv = Arc::new(MemKv::new());
        let first = Arc::new(Member::new(
            "127.0.0.1:8080",
            kv.clone(),
            "/meta/leader",
            Duration::from_secs(10),
        ));
        first.clone().start(Arc::new(NopListener));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = Arc::new(Member::new(
            "127.0.0.1:8081",
            kv.clone(),
            "/meta/leader",
            Duration::from_secs(10),
        ));
        second.clone().start(Arc::new(NopListener));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!second.is_leader());
        assert_eq!(second.get_leader_addr().await.unwrap(), "127.0.0.1:8080");
        first.stop();
        second.stop();
    }
}
