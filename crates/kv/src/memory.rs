//! In-memory key-value store
//!
//! Implements the full store interface including leases and prefix watches.
//! Lease expiry is swept lazily on every operation and by an optional
//! background task, so tests get deterministic behavior without a runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Compare, KvError, KvStore, LeaseId, Op, WatchEvent};

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    watchers: Vec<Watcher>,
}

/// In-memory [`KvStore`]
pub struct MemKv {
    inner: Mutex<Inner>,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Spawn a background task sweeping expired leases every `interval`.
    pub fn start_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.sweep_expired();
            }
        })
    }

    /// Remove every key whose lease has run out, notifying watchers.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            inner.leases.remove(&lease_id);
            let dead_keys: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.lease == Some(lease_id))
                .map(|(k, _)| k.clone())
                .collect();
            for key in dead_keys {
                inner.entries.remove(&key);
                debug!("lease {} expired, dropping key {}", lease_id, key);
                notify(&mut inner.watchers, WatchEvent::Expired { key });
            }
        }
    }

    fn apply_op(inner: &mut Inner, op: Op) -> Result<(), KvError> {
        match op {
            Op::Put { key, value } => {
                inner.entries.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        lease: None,
                    },
                );
                notify(&mut inner.watchers, WatchEvent::Put { key, value });
            }
            Op::PutWithLease { key, value, lease } => {
                if !inner.leases.contains_key(&lease) {
                    return Err(KvError::LeaseNotFound(lease));
                }
                inner.entries.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        lease: Some(lease),
                    },
                );
                notify(&mut inner.watchers, WatchEvent::Put { key, value });
            }
            Op::Delete { key } => {
                if inner.entries.remove(&key).is_some() {
                    notify(&mut inner.watchers, WatchEvent::Delete { key });
                }
            }
        }
        Ok(())
    }
}

fn notify(watchers: &mut Vec<Watcher>, event: WatchEvent) {
    watchers.retain(|w| {
        if !event_key(&event).starts_with(&w.prefix) {
            return true;
        }
        // Drop watchers whose receiver side is gone.
        w.tx.send(event.clone()).is_ok()
    });
}

fn event_key(event: &WatchEvent) -> &str {
    match event {
        WatchEvent::Put { key, .. } | WatchEvent::Delete { key } | WatchEvent::Expired { key } => key,
    }
}

#[async_trait]
impl KvStore for MemKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.sweep_expired();
        let inner = self.inner.lock();
        Ok(inner.entries.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.sweep_expired();
        let mut inner = self.inner.lock();
        Self::apply_op(
            &mut inner,
            Op::Put {
                key: key.to_string(),
                value,
            },
        )
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<(), KvError> {
        self.sweep_expired();
        let mut inner = self.inner.lock();
        Self::apply_op(
            &mut inner,
            Op::PutWithLease {
                key: key.to_string(),
                value,
                lease,
            },
        )
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.sweep_expired();
        let mut inner = self.inner.lock();
        Self::apply_op(
            &mut inner,
            Op::Delete {
                key: key.to_string(),
            },
        )
    }

    async fn scan_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        self.sweep_expired();
        let inner = self.inner.lock();
        let mut result = Vec::new();
        for (key, entry) in inner.entries.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            result.push((key.clone(), entry.value.clone()));
            if limit != 0 && result.len() >= limit {
                break;
            }
        }
        Ok(result)
    }

    async fn txn(&self, compares: Vec<Compare>, ops: Vec<Op>) -> Result<bool, KvError> {
        self.sweep_expired();
        let mut inner = self.inner.lock();
        for compare in &compares {
            let holds = match compare {
                Compare::ValueEquals(key, expected) => {
                    inner.entries.get(key).map(|e| &e.value) == Some(expected)
                }
                Compare::NotExists(key) => !inner.entries.contains_key(key),
            };
            if !holds {
                return Ok(false);
            }
        }
        for op in ops {
            Self::apply_op(&mut inner, op)?;
        }
        Ok(true)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KvError> {
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), KvError> {
        self.sweep_expired();
        let mut inner = self.inner.lock();
        match inner.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(KvError::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        if inner.leases.remove(&lease).is_none() {
            return Err(KvError::LeaseNotFound(lease));
        }
        let dead_keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead_keys {
            inner.entries.remove(&key);
            notify(&mut inner.watchers, WatchEvent::Delete { key });
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>, KvError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let kv = MemKv::new();
        kv.put("/a/b", b"1".to_vec()).await.unwrap();
        assert_eq!(kv.get("/a/b").await.unwrap(), Some(b"1".to_vec()));
        kv.delete("/a/b").await.unwrap();
        assert_eq!(kv.get("/a/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_prefix_sorted_and_limited() {
        let kv = MemKv::new();
        kv.put("/t/3", b"c".to_vec()).await.unwrap();
        kv.put("/t/1", b"a".to_vec()).await.unwrap();
        kv.put("/t/2", b"b".to_vec()).await.unwrap();
        kv.put("/u/1", b"x".to_vec()).await.unwrap();

        let all = kv.scan_prefix("/t/", 0).await.unwrap();
        assert_eq!(
            all.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["/t/1", "/t/2", "/t/3"]
        );

        let limited = kv.scan_prefix("/t/", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_txn_compare_not_exists() {
        let kv = MemKv::new();
        let committed = kv
            .txn(
                vec![Compare::NotExists("/k".to_string())],
                vec![Op::Put {
                    key: "/k".to_string(),
                    value: b"v".to_vec(),
                }],
            )
            .await
            .unwrap();
        assert!(committed);

        // Second attempt must abort, the key exists now.
        let committed = kv
            .txn(
                vec![Compare::NotExists("/k".to_string())],
                vec![Op::Put {
                    key: "/k".to_string(),
                    value: b"w".to_vec(),
                }],
            )
            .await
            .unwrap();
        assert!(!committed);
        assert_eq!(kv.get("/k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_lease_expiry_fires_watch() {
        let kv = MemKv::new();
        let mut watch = kv.watch_prefix("/lease/").await.unwrap();

        let lease = kv.grant_lease(Duration::from_millis(20)).await.unwrap();
        kv.put_with_lease("/lease/k", b"v".to_vec(), lease).await.unwrap();
        assert_eq!(watch.recv().await.unwrap(), WatchEvent::Put {
            key: "/lease/k".to_string(),
            value: b"v".to_vec(),
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        kv.sweep_expired();

        assert_eq!(kv.get("/lease/k").await.unwrap(), None);
        assert_eq!(
            watch.recv().await.unwrap(),
            WatchEvent::Expired {
                key: "/lease/k".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_keep_alive_extends_lease() {
        let kv = MemKv::new();
        let lease = kv.grant_lease(Duration::from_millis(50)).await.unwrap();
        kv.put_with_lease("/ka/k", b"v".to_vec(), lease).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        kv.keep_alive(lease).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // 60ms elapsed but the lease was renewed at 30ms.
        assert_eq!(kv.get("/ka/k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_revoke_lease_drops_keys() {
        let kv = MemKv::new();
        let lease = kv.grant_lease(Duration::from_secs(10)).await.unwrap();
        kv.put_with_lease("/rv/k", b"v".to_vec(), lease).await.unwrap();
        kv.revoke_lease(lease).await.unwrap();
        assert_eq!(kv.get("/rv/k").await.unwrap(), None);
    }
}
