//! In-process coordination store
//!
//! Implements the full [`CoordinationClient`] contract on top of an ordered map
//! guarded by a single lock, so create-if-absent and version-checked writes are
//! atomic exactly like in a real coordination service. A handful of fault
//! injection hooks let tests reproduce races and session loss.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, RwLock};

use super::paths;
use super::{
    CoordinationClient, SessionState, StoreError, StoreNotification, StoreResult, Version,
    WatchEvent, WatchKind, ANY_VERSION,
};

/// Default capacity of the notification stream
const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    data: String,
    version: Version,
}

/// Coordination store kept entirely in memory
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    notifications: broadcast::Sender<StoreNotification>,
    failing_writes: AtomicUsize,
    conflicting_writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }

    /// Create an empty store with a custom notification buffer
    pub fn with_capacity(capacity: usize) -> Self {
        let (notifications, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: RwLock::new(BTreeMap::new()),
            notifications,
            failing_writes: AtomicUsize::new(0),
            conflicting_writes: AtomicUsize::new(0),
        }
    }

    /// Number of entries currently stored
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Report a connection loss followed by a successful reconnect
    pub fn simulate_session_loss(&self) {
        self.publish(StoreNotification::Session(SessionState::Disconnected));
        self.publish(StoreNotification::Session(SessionState::Reconnected));
    }

    /// Report an expired session
    pub fn expire_session(&self) {
        self.publish(StoreNotification::Session(SessionState::Expired));
    }

    /// Bump the version of an entry without touching its payload, the way a
    /// concurrent writer elsewhere in the cluster would
    pub async fn bump_version(&self, path: &str) -> StoreResult<Version> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        entry.version += 1;
        let version = entry.version;
        let data = entry.data.clone();
        drop(entries);

        self.publish_change(path, Some(data), WatchKind::DataChanged);
        Ok(version)
    }

    /// Make the next `count` mutating calls fail with a connection error
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` version-checked writes lose the race against a
    /// concurrent writer that lands just before them
    pub fn conflict_next_writes(&self, count: usize) {
        self.conflicting_writes.store(count, Ordering::SeqCst);
    }

    fn take_injected(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_write_fault(&self) -> StoreResult<()> {
        if Self::take_injected(&self.failing_writes) {
            return Err(StoreError::Connection("injected write failure".to_string()));
        }
        Ok(())
    }

    fn publish(&self, notification: StoreNotification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn publish_change(&self, path: &str, data: Option<String>, kind: WatchKind) {
        self.publish(StoreNotification::Changed(WatchEvent {
            path: path.to_string(),
            data,
            kind,
        }));
    }

    fn child_prefix(path: &str) -> String {
        format!("{}/", path.trim_end_matches('/'))
    }
}

#[async_trait]
impl CoordinationClient for MemoryStore {
    async fn create(&self, path: &str, data: &str) -> StoreResult<()> {
        self.check_write_fault()?;

        let mut entries = self.entries.write().await;
        if entries.contains_key(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }

        let mut created_parents = Vec::new();
        let mut cursor = paths::parent(path);
        while let Some(parent) = cursor {
            if entries.contains_key(parent) {
                break;
            }
            created_parents.push(parent.to_string());
            cursor = paths::parent(parent);
        }

        for parent in &created_parents {
            entries.insert(
                parent.clone(),
                Entry {
                    data: String::new(),
                    version: 0,
                },
            );
        }
        entries.insert(
            path.to_string(),
            Entry {
                data: data.to_string(),
                version: 0,
            },
        );
        drop(entries);

        for parent in created_parents.iter().rev() {
            self.publish_change(parent, Some(String::new()), WatchKind::Online);
        }
        self.publish_change(path, Some(data.to_string()), WatchKind::Online);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> StoreResult<Option<(String, Version)>> {
        Ok(self
            .entries
            .read()
            .await
            .get(path)
            .map(|e| (e.data.clone(), e.version)))
    }

    async fn exists(&self, path: &str) -> StoreResult<Option<Version>> {
        Ok(self.entries.read().await.get(path).map(|e| e.version))
    }

    async fn set_data(&self, path: &str, data: &str, expected: Version) -> StoreResult<Version> {
        self.check_write_fault()?;

        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;

        if expected != ANY_VERSION && Self::take_injected(&self.conflicting_writes) {
            entry.version += 1;
        }

        if expected != ANY_VERSION && entry.version != expected {
            return Err(StoreError::BadVersion {
                path: path.to_string(),
                expected,
                actual: entry.version,
            });
        }

        entry.data = data.to_string();
        entry.version += 1;
        let version = entry.version;
        drop(entries);

        self.publish_change(path, Some(data.to_string()), WatchKind::DataChanged);
        Ok(version)
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        self.check_write_fault()?;

        let mut entries = self.entries.write().await;
        if entries.remove(path).is_none() {
            return Ok(false);
        }

        let prefix = Self::child_prefix(path);
        let children: Vec<String> = entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for child in &children {
            entries.remove(child);
        }
        drop(entries);

        for child in children.iter().rev() {
            self.publish_change(child, None, WatchKind::Offline);
        }
        self.publish_change(path, None, WatchKind::Offline);
        Ok(true)
    }

    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let prefix = Self::child_prefix(path);
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreNotification> {
        self.notifications.subscribe()
    }
}
