//! Node identity and runtime state
//!
//! A single [`NodeContext`] is built at process start and shared by reference
//! with every component that needs the node's identity, status or health.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::model::{HealthLevel, Node, NodeStatus, TaskLock};
use crate::config::NodeConfig;

#[derive(Debug, Clone)]
struct Health {
    level: HealthLevel,
    desc: String,
}

/// Identity and mutable runtime state of the local node
#[derive(Debug)]
pub struct NodeContext {
    node_id: String,
    address: String,
    host_name: String,
    process_id: u32,
    force_assign: bool,
    upload_statistic: AtomicBool,
    registered: AtomicBool,
    work_limit: AtomicU32,
    status: RwLock<NodeStatus>,
    health: RwLock<Health>,
    consume_progress: RwLock<HashMap<String, i64>>,
    started_at: DateTime<Utc>,
}

/// Serializable view of the node served on `/node`
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub address: String,
    pub host_name: String,
    pub process_id: u32,
    pub status: NodeStatus,
    pub health_level: HealthLevel,
    pub health_level_desc: String,
    pub registered: bool,
    pub force_assign: bool,
    pub upload_statistic: bool,
    pub work_limit: u32,
    pub consume_progress: BTreeMap<String, i64>,
    pub started_at: DateTime<Utc>,
}

impl NodeContext {
    pub fn new(config: &NodeConfig) -> Self {
        let host_name = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        Self::with_identity(config, host_name, std::process::id())
    }

    /// Build a context with an explicit host name and process id
    pub fn with_identity(config: &NodeConfig, host_name: impl Into<String>, process_id: u32) -> Self {
        Self {
            node_id: config.node_id.clone(),
            address: config.address.clone(),
            host_name: host_name.into(),
            process_id,
            force_assign: config.force_assign,
            upload_statistic: AtomicBool::new(config.upload_statistic),
            registered: AtomicBool::new(false),
            work_limit: AtomicU32::new(config.work_limit),
            status: RwLock::new(NodeStatus::Working),
            health: RwLock::new(Health {
                level: HealthLevel::Green,
                desc: String::new(),
            }),
            consume_progress: RwLock::new(HashMap::new()),
            started_at: Utc::now(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn force_assign(&self) -> bool {
        self.force_assign
    }

    /// Lock payload naming this node
    pub fn identity(&self) -> TaskLock {
        TaskLock::new(&self.node_id, &self.address)
    }

    pub fn upload_statistic(&self) -> bool {
        self.upload_statistic.load(Ordering::SeqCst)
    }

    pub fn set_upload_statistic(&self, enabled: bool) {
        self.upload_statistic.store(enabled, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    pub fn work_limit(&self) -> u32 {
        self.work_limit.load(Ordering::SeqCst)
    }

    pub fn set_work_limit(&self, limit: u32) {
        self.work_limit.store(limit, Ordering::SeqCst);
    }

    pub async fn status(&self) -> NodeStatus {
        *self.status.read().await
    }

    /// Replace the status, returning the previous one
    pub async fn set_status(&self, status: NodeStatus) -> NodeStatus {
        let mut current = self.status.write().await;
        std::mem::replace(&mut *current, status)
    }

    pub async fn health(&self) -> (HealthLevel, String) {
        let health = self.health.read().await;
        (health.level, health.desc.clone())
    }

    pub async fn set_health(&self, level: HealthLevel, desc: impl Into<String>) {
        let mut health = self.health.write().await;
        health.level = level;
        health.desc = desc.into();
    }

    /// Cache the backlog reported by the last position commit
    pub async fn flush_consume_progress(&self, key: impl Into<String>, backlog: i64) {
        self.consume_progress.write().await.insert(key.into(), backlog);
    }

    pub async fn consume_progress(&self, key: &str) -> Option<i64> {
        self.consume_progress.read().await.get(key).copied()
    }

    pub async fn remove_consume_progress(&self, key: &str) {
        self.consume_progress.write().await.remove(key);
    }

    /// Fresh node record carrying the current identity, status and health
    pub async fn node_record(&self, tasks: BTreeMap<String, BTreeSet<String>>) -> Node {
        let (health_level, health_level_desc) = self.health().await;
        Node {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            host_name: self.host_name.clone(),
            process_id: self.process_id,
            status: self.status().await,
            health_level,
            health_level_desc,
            heartbeat: Some(Utc::now()),
            tasks,
        }
    }

    /// Overwrite the mutable fields of a stored record with the local view
    pub async fn refresh_record(&self, node: &mut Node) {
        let (level, desc) = self.health().await;
        node.address = self.address.clone();
        node.host_name = self.host_name.clone();
        node.process_id = self.process_id;
        node.status = self.status().await;
        node.health_level = level;
        node.health_level_desc = desc;
        node.heartbeat = Some(Utc::now());
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        let (health_level, health_level_desc) = self.health().await;
        NodeSnapshot {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            host_name: self.host_name.clone(),
            process_id: self.process_id,
            status: self.status().await,
            health_level,
            health_level_desc,
            registered: self.is_registered(),
            force_assign: self.force_assign,
            upload_statistic: self.upload_statistic(),
            work_limit: self.work_limit(),
            consume_progress: self
                .consume_progress
                .read()
                .await
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            started_at: self.started_at,
        }
    }
}

/// Key under which a swimlane's consume progress is cached
pub fn progress_key(task_id: &str, swimlane_id: &str) -> String {
    format!("{task_id}-{swimlane_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> NodeContext {
        let config = NodeConfig::builder()
            .node_id("n1")
            .address("10.0.0.1")
            .build()
            .unwrap();
        NodeContext::with_identity(&config, "host-a", 4242)
    }

    #[tokio::test]
    async fn test_status_swap() {
        let ctx = context();
        assert_eq!(ctx.status().await, NodeStatus::Working);
        let prev = ctx.set_status(NodeStatus::Suspend).await;
        assert_eq!(prev, NodeStatus::Working);
        assert_eq!(ctx.status().await, NodeStatus::Suspend);
    }

    #[tokio::test]
    async fn test_record_carries_identity() {
        let ctx = context();
        ctx.set_health(HealthLevel::Yellow, "slow target").await;
        let record = ctx.node_record(BTreeMap::new()).await;

        assert_eq!(record.node_id, "n1");
        assert_eq!(record.host_name, "host-a");
        assert_eq!(record.process_id, 4242);
        assert_eq!(record.health_level, HealthLevel::Yellow);
        assert!(record.heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_consume_progress() {
        let ctx = context();
        let key = progress_key("T1", "S1");
        assert_eq!(key, "T1-S1");

        ctx.flush_consume_progress(key.clone(), 12).await;
        assert_eq!(ctx.consume_progress(&key).await, Some(12));

        let snapshot = ctx.snapshot().await;
        assert_eq!(snapshot.consume_progress.get("T1-S1"), Some(&12));
    }
}
