//! lanesync - cluster coordination and staged execution for change-data-capture
//! replication
//!
//! Worker nodes cooperatively own (task, swimlane) pairs through a shared
//! hierarchical coordination store, then run each owned swimlane through a
//! transform and load pipeline that commits checkpoints as it goes.
//!
//! # Architecture
//!
//! - [`coordination`] - store contract, path layout, in-memory store
//! - [`cluster`] - node registry, heartbeat, commands, task locks
//! - [`pipeline`] - stage queues, transform and load stages, task stop
//! - [`stats`] - per-table load counters
//! - [`notifications`] - alarm sink, log and webhook channels
//! - [`status`] - read-only HTTP status endpoint
//! - [`config`] - configuration and validation
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lanesync::cluster::{Cluster, ClusterBroadcaster, ClusterCommand};
//! use lanesync::config::NodeConfig;
//! use lanesync::coordination::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let config = NodeConfig::builder().node_id("n1").address("10.0.0.1").build()?;
//!     let cluster = Cluster::new(store, config);
//!     cluster
//!         .provider
//!         .broadcast(ClusterCommand::NodeRegister { upload_statistic: true })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod notifications;
pub mod pipeline;
pub mod stats;
pub mod status;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{
        Cluster, ClusterBroadcaster, ClusterCommand, NodeCommand, NodeContext, NodeStatus,
        TaskConfig, TaskEvent,
    };
    pub use crate::config::Config;
    pub use crate::coordination::{CoordinationClient, MemoryStore};
    pub use crate::error::{Error, ErrorCategory, LanesyncErrorTrait, Result};
    pub use crate::notifications::{Alarm, AlarmKind, AlarmSink, NotificationManager};
    pub use crate::pipeline::{
        DataConsumer, EtlBucket, EtlRow, EventType, LoadOutcome, Loader, OffsetPosition,
        PipelineParts, Position, TaskPipeline, TaskWork,
    };
    pub use crate::stats::{StatsCollector, SubmitStatObject};
}
