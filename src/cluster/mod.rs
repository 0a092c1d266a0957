//! Cluster coordination layer
//!
//! # Architecture
//!
//! ```text
//! CoordinationClient ─▶ ClusterEventBus ─▶ NodeRegistry ─▶ TaskEvent stream
//!                                              │
//!                                              ▼
//!                                 TaskAssignmentController
//! ```
//!
//! - [`NodeRegistry`] - registration, heartbeat, node commands, shutdown
//! - [`TaskAssignmentController`] - task locks and ownership bookkeeping
//! - [`ClusterEventBus`] - per-listener dispatch of store notifications
//! - [`ClusterProvider`] - typed entry point for [`ClusterCommand`]s
//! - [`NodeContext`] - the node's identity and runtime state
//!
//! All mutations of a node's stat entry hold the local [`PathLockRegistry`]
//! lock for that path and write back with a version check.

pub mod assignment;
pub mod bus;
pub mod command;
pub mod context;
pub mod locks;
pub mod model;
pub mod provider;
pub mod registry;

pub use assignment::TaskAssignmentController;
pub use bus::{ClusterEventBus, ClusterListener, EventBusHandle};
pub use command::{ClusterCommand, NodeCommand, TaskEvent};
pub use context::{progress_key, NodeContext, NodeSnapshot};
pub use locks::PathLockRegistry;
pub use model::{HealthLevel, Node, NodeStatus, TaskConfig, TaskLock, TaskStatus};
pub use provider::{ClusterBroadcaster, ClusterProvider};
pub use registry::{HeartbeatOutcome, NodeRegistry};

use std::sync::Arc;

use crate::config::NodeConfig;
use crate::coordination::CoordinationClient;

/// Fully wired cluster layer for one node
pub struct Cluster {
    pub context: Arc<NodeContext>,
    pub assignment: Arc<TaskAssignmentController>,
    pub registry: Arc<NodeRegistry>,
    pub provider: Arc<ClusterProvider>,
}

impl Cluster {
    /// Wire the cluster components around one coordination client
    pub fn new(client: Arc<dyn CoordinationClient>, config: NodeConfig) -> Self {
        let context = Arc::new(NodeContext::new(&config));
        Self::with_context(client, context, config)
    }

    pub fn with_context(
        client: Arc<dyn CoordinationClient>,
        context: Arc<NodeContext>,
        config: NodeConfig,
    ) -> Self {
        let locks = PathLockRegistry::new();
        let assignment = Arc::new(TaskAssignmentController::new(
            Arc::clone(&client),
            Arc::clone(&context),
            locks.clone(),
            config.write_attempts,
        ));
        let registry = Arc::new(NodeRegistry::new(
            Arc::clone(&client),
            Arc::clone(&context),
            Arc::clone(&assignment),
            locks,
            config,
        ));
        let provider = Arc::new(ClusterProvider::new(
            Arc::clone(&registry),
            Arc::clone(&assignment),
        ));

        Self {
            context,
            assignment,
            registry,
            provider,
        }
    }

    /// Event bus with the node registry already listening
    pub fn event_bus(&self, client: Arc<dyn CoordinationClient>) -> ClusterEventBus {
        let mut bus = ClusterEventBus::new(client);
        bus.register(Arc::clone(&self.registry) as Arc<dyn ClusterListener>);
        bus
    }
}
