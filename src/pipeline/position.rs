//! Checkpoint cursors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, monotonically advancing cursor into a task's source stream
pub trait Position: Send + Sync + fmt::Debug {
    /// Comparable string form, as stored and broadcast
    fn render(&self) -> String;

    /// Whether this value is durable enough to share with the cluster
    fn checksum(&self) -> bool;
}

/// Partition offset cursor, rendered as `<partition>:<offset>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OffsetPosition {
    pub partition: u32,
    pub offset: u64,
    /// Set once the source has acknowledged the offset
    pub durable: bool,
}

impl OffsetPosition {
    pub fn new(partition: u32, offset: u64) -> Self {
        Self {
            partition,
            offset,
            durable: true,
        }
    }

    pub fn transient(partition: u32, offset: u64) -> Self {
        Self {
            partition,
            offset,
            durable: false,
        }
    }

    /// Parse the rendered form back into a durable position
    pub fn parse(rendered: &str) -> Option<Self> {
        let (partition, offset) = rendered.split_once(':')?;
        Some(Self::new(partition.parse().ok()?, offset.parse().ok()?))
    }
}

impl Position for OffsetPosition {
    fn render(&self) -> String {
        format!("{}:{}", self.partition, self.offset)
    }

    fn checksum(&self) -> bool {
        self.durable
    }
}

impl fmt::Display for OffsetPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}
