//! Coordination store abstraction
//!
//! The cluster layer never talks to a concrete coordination service. It relies
//! on the primitives exposed by [`CoordinationClient`]:
//!
//! - atomic create-if-absent on a hierarchical path
//! - reads that return the payload together with its version
//! - version-checked writes
//! - children listing
//! - a change notification stream, including session state changes
//!
//! [`MemoryStore`] is an in-process implementation used by the standalone
//! binary and by the test-suite.

pub mod memory;
pub mod paths;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryStore;

/// Version token of a store entry. Every successful write bumps it by one.
pub type Version = i64;

/// Version value accepted by [`CoordinationClient::set_data`] to skip the check.
pub const ANY_VERSION: Version = -1;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the coordination store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Create on a path that already exists
    #[error("entry already exists: {0}")]
    NodeExists(String),

    /// Read or write on a path that does not exist
    #[error("entry not found: {0}")]
    NoNode(String),

    /// Conditional write lost the race
    #[error("version mismatch on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: Version,
        actual: Version,
    },

    /// The session was lost; held entries and watches are unverified
    #[error("coordination session expired")]
    SessionExpired,

    /// Transport level failure
    #[error("coordination store connection error: {0}")]
    Connection(String),
}

impl StoreError {
    /// Version conflicts and connection blips resolve themselves on the next cycle
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BadVersion { .. } | Self::Connection(_) | Self::SessionExpired
        )
    }
}

/// Kind of change carried by a [`WatchEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    /// Entry created
    Online,
    /// Entry removed
    Offline,
    /// Payload replaced
    DataChanged,
}

/// A single change notification from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub data: Option<String>,
    pub kind: WatchKind,
}

/// Session lifecycle reported by the store client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection lost, the session may still recover
    Disconnected,
    /// Connection restored; notifications in between may have been missed
    Reconnected,
    /// Session is gone for good and a new one was established
    Expired,
}

/// Everything a subscriber can observe on the notification stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreNotification {
    Changed(WatchEvent),
    Session(SessionState),
}

/// Client contract for the hierarchical coordination store
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create an entry, failing with [`StoreError::NodeExists`] if present.
    /// Missing parents are created implicitly with empty payloads.
    async fn create(&self, path: &str, data: &str) -> StoreResult<()>;

    /// Create an entry unless it already exists. Returns whether it was created.
    async fn create_when_not_exists(&self, path: &str, data: &str) -> StoreResult<bool> {
        match self.create(path, data).await {
            Ok(()) => Ok(true),
            Err(StoreError::NodeExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read payload and version in one round trip
    async fn get_data(&self, path: &str) -> StoreResult<Option<(String, Version)>>;

    /// Current version of an entry, if it exists
    async fn exists(&self, path: &str) -> StoreResult<Option<Version>>;

    /// Replace the payload if the entry is still at `expected`
    /// (or unconditionally with [`ANY_VERSION`]). Returns the new version.
    async fn set_data(&self, path: &str, data: &str, expected: Version) -> StoreResult<Version>;

    /// Delete an entry and its children. Returns false if it was already absent.
    async fn delete(&self, path: &str) -> StoreResult<bool>;

    /// Names of the direct children of `path`
    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Subscribe to the change stream. A fresh receiver must be taken after
    /// session recovery to re-establish watches.
    fn subscribe(&self) -> broadcast::Receiver<StoreNotification>;
}
