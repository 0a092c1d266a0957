//! Batches moving through the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::position::Position;

/// Kind of change carried by a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
    Truncate,
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
            Self::Truncate => "T",
            Self::Unknown => "?",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlRow {
    pub schema: String,
    pub table: String,
    pub op: EventType,
    /// Time the change happened at the source
    pub op_time: Option<DateTime<Utc>>,
    pub columns: BTreeMap<String, Option<String>>,
    /// Rendered source position of this row
    pub position: Option<String>,
}

impl EtlRow {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, op: EventType) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            op,
            op_time: None,
            columns: BTreeMap::new(),
            position: None,
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.columns.insert(name.into(), value.map(str::to_string));
        self
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn with_op_time(mut self, op_time: DateTime<Utc>) -> Self {
        self.op_time = Some(op_time);
        self
    }

    /// `schema.table`
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// One batch, with the checkpoint reached once it is applied
#[derive(Debug, Clone)]
pub struct EtlBucket {
    pub sequence: u64,
    pub position: Option<Arc<dyn Position>>,
    pub rows: Vec<EtlRow>,
    /// Failure carried from an upstream stage
    pub exception: Option<String>,
    used: bool,
}

impl EtlBucket {
    pub fn new(sequence: u64, rows: Vec<EtlRow>) -> Self {
        Self {
            sequence,
            position: None,
            rows,
            exception: None,
            used: true,
        }
    }

    pub fn with_position(mut self, position: impl Position + 'static) -> Self {
        self.position = Some(Arc::new(position));
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Release the rows once the batch is fully applied
    pub fn mark_unused(&mut self) {
        self.rows.clear();
        self.used = false;
    }
}
