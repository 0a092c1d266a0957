//! Per-table load statistics
//!
//! Every row the loader applies comes back as a [`SubmitStatObject`]. The
//! [`StatsCollector`] folds those into one [`TableStat`] per `schema.table`,
//! counting successes and failures per operation kind and tracking progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::metrics;
use crate::pipeline::EventType;

/// Affected-row count reported when the target applied the row but could not
/// say how many rows changed
pub const AFFECT_UNKNOWN: i64 = -2;

/// Outcome of one applied row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitStatObject {
    pub schema: String,
    pub table: String,
    pub op: EventType,
    pub affect: i64,
    /// Rendered position reached by this row
    pub position: Option<String>,
    pub op_time: Option<DateTime<Utc>>,
}

impl SubmitStatObject {
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        op: EventType,
        affect: i64,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            op,
            affect,
            position: None,
            op_time: None,
        }
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn with_op_time(mut self, op_time: DateTime<Utc>) -> Self {
        self.op_time = Some(op_time);
        self
    }

    /// Whether the row took effect
    pub fn is_hit(&self) -> bool {
        self.affect > 0 || self.affect == AFFECT_UNKNOWN
    }
}

/// Counters for one table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStat {
    pub schema: String,
    pub table: String,
    pub insert_rows: u64,
    pub update_rows: u64,
    pub delete_rows: u64,
    pub error_insert_rows: u64,
    pub error_update_rows: u64,
    pub error_delete_rows: u64,
    /// Source time of the newest applied change
    pub last_loaded_data_time: Option<DateTime<Utc>>,
    /// Wall time of the newest applied change
    pub last_loaded_system_time: Option<DateTime<Utc>>,
    pub progress: Option<String>,
}

impl TableStat {
    fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            ..Self::default()
        }
    }

    pub fn total_success(&self) -> u64 {
        self.insert_rows + self.update_rows + self.delete_rows
    }

    pub fn total_errors(&self) -> u64 {
        self.error_insert_rows + self.error_update_rows + self.error_delete_rows
    }

    fn apply(&mut self, object: &SubmitStatObject) -> bool {
        let hit = object.is_hit();
        let counter = match (object.op, hit) {
            (EventType::Insert, true) => Some(&mut self.insert_rows),
            (EventType::Insert, false) => Some(&mut self.error_insert_rows),
            (EventType::Update, true) => Some(&mut self.update_rows),
            (EventType::Update, false) => Some(&mut self.error_update_rows),
            (EventType::Delete | EventType::Truncate, true) => Some(&mut self.delete_rows),
            (EventType::Delete | EventType::Truncate, false) => Some(&mut self.error_delete_rows),
            (EventType::Unknown, _) => None,
        };
        if let Some(counter) = counter {
            *counter += 1;
        }

        if let Some(op_time) = object.op_time {
            self.last_loaded_data_time = Some(op_time);
        }
        self.last_loaded_system_time = Some(Utc::now());
        if let Some(position) = &object.position {
            self.progress = Some(position.clone());
        }
        hit
    }
}

/// Statistics of one task swimlane
pub struct StatsCollector {
    task_id: String,
    swimlane_id: String,
    tables: Mutex<BTreeMap<(String, String), TableStat>>,
}

impl StatsCollector {
    pub fn new(task_id: impl Into<String>, swimlane_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            swimlane_id: swimlane_id.into(),
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fold one row outcome in, returning whether it was a hit
    pub fn record(&self, object: &SubmitStatObject) -> bool {
        let hit = {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            tables
                .entry((object.schema.clone(), object.table.clone()))
                .or_insert_with(|| TableStat::new(&object.schema, &object.table))
                .apply(object)
        };

        let qualified = format!("{}.{}", object.schema, object.table);
        metrics::record_row(&qualified, object.op.as_str(), hit);
        if !hit {
            tracing::error!(
                task_id = %self.task_id,
                swimlane_id = %self.swimlane_id,
                table = %qualified,
                op = %object.op,
                position = object.position.as_deref().unwrap_or("-"),
                "Row had no effect on target"
            );
        }
        hit
    }

    /// Fold a batch of outcomes in, returning the number of misses
    pub fn record_all(&self, objects: &[SubmitStatObject]) -> usize {
        objects.iter().filter(|o| !self.record(o)).count()
    }

    /// Fold a loaded batch in. Every table the batch touched takes the
    /// batch position as its progress; without one the row positions stand.
    pub fn record_batch(&self, objects: &[SubmitStatObject], position: Option<&str>) -> usize {
        let misses = self.record_all(objects);
        if let Some(position) = position {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            for object in objects {
                if let Some(stat) = tables.get_mut(&(object.schema.clone(), object.table.clone())) {
                    stat.progress = Some(position.to_string());
                }
            }
        }
        misses
    }

    pub fn table(&self, schema: &str, table: &str) -> Option<TableStat> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(&(schema.to_string(), table.to_string())).cloned()
    }

    pub fn snapshot(&self) -> Vec<TableStat> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.values().cloned().collect()
    }
}
