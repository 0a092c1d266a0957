//! Path layout of the coordination namespace
//!
//! ```text
//! node/<id>                      persistent node record
//! node/<id>/lock                 identity ownership marker
//! node/<id>/stat                 node record (status, health, tasks, heartbeat)
//! node/<id>/order/<cmdId>        node command, deleted after processing
//! task/<id>/dist/<swimlane>      task configuration
//! task/<id>/lock/<swimlane>      task lock
//! task/<id>/error/<swimlane>     error-stop marker
//! task/<id>/position/<swimlane>  last broadcast position
//! ```

use regex::Regex;
use std::sync::OnceLock;

/// Root of all node entries
pub const NODE_ROOT: &str = "node";

/// Root of all task entries
pub const TASK_ROOT: &str = "task";

pub fn node(node_id: &str) -> String {
    format!("{NODE_ROOT}/{node_id}")
}

pub fn node_lock(node_id: &str) -> String {
    format!("{NODE_ROOT}/{node_id}/lock")
}

pub fn node_stat(node_id: &str) -> String {
    format!("{NODE_ROOT}/{node_id}/stat")
}

pub fn node_orders(node_id: &str) -> String {
    format!("{NODE_ROOT}/{node_id}/order")
}

pub fn node_order(node_id: &str, command_id: &str) -> String {
    format!("{NODE_ROOT}/{node_id}/order/{command_id}")
}

pub fn task_dist_root(task_id: &str) -> String {
    format!("{TASK_ROOT}/{task_id}/dist")
}

pub fn task_dist(task_id: &str, swimlane_id: &str) -> String {
    format!("{TASK_ROOT}/{task_id}/dist/{swimlane_id}")
}

pub fn task_lock(task_id: &str, swimlane_id: &str) -> String {
    format!("{TASK_ROOT}/{task_id}/lock/{swimlane_id}")
}

pub fn task_error(task_id: &str, swimlane_id: &str) -> String {
    format!("{TASK_ROOT}/{task_id}/error/{swimlane_id}")
}

pub fn task_position(task_id: &str, swimlane_id: &str) -> String {
    format!("{TASK_ROOT}/{task_id}/position/{swimlane_id}")
}

/// Whether `path` is a command entry (`node/<id>/order/<cmdId>`)
pub fn is_node_order(path: &str) -> bool {
    static ORDER_RE: OnceLock<Regex> = OnceLock::new();
    let re = ORDER_RE
        .get_or_init(|| Regex::new(r"^node/[^/]+/order/[^/]+$").expect("Invalid regex pattern"));
    re.is_match(path)
}

/// Whether `path` is `prefix` itself or lies below it
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

/// Parent path, or `None` for a top level entry
pub fn parent(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| &path[..idx])
}
