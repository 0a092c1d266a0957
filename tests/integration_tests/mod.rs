//! End-to-end scenarios over the in-memory coordination store
//!
//! - node registration, commands and recruitment across several nodes
//! - store faults: session loss, failed and conflicting writes
//! - a task pipeline wired to the real cluster provider
//! - webhook alarm delivery against a mock server

pub mod alarm_test;
pub mod cluster_test;
pub mod failure_scenarios;
pub mod fixtures;
pub mod pipeline_test;
