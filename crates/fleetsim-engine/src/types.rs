//! Core types for the fleet layer

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flow::TraceFragment;

/// Identifier of a simulated host.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host-{}", self.0)
    }
}

/// Identifier of a submitted task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// The resource demand that drives a task's guest on its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkloadSpec {
    /// A fixed total amount of work (units) at a utilization ratio of the
    /// guest's CPU capacity.
    Fixed { amount: f64, utilization: f64 },
    /// Replay of pre-recorded usage fragments, sorted by offset.
    Trace(Vec<TraceFragment>),
}

/// A workload submitted for placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTask {
    pub id: TaskId,
    pub name: String,
    /// Requested vCPUs.
    pub cpu_count: u32,
    /// Requested memory in MiB.
    pub memory: u64,
    pub workload: WorkloadSpec,
}
