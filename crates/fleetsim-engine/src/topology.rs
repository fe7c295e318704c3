//! Host specifications
//!
//! The engine never parses topology files; callers hand it a fully-formed
//! ordered list of host specifications.

use serde::{Deserialize, Serialize};

use crate::types::HostId;

/// Static description of one simulated host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    pub id: HostId,
    pub name: String,
    pub cluster_tag: String,
    /// Number of vCPUs.
    pub cpu_count: u32,
    /// Capacity of one vCPU, in units per second.
    pub cpu_speed: f64,
    /// Memory capacity in MiB.
    pub memory_capacity: u64,
    pub power_model: PowerModel,
}

impl HostSpec {
    /// Total CPU capacity in units per second.
    pub fn cpu_capacity(&self) -> f64 {
        self.cpu_count as f64 * self.cpu_speed
    }
}

/// Power draw as a function of CPU utilization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PowerModel {
    Constant { watts: f64 },
    Linear { idle: f64, max: f64 },
}

impl PowerModel {
    /// Power draw in watts at the given utilization (clamped to [0, 1]).
    pub fn power(&self, utilization: f64) -> f64 {
        let u = utilization.clamp(0.0, 1.0);
        match *self {
            PowerModel::Constant { watts } => watts,
            PowerModel::Linear { idle, max } => idle + (max - idle) * u,
        }
    }
}
