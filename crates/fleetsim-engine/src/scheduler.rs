//! Host selection: filter + weigher pipeline
//!
//! Placement runs in two stages. Filters are independent boolean
//! predicates that eliminate infeasible hosts (logical AND across the
//! chain). For the survivors, each weigher produces a raw score that is
//! min-max normalized to [0, 1] across the candidate set, multiplied by
//! the weigher's multiplier, and summed; the highest aggregate wins, with
//! ties broken by host id so placement is reproducible.

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::types::{HostId, ServiceTask};

/// Snapshot of one host's capacity and load, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct HostView {
    pub host: HostId,
    pub instance_count: usize,
    pub cpu_count: u32,
    /// vCPUs provisioned to guests.
    pub cpu_used: u32,
    /// Memory capacity in MiB.
    pub memory_capacity: u64,
    /// Memory provisioned to guests, in MiB.
    pub memory_used: u64,
}

/// A boolean feasibility predicate over one resource dimension.
pub trait HostFilter {
    fn name(&self) -> &'static str;
    fn test(&self, host: &HostView, task: &ServiceTask) -> bool;
}

/// Rejects hosts whose memory cannot take the request.
///
/// A request larger than the host's raw capacity is always rejected:
/// overcommit is only permitted against other workloads, up to
/// `capacity * allocation_ratio`.
pub struct RamFilter {
    allocation_ratio: f64,
}

impl RamFilter {
    pub fn new(allocation_ratio: f64) -> Result<Self, SimError> {
        if allocation_ratio <= 0.0 {
            return Err(SimError::InvalidAllocationRatio(allocation_ratio));
        }
        Ok(RamFilter { allocation_ratio })
    }
}

impl HostFilter for RamFilter {
    fn name(&self) -> &'static str {
        "ram"
    }

    fn test(&self, host: &HostView, task: &ServiceTask) -> bool {
        if task.memory > host.memory_capacity {
            return false;
        }
        (host.memory_used + task.memory) as f64
            <= host.memory_capacity as f64 * self.allocation_ratio
    }
}

/// Rejects hosts whose vCPUs cannot take the request; same overcommit
/// rules as [`RamFilter`].
pub struct VCpuFilter {
    allocation_ratio: f64,
}

impl VCpuFilter {
    pub fn new(allocation_ratio: f64) -> Result<Self, SimError> {
        if allocation_ratio <= 0.0 {
            return Err(SimError::InvalidAllocationRatio(allocation_ratio));
        }
        Ok(VCpuFilter { allocation_ratio })
    }
}

impl HostFilter for VCpuFilter {
    fn name(&self) -> &'static str {
        "vcpu"
    }

    fn test(&self, host: &HostView, task: &ServiceTask) -> bool {
        if task.cpu_count > host.cpu_count {
            return false;
        }
        (host.cpu_used + task.cpu_count) as f64
            <= host.cpu_count as f64 * self.allocation_ratio
    }
}

/// Caps the number of guests per host.
pub struct InstanceCountFilter {
    max_instances: usize,
}

impl InstanceCountFilter {
    pub fn new(max_instances: usize) -> Self {
        InstanceCountFilter { max_instances }
    }
}

impl HostFilter for InstanceCountFilter {
    fn name(&self) -> &'static str {
        "instance-count"
    }

    fn test(&self, host: &HostView, _task: &ServiceTask) -> bool {
        host.instance_count < self.max_instances
    }
}

/// Scores surviving hosts; raw scores are normalized per weigher.
pub trait HostWeigher {
    fn name(&self) -> &'static str;
    fn weigh(&self, host: &HostView, task: &ServiceTask) -> f64;
    fn multiplier(&self) -> f64 {
        1.0
    }
}

/// Prefers hosts with more free memory.
pub struct RamWeigher {
    pub multiplier: f64,
}

impl HostWeigher for RamWeigher {
    fn name(&self) -> &'static str {
        "ram"
    }

    fn weigh(&self, host: &HostView, _task: &ServiceTask) -> f64 {
        host.memory_capacity.saturating_sub(host.memory_used) as f64
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

/// Prefers hosts with more free vCPU headroom.
pub struct VCpuWeigher {
    pub multiplier: f64,
}

impl HostWeigher for VCpuWeigher {
    fn name(&self) -> &'static str {
        "vcpu"
    }

    fn weigh(&self, host: &HostView, _task: &ServiceTask) -> f64 {
        host.cpu_count.saturating_sub(host.cpu_used) as f64
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

/// Prefers emptier hosts (spreading) for positive multipliers, fuller
/// hosts (packing) for negative ones.
pub struct InstanceCountWeigher {
    pub multiplier: f64,
}

impl HostWeigher for InstanceCountWeigher {
    fn name(&self) -> &'static str {
        "instance-count"
    }

    fn weigh(&self, host: &HostView, _task: &ServiceTask) -> f64 {
        -(host.instance_count as f64)
    }

    fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

/// The configured filter + weigher chain.
pub struct ComputeScheduler {
    filters: Vec<Box<dyn HostFilter>>,
    weighers: Vec<Box<dyn HostWeigher>>,
}

impl ComputeScheduler {
    pub fn new() -> Self {
        ComputeScheduler {
            filters: Vec::new(),
            weighers: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn HostFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_weigher(mut self, weigher: Box<dyn HostWeigher>) -> Self {
        self.weighers.push(weigher);
        self
    }

    /// Select a host for `task`, or `None` when no host passes filtering.
    /// The caller records failures; the scheduler never retries.
    pub fn select(&self, hosts: &[HostView], task: &ServiceTask) -> Option<HostId> {
        let mut candidates: Vec<&HostView> = hosts
            .iter()
            .filter(|h| self.filters.iter().all(|f| f.test(h, task)))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Stable id order makes the argmax tie-break deterministic.
        candidates.sort_by_key(|h| h.host);

        let mut totals = vec![0.0_f64; candidates.len()];
        for weigher in &self.weighers {
            let raw: Vec<f64> = candidates
                .iter()
                .map(|h| weigher.weigh(h, task))
                .collect();
            let min = raw.iter().copied().fold(f64::INFINITY, f64::min);
            let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let span = max - min;
            for (total, value) in totals.iter_mut().zip(&raw) {
                let normalized = if span > f64::EPSILON {
                    (value - min) / span
                } else {
                    0.0
                };
                *total += normalized * weigher.multiplier();
            }
        }

        let mut best = 0;
        for i in 1..candidates.len() {
            if totals[i] > totals[best] {
                best = i;
            }
        }
        Some(candidates[best].host)
    }
}

impl Default for ComputeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll-only statistics snapshot; the engine never pushes metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub hosts_available: u64,
    pub hosts_unavailable: u64,
    pub tasks_total: u64,
    pub tasks_pending: u64,
    pub tasks_active: u64,
    pub tasks_completed: u64,
    pub tasks_terminated: u64,
    pub attempts_success: u64,
    pub attempts_failure: u64,
}
