//! Pull-based resource-flow engine
//!
//! Continuous resource sharing is modeled as a discrete pull/push protocol
//! instead of fixed timeslices. A capacity-limited sink (the multiplexer)
//! pulls a demand rate from every source, scales grants down proportionally
//! when aggregate demand exceeds capacity (fair share), and pushes the
//! grants back. Because one source's grant can depend on its siblings'
//! demand, pull/push rounds repeat at a single instant until every source
//! is stable; only then may simulated time advance. Rates are resource
//! units per second; work amounts are rate x seconds.

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::event::SimTime;

/// Rates closer than this are considered equal.
pub const RATE_EPSILON: f64 = 1e-9;

/// Remaining work below this is considered drained.
const WORK_EPSILON: f64 = 1e-6;

/// Identifier of a connection within one multiplexer.
pub type ConnectionId = u64;

/// What a source reports when pulled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowPull {
    /// Desired rate, valid for `valid_for` milliseconds from now.
    Demand { rate: f64, valid_for: SimTime },
    /// The source is exhausted; the next pull would be infinitely far away.
    Close,
}

/// A source of continuous resource demand.
pub trait FlowSource {
    /// Report the current demand. `capacity` is this connection's ceiling.
    fn on_pull(&mut self, now: SimTime, capacity: f64) -> FlowPull;

    /// Receive the granted rate. Returns `true` when the push changed the
    /// source's future demand and another convergence round is needed.
    fn on_push(&mut self, now: SimTime, granted: f64) -> bool;
}

/// A source attached to the multiplexer.
struct FlowConnection {
    id: ConnectionId,
    source: Box<dyn FlowSource>,
    /// Per-connection rate ceiling; the granted rate never exceeds it.
    capacity: f64,
    demand: f64,
    granted: f64,
    converged: bool,
    closed: bool,
}

/// Result of one convergence pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergeOutcome {
    pub total_demand: f64,
    pub total_granted: f64,
    /// `max(0, total_demand - total_granted)` at this instant.
    pub overcommissioned_rate: f64,
    /// Earliest instant at which any source's report expires.
    pub deadline: Option<SimTime>,
    /// Connections that closed during this pass.
    pub closed: Vec<ConnectionId>,
}

/// Capacity-limited sink aggregating several sources.
pub struct FlowMultiplexer {
    capacity: f64,
    connections: Vec<FlowConnection>,
    next_id: ConnectionId,
    last_converge: Option<SimTime>,
    overcommissioned_rate: f64,
    overcommissioned_total: f64,
}

impl FlowMultiplexer {
    pub fn new(capacity: f64) -> Self {
        FlowMultiplexer {
            capacity: capacity.max(0.0),
            connections: Vec::new(),
            next_id: 0,
            last_converge: None,
            overcommissioned_rate: 0.0,
            overcommissioned_total: 0.0,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Attach a source with a per-connection rate ceiling.
    pub fn add_source(&mut self, source: Box<dyn FlowSource>, capacity: f64) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;
        self.connections.push(FlowConnection {
            id,
            source,
            capacity: capacity.max(0.0),
            demand: 0.0,
            granted: 0.0,
            converged: false,
            closed: false,
        });
        id
    }

    /// Detach a connection. Returns `false` if it was not attached.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| c.id != id);
        self.connections.len() != before
    }

    pub fn active_connections(&self) -> usize {
        self.connections.iter().filter(|c| !c.closed).count()
    }

    /// Overcommission integrated over simulated time, in work units.
    pub fn overcommissioned_total(&self) -> f64 {
        self.overcommissioned_total
    }

    /// Run pull/push rounds at `now` until every source is stable.
    ///
    /// A fixed point under monotone scaling: bounded by the number of
    /// active sources, so the pass always terminates.
    pub fn converge(&mut self, now: SimTime) -> ConvergeOutcome {
        // Integrate the overcommission rate accrued since the last pass.
        if let Some(prev) = self.last_converge {
            let dt = (now - prev).max(0) as f64 / 1000.0;
            self.overcommissioned_total += self.overcommissioned_rate * dt;
        }
        self.last_converge = Some(now);

        let mut newly_closed = Vec::new();
        let mut deadline: Option<SimTime> = None;
        let max_rounds = self.active_connections() + 1;
        let mut total_demand = 0.0;
        let mut total_granted = 0.0;

        for _ in 0..max_rounds {
            deadline = None;
            total_demand = 0.0;

            for conn in self.connections.iter_mut().filter(|c| !c.closed) {
                match conn.source.on_pull(now, conn.capacity) {
                    FlowPull::Demand { rate, valid_for } => {
                        conn.demand = rate.clamp(0.0, conn.capacity);
                        total_demand += conn.demand;
                        if valid_for >= 0 {
                            if let Some(expiry) = now.checked_add(valid_for) {
                                deadline = Some(match deadline {
                                    Some(d) => d.min(expiry),
                                    None => expiry,
                                });
                            }
                        }
                    }
                    FlowPull::Close => {
                        conn.demand = 0.0;
                        conn.granted = 0.0;
                        conn.converged = true;
                        conn.closed = true;
                        newly_closed.push(conn.id);
                    }
                }
            }

            // Fair share: proportional scale-down when oversubscribed,
            // then clamp to each connection's ceiling.
            let scale = if total_demand > self.capacity && total_demand > 0.0 {
                self.capacity / total_demand
            } else {
                1.0
            };

            let mut stable = true;
            total_granted = 0.0;
            for conn in self.connections.iter_mut().filter(|c| !c.closed) {
                let granted = (conn.demand * scale).min(conn.capacity);
                let changed = (granted - conn.granted).abs() > RATE_EPSILON;
                conn.granted = granted;
                total_granted += granted;
                let should_reconverge = conn.source.on_push(now, granted);
                conn.converged = !(changed || should_reconverge);
                if !conn.converged {
                    stable = false;
                }
            }

            if stable {
                break;
            }
        }

        self.overcommissioned_rate = (total_demand - total_granted).max(0.0);
        ConvergeOutcome {
            total_demand,
            total_granted,
            overcommissioned_rate: self.overcommissioned_rate,
            deadline,
            closed: newly_closed,
        }
    }
}

/// One recorded interval of resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceFragment {
    pub duration_ms: SimTime,
    /// Usage rate during the interval, in units per second.
    pub usage: f64,
}

/// Replays pre-recorded `(duration, usage)` fragments in sequence and
/// closes once exhausted. Replay is grant-independent: a fragment lasts
/// its recorded duration regardless of how much was actually granted.
pub struct TraceFlowSource {
    fragments: Vec<TraceFragment>,
    idx: usize,
    fragment_end: SimTime,
    started: bool,
}

impl TraceFlowSource {
    pub fn new(fragments: Vec<TraceFragment>) -> Self {
        TraceFlowSource {
            fragments,
            idx: 0,
            fragment_end: 0,
            started: false,
        }
    }
}

impl FlowSource for TraceFlowSource {
    fn on_pull(&mut self, now: SimTime, _capacity: f64) -> FlowPull {
        if !self.started {
            self.started = true;
            self.fragment_end = match self.fragments.first() {
                Some(frag) => now.saturating_add(frag.duration_ms),
                None => now,
            };
        }
        while self.idx < self.fragments.len() && now >= self.fragment_end {
            self.idx += 1;
            if self.idx < self.fragments.len() {
                self.fragment_end = self
                    .fragment_end
                    .saturating_add(self.fragments[self.idx].duration_ms);
            }
        }
        if self.idx >= self.fragments.len() {
            return FlowPull::Close;
        }
        FlowPull::Demand {
            rate: self.fragments[self.idx].usage,
            valid_for: self.fragment_end - now,
        }
    }

    fn on_push(&mut self, _now: SimTime, _granted: f64) -> bool {
        false
    }
}

/// Drains a fixed amount of work at a caller-chosen utilization ratio and
/// self-closes once exhausted.
pub struct FixedFlowSource {
    remaining: f64,
    utilization: f64,
    granted: f64,
    last_update: Option<SimTime>,
}

impl FixedFlowSource {
    /// `amount` in work units, `utilization` in `(0, 1]` of the
    /// connection's capacity.
    pub fn new(amount: f64, utilization: f64) -> Result<Self, SimError> {
        if !(utilization > 0.0 && utilization <= 1.0) {
            return Err(SimError::InvalidWorkload(format!(
                "utilization must be in (0, 1], got {utilization}"
            )));
        }
        if !(amount.is_finite() && amount > 0.0) {
            return Err(SimError::InvalidWorkload(format!(
                "work amount must be positive and finite, got {amount}"
            )));
        }
        Ok(FixedFlowSource {
            remaining: amount,
            utilization,
            granted: 0.0,
            last_update: None,
        })
    }

    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    fn account(&mut self, now: SimTime) {
        if let Some(prev) = self.last_update {
            let dt = (now - prev).max(0) as f64 / 1000.0;
            self.remaining -= self.granted * dt;
        }
        self.last_update = Some(now);
    }
}

impl FlowSource for FixedFlowSource {
    fn on_pull(&mut self, now: SimTime, capacity: f64) -> FlowPull {
        self.account(now);
        if self.remaining <= WORK_EPSILON {
            return FlowPull::Close;
        }
        let rate = capacity * self.utilization;
        // Until the first push the expected rate is the demand itself.
        let expected = if self.granted > RATE_EPSILON {
            self.granted
        } else {
            rate
        };
        let valid_for = if expected > RATE_EPSILON {
            let ms = (self.remaining / expected * 1000.0).ceil();
            if ms >= SimTime::MAX as f64 {
                SimTime::MAX
            } else {
                ms as SimTime
            }
        } else {
            SimTime::MAX
        };
        FlowPull::Demand { rate, valid_for }
    }

    fn on_push(&mut self, now: SimTime, granted: f64) -> bool {
        self.account(now);
        let changed = (granted - self.granted).abs() > RATE_EPSILON;
        self.granted = granted;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Constant-demand source for exercising the sink in isolation.
    struct ConstSource {
        rate: f64,
    }

    impl FlowSource for ConstSource {
        fn on_pull(&mut self, _now: SimTime, _capacity: f64) -> FlowPull {
            FlowPull::Demand {
                rate: self.rate,
                valid_for: SimTime::MAX,
            }
        }
        fn on_push(&mut self, _now: SimTime, _granted: f64) -> bool {
            false
        }
    }

    #[test]
    fn fair_share_when_oversubscribed() {
        // 3500 + 3100 = 6600 demanded against 6400: grants total 6400
        // and 200 units/s are overcommissioned.
        let mut mux = FlowMultiplexer::new(6400.0);
        mux.add_source(Box::new(ConstSource { rate: 3500.0 }), 6400.0);
        mux.add_source(Box::new(ConstSource { rate: 3100.0 }), 6400.0);

        let outcome = mux.converge(0);
        assert!((outcome.total_demand - 6600.0).abs() < 1e-6);
        assert!((outcome.total_granted - 6400.0).abs() < 1e-6);
        assert!((outcome.overcommissioned_rate - 200.0).abs() < 1e-6);
    }

    #[test]
    fn grants_never_exceed_capacity() {
        let mut mux = FlowMultiplexer::new(1000.0);
        for rate in [900.0, 450.0, 250.0, 10.0] {
            mux.add_source(Box::new(ConstSource { rate }), 1000.0);
        }
        let outcome = mux.converge(0);
        assert!(outcome.total_granted <= mux.capacity() + 1e-9);
    }

    #[test]
    fn undersubscribed_demand_is_granted_in_full() {
        let mut mux = FlowMultiplexer::new(1000.0);
        mux.add_source(Box::new(ConstSource { rate: 300.0 }), 1000.0);
        mux.add_source(Box::new(ConstSource { rate: 200.0 }), 1000.0);

        let outcome = mux.converge(0);
        assert!((outcome.total_granted - 500.0).abs() < 1e-9);
        assert_eq!(outcome.overcommissioned_rate, 0.0);
    }

    #[test]
    fn per_connection_ceiling_is_enforced() {
        let mut mux = FlowMultiplexer::new(1000.0);
        mux.add_source(Box::new(ConstSource { rate: 800.0 }), 500.0);

        let outcome = mux.converge(0);
        assert!((outcome.total_granted - 500.0).abs() < 1e-9);
    }

    #[test]
    fn overcommission_integrates_over_time() {
        let mut mux = FlowMultiplexer::new(100.0);
        mux.add_source(Box::new(ConstSource { rate: 150.0 }), 200.0);

        mux.converge(0);
        mux.converge(2000); // 50 units/s over 2 s
        assert!((mux.overcommissioned_total() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn fixed_source_drains_and_closes() {
        // 1000 units at full utilization of a 1000 units/s connection:
        // exactly one second of work.
        let mut mux = FlowMultiplexer::new(1000.0);
        let source = FixedFlowSource::new(1000.0, 1.0).unwrap();
        let id = mux.add_source(Box::new(source), 1000.0);

        let outcome = mux.converge(0);
        assert!(outcome.closed.is_empty());
        assert_eq!(outcome.deadline, Some(1000));
        assert!((outcome.total_granted - 1000.0).abs() < 1e-9);

        let outcome = mux.converge(1000);
        assert_eq!(outcome.closed, vec![id]);
        assert_eq!(outcome.total_granted, 0.0);
    }

    #[test]
    fn fixed_source_deadline_stretches_under_contention() {
        // Two equal drains sharing one connection's worth of capacity
        // each get half the rate, so the deadline doubles.
        let mut mux = FlowMultiplexer::new(1000.0);
        mux.add_source(Box::new(FixedFlowSource::new(1000.0, 1.0).unwrap()), 1000.0);
        mux.add_source(Box::new(FixedFlowSource::new(1000.0, 1.0).unwrap()), 1000.0);

        let outcome = mux.converge(0);
        assert_eq!(outcome.deadline, Some(2000));
    }

    #[test]
    fn fixed_source_validates_parameters() {
        assert!(FixedFlowSource::new(100.0, 0.0).is_err());
        assert!(FixedFlowSource::new(100.0, 1.5).is_err());
        assert!(FixedFlowSource::new(0.0, 0.5).is_err());
        assert!(FixedFlowSource::new(-1.0, 0.5).is_err());
        assert!(FixedFlowSource::new(100.0, 1.0).is_ok());
    }

    #[test]
    fn trace_source_replays_fragments_in_order() {
        let fragments = vec![
            TraceFragment {
                duration_ms: 1000,
                usage: 300.0,
            },
            TraceFragment {
                duration_ms: 500,
                usage: 700.0,
            },
        ];
        let mut mux = FlowMultiplexer::new(1000.0);
        let id = mux.add_source(Box::new(TraceFlowSource::new(fragments)), 1000.0);

        let outcome = mux.converge(0);
        assert!((outcome.total_granted - 300.0).abs() < 1e-9);
        assert_eq!(outcome.deadline, Some(1000));

        let outcome = mux.converge(1000);
        assert!((outcome.total_granted - 700.0).abs() < 1e-9);
        assert_eq!(outcome.deadline, Some(1500));

        let outcome = mux.converge(1500);
        assert_eq!(outcome.closed, vec![id]);
    }

    #[test]
    fn empty_trace_closes_immediately() {
        let mut mux = FlowMultiplexer::new(1000.0);
        let id = mux.add_source(Box::new(TraceFlowSource::new(Vec::new())), 1000.0);
        let outcome = mux.converge(0);
        assert_eq!(outcome.closed, vec![id]);
    }

    #[test]
    fn convergence_rounds_are_bounded() {
        /// Pathological source that always asks for another round.
        struct Restless {
            pulls: u32,
        }
        impl FlowSource for Restless {
            fn on_pull(&mut self, _now: SimTime, _capacity: f64) -> FlowPull {
                self.pulls += 1;
                FlowPull::Demand {
                    rate: 100.0,
                    valid_for: SimTime::MAX,
                }
            }
            fn on_push(&mut self, _now: SimTime, _granted: f64) -> bool {
                true
            }
        }

        let mut mux = FlowMultiplexer::new(1000.0);
        mux.add_source(Box::new(Restless { pulls: 0 }), 1000.0);
        mux.add_source(Box::new(ConstSource { rate: 10.0 }), 1000.0);

        // Terminates despite the source never reporting stability.
        let outcome = mux.converge(0);
        assert!((outcome.total_granted - 110.0).abs() < 1e-9);
    }

    #[test]
    fn removed_connection_stops_participating() {
        let mut mux = FlowMultiplexer::new(1000.0);
        let a = mux.add_source(Box::new(ConstSource { rate: 600.0 }), 1000.0);
        mux.add_source(Box::new(ConstSource { rate: 600.0 }), 1000.0);

        let outcome = mux.converge(0);
        assert!((outcome.total_granted - 1000.0).abs() < 1e-9);

        assert!(mux.remove(a));
        assert!(!mux.remove(a));
        let outcome = mux.converge(1);
        assert!((outcome.total_granted - 600.0).abs() < 1e-9);
    }
}
