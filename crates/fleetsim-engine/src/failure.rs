//! Fault injection: stochastic and trace-driven host failures
//!
//! A failure model spawns as one injector process per simulation. All
//! three strategies speak the same protocol: the service enqueues each
//! host as a single-host fault domain at install time, the injector fires
//! `Fail`/`Recover` messages at the victims, and every round is appended
//! to a shared [`FaultTimeline`] so runs can be compared bit for bit.
//!
//! All randomness flows through one `ChaCha20Rng` seeded from the model,
//! which together with the deterministic kernel makes fault schedules
//! reproducible across runs and platforms.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Exp, LogNormal, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::event::SimTime;
use crate::kernel::Context;
use crate::process::{Behavior, Handled, Signal};
use crate::service::{FleetMsg, ServiceState};
use crate::types::HostId;

/// A validated sampling distribution over non-negative values.
///
/// Parameters are checked once at construction so drawing can never fail
/// mid-run.
#[derive(Debug, Clone)]
pub struct Sampler(Inner);

#[derive(Debug, Clone)]
enum Inner {
    Constant(f64),
    Uniform(Uniform<f64>),
    Exponential(Exp<f64>),
    LogNormal(LogNormal<f64>),
}

impl Sampler {
    pub fn constant(value: f64) -> Result<Self, SimError> {
        if !value.is_finite() || value < 0.0 {
            return Err(SimError::InvalidDistribution(format!(
                "constant sample must be finite and non-negative, got {value}"
            )));
        }
        Ok(Sampler(Inner::Constant(value)))
    }

    pub fn uniform(min: f64, max: f64) -> Result<Self, SimError> {
        if !min.is_finite() || !max.is_finite() || min < 0.0 || min >= max {
            return Err(SimError::InvalidDistribution(format!(
                "uniform bounds must satisfy 0 <= min < max, got [{min}, {max})"
            )));
        }
        Ok(Sampler(Inner::Uniform(Uniform::new(min, max))))
    }

    /// Exponential distribution given by its mean (not its rate).
    pub fn exponential(mean: f64) -> Result<Self, SimError> {
        if !mean.is_finite() || mean <= 0.0 {
            return Err(SimError::InvalidDistribution(format!(
                "exponential mean must be positive, got {mean}"
            )));
        }
        let dist = Exp::new(1.0 / mean).map_err(|e| {
            SimError::InvalidDistribution(format!("exponential(mean={mean}): {e}"))
        })?;
        Ok(Sampler(Inner::Exponential(dist)))
    }

    pub fn log_normal(mu: f64, sigma: f64) -> Result<Self, SimError> {
        let dist = LogNormal::new(mu, sigma).map_err(|e| {
            SimError::InvalidDistribution(format!("log-normal(mu={mu}, sigma={sigma}): {e}"))
        })?;
        Ok(Sampler(Inner::LogNormal(dist)))
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match &self.0 {
            Inner::Constant(v) => *v,
            Inner::Uniform(d) => d.sample(rng),
            Inner::Exponential(d) => d.sample(rng),
            Inner::LogNormal(d) => d.sample(rng),
        }
    }
}

/// One entry of a pre-recorded failure trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Delay from the previous failure (or from the start of the run).
    pub interval_ms: SimTime,
    /// How long the victims stay down.
    pub duration_ms: SimTime,
    /// Fraction of the host pool to fail, in (0, 1].
    pub intensity: f64,
}

impl FailureRecord {
    fn validate(&self) -> Result<(), SimError> {
        if !self.intensity.is_finite() || self.intensity <= 0.0 || self.intensity > 1.0 {
            return Err(SimError::InvalidIntensity(self.intensity));
        }
        if self.interval_ms < 0 {
            return Err(SimError::InvalidDelay(self.interval_ms));
        }
        if self.duration_ms < 0 {
            return Err(SimError::InvalidDelay(self.duration_ms));
        }
        Ok(())
    }
}

/// One fail/recover round as the injector executed it.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRound {
    pub victims: Vec<HostId>,
    pub failed_at: SimTime,
    pub recover_at: SimTime,
}

/// Record of every fault round of a run, shared with the fleet facade.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultTimeline {
    pub rounds: Vec<FaultRound>,
}

/// Configuration for a fault injector.
#[derive(Debug, Clone)]
pub enum FailureModel {
    /// Every fault domain fails on its own interarrival/duration process.
    Uncorrelated {
        interarrival: Sampler,
        duration: Sampler,
        seed: u64,
    },
    /// One shared interarrival process takes down a sampled group of
    /// domains at once; the next round is drawn after recovery.
    Correlated {
        interarrival: Sampler,
        duration: Sampler,
        group_size: Sampler,
        seed: u64,
    },
    /// Replay of recorded failure events against the live host pool.
    Trace {
        records: Vec<FailureRecord>,
        seed: u64,
    },
}

impl FailureModel {
    pub(crate) fn into_behavior(
        self,
        state: Rc<RefCell<ServiceState>>,
        timeline: Rc<RefCell<FaultTimeline>>,
    ) -> Result<Box<dyn Behavior<FleetMsg>>, SimError> {
        match self {
            FailureModel::Uncorrelated {
                interarrival,
                duration,
                seed,
            } => Ok(Box::new(UncorrelatedFaultInjector {
                state,
                timeline,
                interarrival,
                duration,
                rng: ChaCha20Rng::seed_from_u64(seed),
            })),
            FailureModel::Correlated {
                interarrival,
                duration,
                group_size,
                seed,
            } => Ok(Box::new(CorrelatedFaultInjector {
                state,
                timeline,
                interarrival,
                duration,
                group_size,
                rng: ChaCha20Rng::seed_from_u64(seed),
                pool: BTreeSet::new(),
                armed: false,
            })),
            FailureModel::Trace { records, seed } => {
                for record in &records {
                    record.validate()?;
                }
                Ok(Box::new(TraceFaultInjector {
                    state,
                    timeline,
                    records,
                    next: 0,
                    rng: ChaCha20Rng::seed_from_u64(seed),
                }))
            }
        }
    }
}

/// Convert a sampled delay in milliseconds to a clock delay, or `None`
/// when the delay itself or `now + delay` cannot be represented.
fn sampled_delay(now: SimTime, sample_ms: f64) -> Option<SimTime> {
    if !sample_ms.is_finite() || sample_ms < 0.0 || sample_ms >= SimTime::MAX as f64 {
        return None;
    }
    let delay = sample_ms as SimTime;
    now.checked_add(delay)?;
    Some(delay)
}

/// Uniform reservoir sample of `k` hosts out of `pool`, in id order.
fn reservoir_sample<R: Rng>(pool: &[HostId], k: usize, rng: &mut R) -> Vec<HostId> {
    let k = k.min(pool.len());
    let mut reservoir: Vec<HostId> = pool[..k].to_vec();
    for (i, host) in pool.iter().enumerate().skip(k) {
        let j = rng.gen_range(0..=i);
        if j < k {
            reservoir[j] = *host;
        }
    }
    reservoir.sort_unstable();
    reservoir
}

fn record_round(
    timeline: &Rc<RefCell<FaultTimeline>>,
    victims: Vec<HostId>,
    failed_at: SimTime,
    recover_at: SimTime,
) {
    timeline.borrow_mut().rounds.push(FaultRound {
        victims,
        failed_at,
        recover_at,
    });
}

struct UncorrelatedFaultInjector {
    state: Rc<RefCell<ServiceState>>,
    timeline: Rc<RefCell<FaultTimeline>>,
    interarrival: Sampler,
    duration: Sampler,
    rng: ChaCha20Rng,
}

impl UncorrelatedFaultInjector {
    fn arm(&mut self, ctx: &mut Context<'_, FleetMsg>, host: HostId) -> Result<(), SimError> {
        let sample = self.interarrival.sample(&mut self.rng);
        let Some(delay) = sampled_delay(ctx.now(), sample) else {
            tracing::warn!(host = %host, sample, "interarrival overflows the clock, fault domain goes dormant");
            return Ok(());
        };
        ctx.schedule_self(FleetMsg::InjectorFireDomain { host }, delay)?;
        Ok(())
    }

    fn fire(&mut self, ctx: &mut Context<'_, FleetMsg>, host: HostId) -> Result<(), SimError> {
        let now = ctx.now();
        let sample = self.duration.sample(&mut self.rng);
        // Checked before Fail is delivered, so an abandoned round never
        // strands a host failed with no recovery pending.
        let Some(duration) = sampled_delay(now, sample) else {
            tracing::warn!(host = %host, sample, "fault duration overflows the clock, round abandoned");
            return Ok(());
        };
        let actor = match self.state.borrow().hosts.get(&host) {
            Some(handle) => handle.actor.clone(),
            None => return Ok(()),
        };
        ctx.schedule(&actor, FleetMsg::Fail, 0)?;
        record_round(&self.timeline, vec![host], now, now + duration);
        ctx.schedule_self(FleetMsg::InjectorRecover { victims: vec![host] }, duration)?;
        Ok(())
    }
}

impl Behavior<FleetMsg> for UncorrelatedFaultInjector {
    fn on_message(
        &mut self,
        ctx: &mut Context<'_, FleetMsg>,
        msg: FleetMsg,
    ) -> Result<Handled, SimError> {
        match msg {
            FleetMsg::InjectorEnqueue { host } => {
                self.arm(ctx, host)?;
                Ok(Handled::Done)
            }
            FleetMsg::InjectorFireDomain { host } => {
                self.fire(ctx, host)?;
                Ok(Handled::Done)
            }
            FleetMsg::InjectorRecover { victims } => {
                for host in victims {
                    if let Some(handle) = self.state.borrow().hosts.get(&host) {
                        let actor = handle.actor.clone();
                        ctx.schedule(&actor, FleetMsg::Recover, 0)?;
                    }
                    // Restart the domain's interarrival process.
                    ctx.schedule_self(FleetMsg::InjectorEnqueue { host }, 0)?;
                }
                Ok(Handled::Done)
            }
            _ => Ok(Handled::Unhandled),
        }
    }
}

struct CorrelatedFaultInjector {
    state: Rc<RefCell<ServiceState>>,
    timeline: Rc<RefCell<FaultTimeline>>,
    interarrival: Sampler,
    duration: Sampler,
    group_size: Sampler,
    rng: ChaCha20Rng,
    pool: BTreeSet<HostId>,
    armed: bool,
}

impl CorrelatedFaultInjector {
    fn arm(&mut self, ctx: &mut Context<'_, FleetMsg>) -> Result<(), SimError> {
        if self.armed || self.pool.is_empty() {
            return Ok(());
        }
        let sample = self.interarrival.sample(&mut self.rng);
        let Some(delay) = sampled_delay(ctx.now(), sample) else {
            tracing::warn!(sample, "interarrival overflows the clock, injector goes dormant");
            return Ok(());
        };
        ctx.schedule_self(FleetMsg::InjectorFire, delay)?;
        self.armed = true;
        Ok(())
    }

    fn fire(&mut self, ctx: &mut Context<'_, FleetMsg>) -> Result<(), SimError> {
        self.armed = false;
        if self.pool.is_empty() {
            return Ok(());
        }
        let size = self.group_size.sample(&mut self.rng);
        let k = (size.round().max(1.0) as usize).min(self.pool.len());
        let sample = self.duration.sample(&mut self.rng);
        // Checked before any Fail is delivered; an abandoned round leaves
        // every domain up and re-arms for the next cycle.
        let Some(duration) = sampled_delay(ctx.now(), sample) else {
            tracing::warn!(sample, "fault duration overflows the clock, round abandoned");
            return self.arm(ctx);
        };

        let candidates: Vec<HostId> = self.pool.iter().copied().collect();
        let victims = reservoir_sample(&candidates, k, &mut self.rng);
        for host in &victims {
            self.pool.remove(host);
            if let Some(handle) = self.state.borrow().hosts.get(host) {
                let actor = handle.actor.clone();
                ctx.schedule(&actor, FleetMsg::Fail, 0)?;
            }
        }
        let now = ctx.now();
        record_round(&self.timeline, victims.clone(), now, now + duration);
        ctx.schedule_self(FleetMsg::InjectorRecover { victims }, duration)?;
        Ok(())
    }
}

impl Behavior<FleetMsg> for CorrelatedFaultInjector {
    fn on_message(
        &mut self,
        ctx: &mut Context<'_, FleetMsg>,
        msg: FleetMsg,
    ) -> Result<Handled, SimError> {
        match msg {
            FleetMsg::InjectorEnqueue { host } => {
                self.pool.insert(host);
                self.arm(ctx)?;
                Ok(Handled::Done)
            }
            FleetMsg::InjectorFire => {
                self.fire(ctx)?;
                Ok(Handled::Done)
            }
            FleetMsg::InjectorRecover { victims } => {
                for host in &victims {
                    if let Some(handle) = self.state.borrow().hosts.get(host) {
                        let actor = handle.actor.clone();
                        ctx.schedule(&actor, FleetMsg::Recover, 0)?;
                    }
                }
                self.pool.extend(victims);
                // The next round's interarrival starts after recovery.
                self.arm(ctx)?;
                Ok(Handled::Done)
            }
            _ => Ok(Handled::Unhandled),
        }
    }
}

struct TraceFaultInjector {
    state: Rc<RefCell<ServiceState>>,
    timeline: Rc<RefCell<FaultTimeline>>,
    records: Vec<FailureRecord>,
    next: usize,
    rng: ChaCha20Rng,
}

impl TraceFaultInjector {
    fn arm_next(&mut self, ctx: &mut Context<'_, FleetMsg>) -> Result<(), SimError> {
        if let Some(record) = self.records.get(self.next) {
            if ctx.now().checked_add(record.interval_ms).is_none() {
                tracing::warn!(
                    interval_ms = record.interval_ms,
                    "failure interval overflows the clock, replay stops"
                );
                return Ok(());
            }
            ctx.schedule_self(FleetMsg::InjectorFire, record.interval_ms)?;
        }
        Ok(())
    }

    fn fire(&mut self, ctx: &mut Context<'_, FleetMsg>) -> Result<(), SimError> {
        let Some(record) = self.records.get(self.next).copied() else {
            return Ok(());
        };
        self.next += 1;

        if ctx.now().checked_add(record.duration_ms).is_none() {
            tracing::warn!(
                duration_ms = record.duration_ms,
                "fault duration overflows the clock, round abandoned"
            );
            return self.arm_next(ctx);
        }

        // Victims come from hosts that are up right now.
        let pool: Vec<HostId> = {
            let state = self.state.borrow();
            state
                .hosts
                .iter()
                .filter(|(_, h)| h.state.borrow().available)
                .map(|(id, _)| *id)
                .collect()
        };
        if !pool.is_empty() {
            let k = ((record.intensity * pool.len() as f64).round() as usize).max(1);
            let victims = reservoir_sample(&pool, k, &mut self.rng);
            for host in &victims {
                if let Some(handle) = self.state.borrow().hosts.get(host) {
                    let actor = handle.actor.clone();
                    ctx.schedule(&actor, FleetMsg::Fail, 0)?;
                }
            }
            let now = ctx.now();
            record_round(&self.timeline, victims.clone(), now, now + record.duration_ms);
            ctx.schedule_self(
                FleetMsg::InjectorRecover { victims },
                record.duration_ms,
            )?;
        }
        self.arm_next(ctx)
    }
}

impl Behavior<FleetMsg> for TraceFaultInjector {
    fn on_signal(
        &mut self,
        ctx: &mut Context<'_, FleetMsg>,
        signal: Signal,
    ) -> Result<Handled, SimError> {
        if signal == Signal::PreStart {
            self.arm_next(ctx)?;
        }
        Ok(Handled::Done)
    }

    fn on_message(
        &mut self,
        ctx: &mut Context<'_, FleetMsg>,
        msg: FleetMsg,
    ) -> Result<Handled, SimError> {
        match msg {
            // Trace replay draws victims from the live pool, not from
            // enqueued domains.
            FleetMsg::InjectorEnqueue { .. } => Ok(Handled::Done),
            FleetMsg::InjectorFire => {
                self.fire(ctx)?;
                Ok(Handled::Done)
            }
            FleetMsg::InjectorRecover { victims } => {
                for host in &victims {
                    if let Some(handle) = self.state.borrow().hosts.get(host) {
                        let actor = handle.actor.clone();
                        ctx.schedule(&actor, FleetMsg::Recover, 0)?;
                    }
                }
                Ok(Handled::Done)
            }
            _ => Ok(Handled::Unhandled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ComputeScheduler;
    use crate::service::FleetService;
    use crate::topology::{HostSpec, PowerModel};

    fn host(id: u64) -> HostSpec {
        HostSpec {
            id: HostId(id),
            name: format!("n{id}"),
            cluster_tag: "c0".into(),
            cpu_count: 4,
            cpu_speed: 3200.0,
            memory_capacity: 8192,
            power_model: PowerModel::Constant { watts: 200.0 },
        }
    }

    #[test]
    fn sampler_rejects_bad_parameters() {
        assert!(Sampler::constant(-1.0).is_err());
        assert!(Sampler::constant(f64::NAN).is_err());
        assert!(Sampler::uniform(5.0, 5.0).is_err());
        assert!(Sampler::uniform(10.0, 2.0).is_err());
        assert!(Sampler::exponential(0.0).is_err());
        assert!(Sampler::exponential(-3.0).is_err());
        assert!(Sampler::log_normal(0.0, -1.0).is_err());
    }

    #[test]
    fn constant_sampler_is_constant() {
        let sampler = Sampler::constant(1234.5).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        assert_eq!(sampler.sample(&mut rng), 1234.5);
        assert_eq!(sampler.sample(&mut rng), 1234.5);
    }

    #[test]
    fn uniform_sampler_stays_in_bounds() {
        let sampler = Sampler::uniform(100.0, 200.0).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(17);
        for _ in 0..100 {
            let v = sampler.sample(&mut rng);
            assert!((100.0..200.0).contains(&v));
        }
    }

    #[test]
    fn reservoir_takes_everything_when_k_covers_the_pool() {
        let pool: Vec<HostId> = (0..5).map(HostId).collect();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        assert_eq!(reservoir_sample(&pool, 5, &mut rng), pool);
        assert_eq!(reservoir_sample(&pool, 9, &mut rng), pool);
    }

    #[test]
    fn reservoir_sample_is_a_sorted_subset() {
        let pool: Vec<HostId> = (0..50).map(HostId).collect();
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let picked = reservoir_sample(&pool, 7, &mut rng);
        assert_eq!(picked.len(), 7);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
        assert!(picked.iter().all(|h| pool.contains(h)));
    }

    #[test]
    fn sampled_delay_rejects_unrepresentable_values() {
        assert_eq!(sampled_delay(0, -1.0), None);
        assert_eq!(sampled_delay(0, f64::NAN), None);
        assert_eq!(sampled_delay(0, 1e19), None);
        assert_eq!(sampled_delay(0, 1500.7), Some(1500));
        // The delay fits the clock type but now + delay does not.
        assert_eq!(sampled_delay(SimTime::MAX - 1_000, 5e18), None);
        assert_eq!(sampled_delay(1_000, 5e18), Some(5_000_000_000_000_000_000));
    }

    #[test]
    fn trace_model_rejects_out_of_range_intensity() {
        for intensity in [0.0, -0.5, 1.5] {
            let model = FailureModel::Trace {
                records: vec![FailureRecord {
                    interval_ms: 1000,
                    duration_ms: 500,
                    intensity,
                }],
                seed: 0,
            };
            let state = Rc::new(RefCell::new(ServiceState::default()));
            let timeline = Rc::new(RefCell::new(FaultTimeline::default()));
            assert!(matches!(
                model.into_behavior(state, timeline),
                Err(SimError::InvalidIntensity(_))
            ));
        }
    }

    #[test]
    fn trace_injector_replays_records_in_order() {
        let mut fleet =
            FleetService::new(vec![host(0), host(1)], ComputeScheduler::new()).unwrap();
        fleet
            .install_injector(FailureModel::Trace {
                records: vec![
                    FailureRecord {
                        interval_ms: 1_000,
                        duration_ms: 500,
                        intensity: 1.0,
                    },
                    FailureRecord {
                        interval_ms: 2_000,
                        duration_ms: 500,
                        intensity: 0.5,
                    },
                ],
                seed: 5,
            })
            .unwrap();
        fleet.run().unwrap();

        let timeline = fleet.fault_timeline().unwrap();
        let timeline = timeline.borrow();
        assert_eq!(timeline.rounds.len(), 2);
        // Full-intensity round takes the whole pool down at t=1s.
        assert_eq!(timeline.rounds[0].failed_at, 1_000);
        assert_eq!(timeline.rounds[0].recover_at, 1_500);
        assert_eq!(timeline.rounds[0].victims, vec![HostId(0), HostId(1)]);
        // Second interval is relative to the first failure.
        assert_eq!(timeline.rounds[1].failed_at, 3_000);
        assert_eq!(timeline.rounds[1].victims.len(), 1);
        assert_eq!(fleet.stats().hosts_available, 2);
    }

    #[test]
    fn late_fault_duration_overflow_abandons_the_round() {
        // The interarrival fits the clock, so the domain fires deep into
        // the timeline; there now + duration no longer fits. The round is
        // abandoned before Fail is delivered and the run completes.
        let mut fleet = FleetService::new(vec![host(0)], ComputeScheduler::new()).unwrap();
        fleet
            .install_injector(FailureModel::Uncorrelated {
                interarrival: Sampler::constant(5e18).unwrap(),
                duration: Sampler::constant(5e18).unwrap(),
                seed: 3,
            })
            .unwrap();
        fleet.run().unwrap();

        assert_eq!(fleet.now(), 5_000_000_000_000_000_000);
        assert!(fleet.fault_timeline().unwrap().borrow().rounds.is_empty());
        assert_eq!(fleet.stats().hosts_available, 1);
    }

    #[test]
    fn trace_replay_stops_at_clock_end() {
        // First record fires; chaining the second interval would overflow
        // the clock, so replay stops after one round instead of erroring.
        let mut fleet = FleetService::new(vec![host(0)], ComputeScheduler::new()).unwrap();
        fleet
            .install_injector(FailureModel::Trace {
                records: vec![
                    FailureRecord {
                        interval_ms: 5_000_000_000_000_000_000,
                        duration_ms: 1_000,
                        intensity: 1.0,
                    },
                    FailureRecord {
                        interval_ms: 5_000_000_000_000_000_000,
                        duration_ms: 1_000,
                        intensity: 1.0,
                    },
                ],
                seed: 3,
            })
            .unwrap();
        fleet.run().unwrap();

        let timeline = fleet.fault_timeline().unwrap();
        let timeline = timeline.borrow();
        assert_eq!(timeline.rounds.len(), 1);
        assert_eq!(timeline.rounds[0].failed_at, 5_000_000_000_000_000_000);
        assert_eq!(fleet.stats().hosts_available, 1);
    }

    #[test]
    fn uncorrelated_domains_fail_independently() {
        let mut fleet =
            FleetService::new(vec![host(0), host(1)], ComputeScheduler::new()).unwrap();
        fleet
            .install_injector(FailureModel::Uncorrelated {
                interarrival: Sampler::constant(1_000.0).unwrap(),
                duration: Sampler::constant(500.0).unwrap(),
                seed: 9,
            })
            .unwrap();
        fleet.run_until(1_200).unwrap();

        let timeline = fleet.fault_timeline().unwrap();
        let timeline = timeline.borrow();
        // One round per domain, both at t=1s.
        assert_eq!(timeline.rounds.len(), 2);
        assert!(timeline.rounds.iter().all(|r| r.failed_at == 1_000));
        assert!(timeline.rounds.iter().all(|r| r.victims.len() == 1));
        assert_eq!(fleet.stats().hosts_unavailable, 2);
    }
}
