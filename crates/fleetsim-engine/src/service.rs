//! Compute service: task queue, scheduling cycles, fleet facade
//!
//! The service is the root process of a fleet simulation. It owns the
//! pending-task queue, runs coalesced scheduling cycles over the host
//! pool, and reconciles task lifecycle notifications coming back from
//! hosts and the fault injector.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::error::SimError;
use crate::event::{SimTime, TimerHandle};
use crate::failure::{FailureModel, FaultTimeline};
use crate::host::{HostState, SimHost};
use crate::kernel::{Context, Simulation};
use crate::process::{Behavior, Handled, ProcessRef, Signal};
use crate::scheduler::{ComputeScheduler, SchedulerStats};
use crate::topology::HostSpec;
use crate::types::{HostId, ServiceTask, TaskId};

/// Every message exchanged between fleet processes.
#[derive(Debug, Clone)]
pub enum FleetMsg {
    // Service
    TaskSubmit(ServiceTask),
    SchedulingCycle,
    TaskFinished { task: TaskId, host: HostId },
    TasksInterrupted { tasks: Vec<TaskId>, host: HostId },
    HostRecovered { host: HostId },
    // Host
    LaunchGuest { task: ServiceTask },
    FlowSync,
    Fail,
    Recover,
    // Fault injector
    InjectorEnqueue { host: HostId },
    InjectorFire,
    InjectorFireDomain { host: HostId },
    InjectorRecover { victims: Vec<HostId> },
}

/// A host as the service sees it: its process plus shared live state.
pub struct HostHandle {
    pub actor: ProcessRef,
    pub state: Rc<RefCell<HostState>>,
}

/// Mutable service-wide state, shared with the fleet facade.
#[derive(Default)]
pub struct ServiceState {
    pub hosts: BTreeMap<HostId, HostHandle>,
    pub pending: VecDeque<ServiceTask>,
    pub active: BTreeMap<TaskId, HostId>,
    pub tasks_total: u64,
    pub tasks_completed: u64,
    pub tasks_terminated: u64,
    pub attempts_success: u64,
    pub attempts_failure: u64,
}

impl ServiceState {
    pub fn stats(&self) -> SchedulerStats {
        let available = self
            .hosts
            .values()
            .filter(|h| h.state.borrow().available)
            .count();
        SchedulerStats {
            hosts_available: available as u64,
            hosts_unavailable: (self.hosts.len() - available) as u64,
            tasks_total: self.tasks_total,
            tasks_pending: self.pending.len() as u64,
            tasks_active: self.active.len() as u64,
            tasks_completed: self.tasks_completed,
            tasks_terminated: self.tasks_terminated,
            attempts_success: self.attempts_success,
            attempts_failure: self.attempts_failure,
        }
    }
}

/// Root process behavior.
struct ComputeServiceActor {
    state: Rc<RefCell<ServiceState>>,
    scheduler: ComputeScheduler,
    /// True while a `SchedulingCycle` message is in flight; new triggers
    /// coalesce into it instead of queueing another pass.
    cycle_armed: bool,
}

impl ComputeServiceActor {
    fn request_cycle(&mut self, ctx: &mut Context<'_, FleetMsg>) -> Result<(), SimError> {
        if !self.cycle_armed && !self.state.borrow().pending.is_empty() {
            ctx.schedule_self(FleetMsg::SchedulingCycle, 0)?;
            self.cycle_armed = true;
        }
        Ok(())
    }

    /// One scheduling pass: walk the pending queue in order, place what
    /// fits, keep what does not for the next cycle.
    fn run_cycle(&mut self, ctx: &mut Context<'_, FleetMsg>) -> Result<(), SimError> {
        let mut unplaced = VecDeque::new();
        loop {
            // Take one task and snapshot host views without holding the
            // state borrow across the placement.
            let (task, views) = {
                let mut state = self.state.borrow_mut();
                let Some(task) = state.pending.pop_front() else {
                    break;
                };
                let views: Vec<_> = state
                    .hosts
                    .values()
                    .filter(|h| h.state.borrow().available)
                    .map(|h| h.state.borrow().view())
                    .collect();
                (task, views)
            };

            let placement = self.scheduler.select(&views, &task).and_then(|host| {
                let state = self.state.borrow();
                state.hosts.get(&host).map(|h| (host, h.actor.clone()))
            });
            match placement {
                Some((host, actor)) => {
                    {
                        let mut state = self.state.borrow_mut();
                        state.attempts_success += 1;
                        state.active.insert(task.id, host);
                        if let Some(handle) = state.hosts.get(&host) {
                            let mut hs = handle.state.borrow_mut();
                            hs.guests += 1;
                            hs.provisioned_cpu += task.cpu_count;
                            hs.provisioned_memory += task.memory;
                        }
                    }
                    tracing::debug!(task = %task.id, host = %host, "task placed");
                    ctx.schedule(&actor, FleetMsg::LaunchGuest { task }, 0)?;
                }
                None => {
                    self.state.borrow_mut().attempts_failure += 1;
                    tracing::debug!(task = %task.id, "no feasible host, task deferred");
                    unplaced.push_back(task);
                }
            }
        }
        self.state.borrow_mut().pending = unplaced;
        Ok(())
    }
}

impl Behavior<FleetMsg> for ComputeServiceActor {
    fn on_signal(
        &mut self,
        _ctx: &mut Context<'_, FleetMsg>,
        signal: Signal,
    ) -> Result<Handled, SimError> {
        if signal == Signal::PreStart {
            tracing::debug!(hosts = self.state.borrow().hosts.len(), "compute service started");
        }
        Ok(Handled::Done)
    }

    fn on_message(
        &mut self,
        ctx: &mut Context<'_, FleetMsg>,
        msg: FleetMsg,
    ) -> Result<Handled, SimError> {
        match msg {
            FleetMsg::TaskSubmit(task) => {
                {
                    let mut state = self.state.borrow_mut();
                    state.tasks_total += 1;
                    state.pending.push_back(task);
                }
                self.request_cycle(ctx)?;
                Ok(Handled::Done)
            }
            FleetMsg::SchedulingCycle => {
                self.cycle_armed = false;
                self.run_cycle(ctx)?;
                Ok(Handled::Done)
            }
            FleetMsg::TaskFinished { task, host } => {
                {
                    let mut state = self.state.borrow_mut();
                    state.active.remove(&task);
                    state.tasks_completed += 1;
                }
                tracing::debug!(task = %task, host = %host, "task completed");
                // Freed capacity may unblock deferred tasks.
                self.request_cycle(ctx)?;
                Ok(Handled::Done)
            }
            FleetMsg::TasksInterrupted { tasks, host } => {
                {
                    let mut state = self.state.borrow_mut();
                    for task in &tasks {
                        state.active.remove(task);
                        state.tasks_terminated += 1;
                    }
                }
                tracing::debug!(host = %host, count = tasks.len(), "tasks terminated by host failure");
                Ok(Handled::Done)
            }
            FleetMsg::HostRecovered { host } => {
                tracing::debug!(host = %host, "host back in service");
                self.request_cycle(ctx)?;
                Ok(Handled::Done)
            }
            _ => Ok(Handled::Unhandled),
        }
    }
}

/// Owning facade over one fleet simulation instance.
///
/// Construct it from a topology and a scheduler, submit tasks, optionally
/// install a failure model, then drive the clock with [`FleetService::run`]
/// or [`FleetService::run_until`].
pub struct FleetService {
    kernel: Simulation<FleetMsg>,
    root: ProcessRef,
    state: Rc<RefCell<ServiceState>>,
    injector: Option<ProcessRef>,
    timeline: Option<Rc<RefCell<FaultTimeline>>>,
}

impl FleetService {
    pub fn new(
        topology: Vec<HostSpec>,
        scheduler: ComputeScheduler,
    ) -> Result<Self, SimError> {
        let mut kernel = Simulation::new();
        let state = Rc::new(RefCell::new(ServiceState::default()));
        let root = kernel.spawn_root(
            "fleet",
            Box::new(ComputeServiceActor {
                state: Rc::clone(&state),
                scheduler,
                cycle_armed: false,
            }),
        )?;
        for spec in topology {
            let id = spec.id;
            let host_state = Rc::new(RefCell::new(HostState::new(spec)));
            let actor = kernel.spawn_child(
                &root,
                &id.to_string(),
                Box::new(SimHost::new(id, Rc::clone(&host_state), root.clone())),
            )?;
            state.borrow_mut().hosts.insert(
                id,
                HostHandle {
                    actor,
                    state: host_state,
                },
            );
        }
        Ok(FleetService {
            kernel,
            root,
            state,
            injector: None,
            timeline: None,
        })
    }

    /// Submit a task for placement after `delay` milliseconds.
    pub fn submit(&mut self, task: ServiceTask, delay: SimTime) -> Result<TimerHandle, SimError> {
        self.kernel.schedule(&self.root, FleetMsg::TaskSubmit(task), delay)
    }

    /// Spawn a fault injector from `model` and seed it with every host as
    /// a single-host fault domain.
    ///
    /// At most one injector per instance; a second call fails with
    /// [`SimError::InjectorInstalled`] and leaves the first untouched.
    pub fn install_injector(&mut self, model: FailureModel) -> Result<(), SimError> {
        if self.injector.is_some() {
            return Err(SimError::InjectorInstalled);
        }
        let timeline = Rc::new(RefCell::new(FaultTimeline::default()));
        let behavior = model.into_behavior(Rc::clone(&self.state), Rc::clone(&timeline))?;
        let injector = self.kernel.spawn_child(&self.root, "injector", behavior)?;
        let hosts: Vec<HostId> = self.state.borrow().hosts.keys().copied().collect();
        for host in hosts {
            self.kernel
                .schedule(&injector, FleetMsg::InjectorEnqueue { host }, 0)?;
        }
        self.injector = Some(injector);
        self.timeline = Some(timeline);
        Ok(())
    }

    /// Run until the event queue drains.
    pub fn run(&mut self) -> Result<(), SimError> {
        self.kernel.run()
    }

    /// Run until the queue drains or the clock would pass `until`.
    pub fn run_until(&mut self, until: SimTime) -> Result<(), SimError> {
        self.kernel.run_until(until)
    }

    pub fn now(&self) -> SimTime {
        self.kernel.now()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.state.borrow().stats()
    }

    /// Aggregate power draw of the fleet at the current instant, in watts.
    pub fn power_draw(&self) -> f64 {
        self.state
            .borrow()
            .hosts
            .values()
            .map(|h| h.state.borrow().power_draw())
            .sum()
    }

    /// The installed injector process, if any.
    pub fn injector(&self) -> Option<&ProcessRef> {
        self.injector.as_ref()
    }

    /// Recorded fault rounds, if a failure model is installed.
    pub fn fault_timeline(&self) -> Option<Rc<RefCell<FaultTimeline>>> {
        self.timeline.clone()
    }

    /// Stop every process, delivering `PostStop` through the whole tree.
    pub fn close(&mut self) {
        self.kernel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::Sampler;
    use crate::scheduler::{RamFilter, RamWeigher, VCpuFilter};
    use crate::topology::PowerModel;
    use crate::types::WorkloadSpec;

    fn host(id: u64, cpu_count: u32, memory: u64) -> HostSpec {
        HostSpec {
            id: HostId(id),
            name: format!("n{id}"),
            cluster_tag: "c0".into(),
            cpu_count,
            cpu_speed: 3200.0,
            memory_capacity: memory,
            power_model: PowerModel::Linear {
                idle: 100.0,
                max: 300.0,
            },
        }
    }

    fn fixed_task(id: u64, cpu_count: u32, memory: u64, amount: f64) -> ServiceTask {
        ServiceTask {
            id: TaskId(id),
            name: format!("t{id}"),
            cpu_count,
            memory,
            workload: WorkloadSpec::Fixed {
                amount,
                utilization: 1.0,
            },
        }
    }

    fn scheduler() -> ComputeScheduler {
        ComputeScheduler::new()
            .with_filter(Box::new(RamFilter::new(1.0).unwrap()))
            .with_filter(Box::new(VCpuFilter::new(1.0).unwrap()))
            .with_weigher(Box::new(RamWeigher { multiplier: 1.0 }))
    }

    #[test]
    fn task_runs_to_completion() {
        let mut fleet = FleetService::new(vec![host(0, 4, 8192)], scheduler()).unwrap();
        // 32000 units at one 3200 u/s vCPU: ten seconds of work.
        fleet.submit(fixed_task(0, 1, 1024, 32_000.0), 0).unwrap();
        fleet.run().unwrap();

        assert_eq!(fleet.now(), 10_000);
        let stats = fleet.stats();
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.tasks_active, 0);
        assert_eq!(stats.attempts_success, 1);
        // Idle again once the guest is gone.
        assert_eq!(fleet.power_draw(), 100.0);
    }

    #[test]
    fn oversized_task_stays_pending() {
        let mut fleet = FleetService::new(vec![host(0, 4, 1024)], scheduler()).unwrap();
        fleet.submit(fixed_task(0, 2, 4096, 1000.0), 0).unwrap();
        fleet.run().unwrap();

        let stats = fleet.stats();
        assert_eq!(stats.tasks_pending, 1);
        assert_eq!(stats.tasks_completed, 0);
        assert!(stats.attempts_failure >= 1);
    }

    #[test]
    fn completion_unblocks_deferred_task() {
        // One host with room for a single 2-vCPU guest at a time.
        let mut fleet = FleetService::new(vec![host(0, 2, 8192)], scheduler()).unwrap();
        fleet.submit(fixed_task(0, 2, 1024, 6400.0), 0).unwrap();
        fleet.submit(fixed_task(1, 2, 1024, 6400.0), 0).unwrap();
        fleet.run().unwrap();

        let stats = fleet.stats();
        assert_eq!(stats.tasks_completed, 2);
        assert_eq!(stats.tasks_pending, 0);
        // Second task waited for the first: 1s + 1s of work.
        assert_eq!(fleet.now(), 2_000);
    }

    #[test]
    fn contention_shares_capacity_fairly() {
        // Two 2-vCPU guests on a 2-vCPU host each get half the capacity,
        // so 6400 units of work take two seconds instead of one. The vCPU
        // cap is lifted so both land immediately.
        let mut fleet = FleetService::new(
            vec![host(0, 2, 8192)],
            ComputeScheduler::new()
                .with_filter(Box::new(RamFilter::new(1.0).unwrap()))
                .with_filter(Box::new(VCpuFilter::new(2.0).unwrap())),
        )
        .unwrap();
        fleet.submit(fixed_task(0, 2, 1024, 6_400.0), 0).unwrap();
        fleet.submit(fixed_task(1, 2, 1024, 6_400.0), 0).unwrap();
        fleet.run().unwrap();

        assert_eq!(fleet.now(), 2_000);
        assert_eq!(fleet.stats().tasks_completed, 2);
    }

    #[test]
    fn host_failure_terminates_running_tasks() {
        let mut fleet = FleetService::new(vec![host(0, 4, 8192)], scheduler()).unwrap();
        // Ten seconds of work, host dies at five.
        fleet.submit(fixed_task(0, 1, 1024, 32_000.0), 0).unwrap();
        fleet
            .install_injector(FailureModel::Uncorrelated {
                interarrival: Sampler::constant(5_000.0).unwrap(),
                duration: Sampler::constant(2_000.0).unwrap(),
                seed: 42,
            })
            .unwrap();
        fleet.run_until(18_000).unwrap();

        let stats = fleet.stats();
        assert_eq!(stats.tasks_terminated, 1);
        assert_eq!(stats.tasks_completed, 0);
        assert_eq!(stats.tasks_active, 0);
        // Host recovered at t=7s and has failed/recovered since.
        assert_eq!(stats.hosts_available, 1);

        let timeline = fleet.fault_timeline().unwrap();
        let timeline = timeline.borrow();
        assert!(!timeline.rounds.is_empty());
        assert_eq!(timeline.rounds[0].failed_at, 5_000);
        assert_eq!(timeline.rounds[0].recover_at, 7_000);
        assert_eq!(timeline.rounds[0].victims, vec![HostId(0)]);
    }

    #[test]
    fn correlated_faults_replay_with_same_seed() {
        let run = |seed: u64| {
            let topology: Vec<_> = (0..4).map(|i| host(i, 4, 8192)).collect();
            let mut fleet = FleetService::new(topology, scheduler()).unwrap();
            fleet
                .install_injector(FailureModel::Correlated {
                    interarrival: Sampler::exponential(1_000.0).unwrap(),
                    duration: Sampler::constant(500.0).unwrap(),
                    group_size: Sampler::constant(2.0).unwrap(),
                    seed,
                })
                .unwrap();
            fleet.run_until(10_000).unwrap();
            fleet.fault_timeline().unwrap().borrow().clone()
        };

        let a = run(7);
        let b = run(7);
        assert!(!a.rounds.is_empty());
        assert_eq!(a, b);
        // Group size two out of four domains.
        assert!(a.rounds.iter().all(|r| r.victims.len() == 2));

        let c = run(8);
        assert_ne!(a, c);
    }

    #[test]
    fn overflowing_fault_delay_is_abandoned() {
        let mut fleet = FleetService::new(vec![host(0, 4, 8192)], scheduler()).unwrap();
        fleet.submit(fixed_task(0, 1, 1024, 3_200.0), 0).unwrap();
        // Interarrival far beyond the representable clock: the injector
        // logs and goes dormant instead of wedging the run.
        fleet
            .install_injector(FailureModel::Uncorrelated {
                interarrival: Sampler::constant(1e19).unwrap(),
                duration: Sampler::constant(1_000.0).unwrap(),
                seed: 1,
            })
            .unwrap();
        fleet.run().unwrap();

        assert_eq!(fleet.stats().tasks_completed, 1);
        assert!(fleet.fault_timeline().unwrap().borrow().rounds.is_empty());
    }

    #[test]
    fn second_injector_installation_is_rejected() {
        let model = || FailureModel::Uncorrelated {
            interarrival: Sampler::constant(5_000.0).unwrap(),
            duration: Sampler::constant(1_000.0).unwrap(),
            seed: 42,
        };
        let mut fleet = FleetService::new(vec![host(0, 4, 8192)], scheduler()).unwrap();
        fleet.install_injector(model()).unwrap();
        let timeline = fleet.fault_timeline().unwrap();

        assert!(matches!(
            fleet.install_injector(model()),
            Err(SimError::InjectorInstalled)
        ));
        // The first injector and its timeline stay in place.
        let after = fleet.fault_timeline().unwrap();
        assert!(Rc::ptr_eq(&timeline, &after));
        fleet.run_until(6_000).unwrap();
        assert_eq!(timeline.borrow().rounds.len(), 1);
    }

    #[test]
    fn close_tears_down_the_tree() {
        let mut fleet = FleetService::new(vec![host(0, 4, 8192), host(1, 4, 8192)], scheduler())
            .unwrap();
        fleet.run().unwrap();
        fleet.close();
    }
}
