//! Simulated host: guests, CPU flow multiplexer, fault handling
//!
//! Each host is a kernel process. Guests (one per placed task) are flow
//! sources attached to the host's CPU multiplexer; the host re-converges
//! the flow graph whenever a guest arrives or a source's report expires,
//! re-arming a single wake-up timer at the earliest deadline. A `Fail`
//! message terminates all guests and marks the host unavailable until
//! `Recover` arrives.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::SimError;
use crate::event::TimerHandle;
use crate::flow::{ConnectionId, FixedFlowSource, FlowMultiplexer, FlowSource, TraceFlowSource};
use crate::kernel::Context;
use crate::process::{Behavior, Handled, ProcessRef, Signal};
use crate::scheduler::HostView;
use crate::topology::HostSpec;
use crate::types::{HostId, ServiceTask, TaskId, WorkloadSpec};

/// Live host state, shared between the host process and the service.
///
/// One simulation instance is single-threaded, so `Rc<RefCell<HostState>>`
/// is the sharing mechanism. Provisioned amounts are reserved by the
/// service at placement time and released by the host when a guest leaves.
#[derive(Debug)]
pub struct HostState {
    pub spec: HostSpec,
    pub available: bool,
    /// Number of guests, including reservations not yet launched.
    pub guests: usize,
    pub provisioned_cpu: u32,
    pub provisioned_memory: u64,
    /// Aggregate CPU demand at the last convergence, units per second.
    pub cpu_demand: f64,
    /// Aggregate granted CPU rate at the last convergence.
    pub cpu_usage: f64,
}

impl HostState {
    pub fn new(spec: HostSpec) -> Self {
        HostState {
            spec,
            available: true,
            guests: 0,
            provisioned_cpu: 0,
            provisioned_memory: 0,
            cpu_demand: 0.0,
            cpu_usage: 0.0,
        }
    }

    /// Snapshot for the scheduler.
    pub fn view(&self) -> HostView {
        HostView {
            host: self.spec.id,
            instance_count: self.guests,
            cpu_count: self.spec.cpu_count,
            cpu_used: self.provisioned_cpu,
            memory_capacity: self.spec.memory_capacity,
            memory_used: self.provisioned_memory,
        }
    }

    /// Current power draw in watts, from the host's power model.
    pub fn power_draw(&self) -> f64 {
        let capacity = self.spec.cpu_capacity();
        let utilization = if capacity > 0.0 {
            self.cpu_usage / capacity
        } else {
            0.0
        };
        self.spec.power_model.power(utilization)
    }

    fn release(&mut self, cpu_count: u32, memory: u64) {
        self.guests = self.guests.saturating_sub(1);
        self.provisioned_cpu = self.provisioned_cpu.saturating_sub(cpu_count);
        self.provisioned_memory = self.provisioned_memory.saturating_sub(memory);
    }
}

#[derive(Debug, Clone, Copy)]
struct GuestRecord {
    task: TaskId,
    cpu_count: u32,
    memory: u64,
}

/// Host process behavior.
pub struct SimHost {
    id: HostId,
    state: Rc<RefCell<HostState>>,
    service: ProcessRef,
    cpu: FlowMultiplexer,
    guests: BTreeMap<ConnectionId, GuestRecord>,
    flow_timer: Option<TimerHandle>,
}

impl SimHost {
    pub fn new(id: HostId, state: Rc<RefCell<HostState>>, service: ProcessRef) -> Self {
        let capacity = state.borrow().spec.cpu_capacity();
        SimHost {
            id,
            state,
            service,
            cpu: FlowMultiplexer::new(capacity),
            guests: BTreeMap::new(),
            flow_timer: None,
        }
    }

    fn launch(
        &mut self,
        ctx: &mut Context<'_, crate::service::FleetMsg>,
        task: ServiceTask,
    ) -> Result<Handled, SimError> {
        if !self.state.borrow().available {
            // Failed between placement and delivery: hand the task back.
            self.state.borrow_mut().release(task.cpu_count, task.memory);
            ctx.schedule(
                &self.service.clone(),
                crate::service::FleetMsg::TasksInterrupted {
                    tasks: vec![task.id],
                    host: self.id,
                },
                0,
            )?;
            return Ok(Handled::Done);
        }

        let source: Box<dyn FlowSource> = match &task.workload {
            WorkloadSpec::Fixed {
                amount,
                utilization,
            } => Box::new(FixedFlowSource::new(*amount, *utilization)?),
            WorkloadSpec::Trace(fragments) => Box::new(TraceFlowSource::new(fragments.clone())),
        };
        let ceiling = task.cpu_count as f64 * self.state.borrow().spec.cpu_speed;
        let conn = self.cpu.add_source(source, ceiling);
        self.guests.insert(
            conn,
            GuestRecord {
                task: task.id,
                cpu_count: task.cpu_count,
                memory: task.memory,
            },
        );
        tracing::debug!(host = %self.id, task = %task.id, "guest launched");
        self.resync(ctx)
    }

    /// Converge the flow graph at the current instant and re-arm the
    /// wake-up timer at the earliest source deadline.
    fn resync(
        &mut self,
        ctx: &mut Context<'_, crate::service::FleetMsg>,
    ) -> Result<Handled, SimError> {
        let now = ctx.now();
        let outcome = self.cpu.converge(now);
        {
            let mut state = self.state.borrow_mut();
            state.cpu_demand = outcome.total_demand;
            state.cpu_usage = outcome.total_granted;
        }

        for conn in outcome.closed {
            if let Some(guest) = self.guests.remove(&conn) {
                self.cpu.remove(conn);
                self.state
                    .borrow_mut()
                    .release(guest.cpu_count, guest.memory);
                tracing::debug!(host = %self.id, task = %guest.task, "guest finished");
                ctx.schedule(
                    &self.service.clone(),
                    crate::service::FleetMsg::TaskFinished {
                        task: guest.task,
                        host: self.id,
                    },
                    0,
                )?;
            }
        }

        if let Some(stale) = self.flow_timer.take() {
            ctx.cancel(stale);
        }
        if let Some(deadline) = outcome.deadline {
            let delay = (deadline - now).max(0);
            self.flow_timer =
                Some(ctx.schedule_self(crate::service::FleetMsg::FlowSync, delay)?);
        }
        Ok(Handled::Done)
    }

    fn fail(
        &mut self,
        ctx: &mut Context<'_, crate::service::FleetMsg>,
    ) -> Result<Handled, SimError> {
        if !self.state.borrow().available {
            return Ok(Handled::Done);
        }
        let interrupted: Vec<TaskId> = self.guests.values().map(|g| g.task).collect();
        for (conn, guest) in std::mem::take(&mut self.guests) {
            self.cpu.remove(conn);
            self.state
                .borrow_mut()
                .release(guest.cpu_count, guest.memory);
        }
        if let Some(stale) = self.flow_timer.take() {
            ctx.cancel(stale);
        }
        {
            let mut state = self.state.borrow_mut();
            state.available = false;
            state.cpu_demand = 0.0;
            state.cpu_usage = 0.0;
        }
        tracing::debug!(host = %self.id, guests = interrupted.len(), "host failed");
        if !interrupted.is_empty() {
            ctx.schedule(
                &self.service.clone(),
                crate::service::FleetMsg::TasksInterrupted {
                    tasks: interrupted,
                    host: self.id,
                },
                0,
            )?;
        }
        Ok(Handled::Done)
    }

    fn recover(
        &mut self,
        ctx: &mut Context<'_, crate::service::FleetMsg>,
    ) -> Result<Handled, SimError> {
        if self.state.borrow().available {
            return Ok(Handled::Done);
        }
        self.state.borrow_mut().available = true;
        tracing::debug!(host = %self.id, "host recovered");
        ctx.schedule(
            &self.service.clone(),
            crate::service::FleetMsg::HostRecovered { host: self.id },
            0,
        )?;
        Ok(Handled::Done)
    }
}

impl Behavior<crate::service::FleetMsg> for SimHost {
    fn on_signal(
        &mut self,
        _ctx: &mut Context<'_, crate::service::FleetMsg>,
        signal: Signal,
    ) -> Result<Handled, SimError> {
        if signal == Signal::PreStart {
            tracing::trace!(host = %self.id, "host started");
        }
        Ok(Handled::Done)
    }

    fn on_message(
        &mut self,
        ctx: &mut Context<'_, crate::service::FleetMsg>,
        msg: crate::service::FleetMsg,
    ) -> Result<Handled, SimError> {
        use crate::service::FleetMsg;
        match msg {
            FleetMsg::LaunchGuest { task } => self.launch(ctx, task),
            FleetMsg::FlowSync => {
                self.flow_timer = None;
                self.resync(ctx)
            }
            FleetMsg::Fail => self.fail(ctx),
            FleetMsg::Recover => self.recover(ctx),
            _ => Ok(Handled::Unhandled),
        }
    }
}
