//! Simulation instance: clock, event queue, process registry, run loop
//!
//! One `Simulation` is one logically single-threaded timeline. The loop
//! pops envelopes in `(time, seq)` order, advances the clock, and
//! dispatches to the target behavior. Two runs with the same seed and the
//! same schedule order produce bit-identical traces.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::SimError;
use crate::event::{Envelope, EventQueue, SimTime, TimerHandle};
use crate::process::{
    Behavior, Handled, Payload, ProcessEntry, ProcessId, ProcessRef, ProcessRegistry, ProcessState,
    Signal,
};

/// A discrete-event simulation instance.
pub struct Simulation<M> {
    clock: SimTime,
    queue: EventQueue<M>,
    registry: ProcessRegistry<M>,
    events_dispatched: u64,
}

impl<M: 'static> Simulation<M> {
    /// Create a new simulation starting at time zero.
    pub fn new() -> Self {
        Simulation {
            clock: 0,
            queue: EventQueue::new(),
            registry: ProcessRegistry::new(),
            events_dispatched: 0,
        }
    }

    /// Current simulated time in milliseconds.
    pub fn now(&self) -> SimTime {
        self.clock
    }

    /// Total envelopes dispatched so far.
    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched
    }

    /// Number of live processes.
    pub fn process_count(&self) -> usize {
        self.registry.len()
    }

    /// Schedule a message to `target` after `delay` milliseconds.
    ///
    /// Fails with [`SimError::InvalidDelay`] for negative delays and with
    /// [`SimError::ClockOverflow`] when `now + delay` does not fit the
    /// clock. Messages to a process that terminates before delivery are
    /// dropped silently at dispatch time.
    pub fn schedule(
        &mut self,
        target: &ProcessRef,
        msg: M,
        delay: SimTime,
    ) -> Result<TimerHandle, SimError> {
        if delay < 0 {
            return Err(SimError::InvalidDelay(delay));
        }
        let time = self
            .clock
            .checked_add(delay)
            .ok_or(SimError::ClockOverflow {
                now: self.clock,
                delay,
            })?;
        Ok(self.queue.push(time, target.id, Payload::Message(msg)))
    }

    /// Cancel a pending envelope. No-op if it already fired or was
    /// already cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.queue.cancel(handle);
    }

    /// Spawn a top-level process.
    ///
    /// Idempotent: if a root with this name already exists, its reference
    /// is returned and `behavior` is dropped.
    pub fn spawn_root(
        &mut self,
        name: &str,
        behavior: Box<dyn Behavior<M>>,
    ) -> Result<ProcessRef, SimError> {
        if let Some(&existing) = self.registry.roots.get(name) {
            return self.make_ref(existing);
        }
        let path: Rc<str> = Rc::from(name);
        let id = self.registry.insert(ProcessEntry {
            name: name.to_string(),
            path: path.clone(),
            parent: None,
            children: BTreeMap::new(),
            state: ProcessState::Created,
            behavior: Some(behavior),
        });
        self.registry.roots.insert(name.to_string(), id);
        self.queue
            .push(self.clock, id, Payload::Signal(Signal::PreStart));
        Ok(ProcessRef { id, path })
    }

    /// Spawn a child of `parent`.
    ///
    /// Idempotent: a pre-existing child with this name is returned as-is,
    /// without creating a duplicate or re-delivering `PreStart`.
    pub fn spawn_child(
        &mut self,
        parent: &ProcessRef,
        name: &str,
        behavior: Box<dyn Behavior<M>>,
    ) -> Result<ProcessRef, SimError> {
        let Some(entry) = self.registry.get(parent.id) else {
            return Err(SimError::UnknownProcess(parent.path.to_string()));
        };
        if let Some(&existing) = entry.children.get(name) {
            return self.make_ref(existing);
        }
        let path: Rc<str> = Rc::from(format!("{}/{}", parent.path, name));
        let id = self.registry.insert(ProcessEntry {
            name: name.to_string(),
            path: path.clone(),
            parent: Some(parent.id),
            children: BTreeMap::new(),
            state: ProcessState::Created,
            behavior: Some(behavior),
        });
        if let Some(p) = self.registry.get_mut(parent.id) {
            p.children.insert(name.to_string(), id);
        }
        self.queue
            .push(self.clock, id, Payload::Signal(Signal::PreStart));
        Ok(ProcessRef { id, path })
    }

    fn make_ref(&self, id: ProcessId) -> Result<ProcessRef, SimError> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| SimError::UnknownProcess(format!("#{}", id.0)))?;
        Ok(ProcessRef {
            id,
            path: entry.path.clone(),
        })
    }

    /// Stop a process and all of its descendants.
    ///
    /// Returns `false` if `target` is not part of this instance. Children
    /// are terminated first (post-order); every terminated process receives
    /// exactly one `PostStop`, delivered synchronously.
    pub fn stop(&mut self, target: &ProcessRef) -> bool {
        self.stop_id(target.id)
    }

    fn stop_id(&mut self, id: ProcessId) -> bool {
        let Some(entry) = self.registry.get(id) else {
            return false;
        };
        let name = entry.name.clone();
        match entry.parent {
            Some(parent) => {
                if let Some(p) = self.registry.get_mut(parent) {
                    p.children.remove(&name);
                }
            }
            None => {
                self.registry.roots.remove(&name);
            }
        }
        self.stop_subtree(id);
        true
    }

    fn stop_subtree(&mut self, id: ProcessId) {
        let children: Vec<ProcessId> = match self.registry.get(id) {
            Some(entry) => entry.children.values().copied().collect(),
            None => return,
        };
        for child in children {
            self.stop_subtree(child);
        }
        let Some(mut entry) = self.registry.remove(id) else {
            return;
        };
        // A behavior currently being dispatched has an empty slot here; its
        // PostStop is delivered by the dispatcher once the handler returns.
        if let Some(mut behavior) = entry.behavior.take() {
            let self_ref = ProcessRef {
                id,
                path: entry.path.clone(),
            };
            let mut ctx = Context {
                sim: self,
                self_ref: self_ref.clone(),
            };
            if let Err(err) = behavior.on_signal(&mut ctx, Signal::PostStop) {
                tracing::warn!(process = %self_ref, error = %err, "PostStop handler failed");
            }
        }
    }

    /// Stop every top-level process (and, transitively, everything else).
    pub fn close(&mut self) {
        let roots: Vec<ProcessId> = self.registry.roots.values().copied().collect();
        for id in roots {
            self.stop_id(id);
        }
    }

    /// Run until the queue is exhausted.
    pub fn run(&mut self) -> Result<(), SimError> {
        while let Some(env) = self.queue.pop() {
            self.step(env)?;
        }
        Ok(())
    }

    /// Run until the next envelope would be delivered after `until`.
    ///
    /// On return the clock equals `max(clock, until)`; time never moves
    /// backward, even on an empty queue.
    pub fn run_until(&mut self, until: SimTime) -> Result<(), SimError> {
        if until < 0 {
            return Err(SimError::InvalidDeadline(until));
        }
        while let Some(time) = self.queue.peek_time() {
            if time > until {
                break;
            }
            let Some(env) = self.queue.pop() else {
                break;
            };
            self.step(env)?;
        }
        if until > self.clock {
            self.clock = until;
        }
        Ok(())
    }

    fn step(&mut self, env: Envelope<M>) -> Result<(), SimError> {
        if env.time < self.clock {
            // Should be unreachable given the queue invariant; tolerated
            // and delivered at the current clock.
            tracing::warn!(
                event_time_ms = env.time,
                clock_ms = self.clock,
                "envelope dequeued behind the clock; delivering at the current time"
            );
        } else {
            self.clock = env.time;
        }
        self.events_dispatched += 1;
        self.dispatch(env)
    }

    fn dispatch(&mut self, env: Envelope<M>) -> Result<(), SimError> {
        let Some(entry) = self.registry.get_mut(env.target) else {
            tracing::trace!(
                target = env.target.0,
                "dropping envelope for unknown or terminated process"
            );
            return Ok(());
        };
        match env.payload {
            Payload::Signal(Signal::PreStart) => entry.state = ProcessState::Running,
            Payload::Message(_) if entry.state == ProcessState::Created => {
                // Unreachable through the public API: PreStart is queued at
                // spawn time with an earlier sequence number.
                tracing::trace!(process = %entry.path, "message delivered before PreStart");
            }
            _ => {}
        }
        let self_ref = ProcessRef {
            id: env.target,
            path: entry.path.clone(),
        };
        let Some(mut behavior) = entry.behavior.take() else {
            return Ok(());
        };
        let outcome = {
            let mut ctx = Context {
                sim: self,
                self_ref: self_ref.clone(),
            };
            match env.payload {
                Payload::Signal(sig) => behavior.on_signal(&mut ctx, sig),
                Payload::Message(msg) => behavior.on_message(&mut ctx, msg),
            }
        };
        if let Some(entry) = self.registry.get_mut(env.target) {
            entry.behavior = Some(behavior);
            if matches!(outcome?, Handled::Unhandled) {
                tracing::debug!(process = %self_ref, "payload not handled");
            }
        } else {
            // The process stopped itself (or an ancestor did) during the
            // handler; it is still owed its PostStop.
            outcome?;
            let mut ctx = Context {
                sim: self,
                self_ref: self_ref.clone(),
            };
            if let Err(err) = behavior.on_signal(&mut ctx, Signal::PostStop) {
                tracing::warn!(process = %self_ref, error = %err, "PostStop handler failed");
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push_raw(&mut self, time: SimTime, target: ProcessId, msg: M) {
        self.queue.push(time, target, Payload::Message(msg));
    }
}

impl<M: 'static> Default for Simulation<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable context handed to a behavior on every dispatch.
///
/// Borrows the whole simulation, so a handler can only interact with the
/// timeline through the scheduling API.
pub struct Context<'a, M> {
    sim: &'a mut Simulation<M>,
    self_ref: ProcessRef,
}

impl<'a, M: 'static> Context<'a, M> {
    /// Current simulated time in milliseconds.
    pub fn now(&self) -> SimTime {
        self.sim.clock
    }

    /// Reference to the process being dispatched.
    pub fn self_ref(&self) -> &ProcessRef {
        &self.self_ref
    }

    /// Schedule a message to another process.
    pub fn schedule(
        &mut self,
        target: &ProcessRef,
        msg: M,
        delay: SimTime,
    ) -> Result<TimerHandle, SimError> {
        self.sim.schedule(target, msg, delay)
    }

    /// Schedule a message to the current process.
    pub fn schedule_self(&mut self, msg: M, delay: SimTime) -> Result<TimerHandle, SimError> {
        let target = self.self_ref.clone();
        self.sim.schedule(&target, msg, delay)
    }

    /// Cancel a pending envelope (idempotent).
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.sim.cancel(handle);
    }

    /// Spawn (or return the existing) child of the current process.
    pub fn spawn(
        &mut self,
        name: &str,
        behavior: Box<dyn Behavior<M>>,
    ) -> Result<ProcessRef, SimError> {
        let parent = self.self_ref.clone();
        self.sim.spawn_child(&parent, name, behavior)
    }

    /// Stop a process subtree; see [`Simulation::stop`].
    pub fn stop(&mut self, target: &ProcessRef) -> bool {
        self.sim.stop(target)
    }
}
