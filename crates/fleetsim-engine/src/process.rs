//! Logical processes: identity, hierarchy, behaviors, and signals
//!
//! Processes live in an arena of records keyed by stable, never-reused ids.
//! A parent owns its children by id; a child keeps a non-owning back-index
//! to its parent. Paths are hierarchical (`"fleet/host-0"`) and unique
//! within a simulation instance. A terminated process simply leaves the
//! registry; envelopes addressed to it are dropped silently.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use crate::error::SimError;
use crate::kernel::Context;

/// Stable process identifier, never reused within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub(crate) u64);

/// Reference to a spawned process: stable id plus hierarchical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRef {
    pub(crate) id: ProcessId,
    pub(crate) path: Rc<str>,
}

impl ProcessRef {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// Control signals delivered around lifecycle edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Delivered once, before any message, at the spawn instant.
    PreStart,
    /// Delivered exactly once when the process is stopped.
    PostStop,
}

/// Payload of an envelope: a control signal or a domain message.
#[derive(Debug)]
pub enum Payload<M> {
    Signal(Signal),
    Message(M),
}

/// Outcome of handing a payload to a behavior.
///
/// `Unhandled` is not an error; the kernel reports it back (logged at
/// debug level) so higher layers may log or ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Done,
    Unhandled,
}

/// Behavior of a logical process.
///
/// Handlers receive a [`Context`] so they can schedule follow-up envelopes,
/// spawn children, or stop processes. A returned error propagates out of
/// the run loop and is fatal to the instance; the kernel does not supervise
/// or restart processes.
pub trait Behavior<M> {
    fn on_signal(&mut self, ctx: &mut Context<'_, M>, signal: Signal) -> Result<Handled, SimError> {
        let _ = (ctx, signal);
        Ok(Handled::Unhandled)
    }

    fn on_message(&mut self, ctx: &mut Context<'_, M>, msg: M) -> Result<Handled, SimError>;
}

/// Lifecycle state. Terminated processes leave the registry entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessState {
    Created,
    Running,
}

pub(crate) struct ProcessEntry<M> {
    pub(crate) name: String,
    pub(crate) path: Rc<str>,
    pub(crate) parent: Option<ProcessId>,
    /// Children by name; ordered so cascading stops are deterministic.
    pub(crate) children: BTreeMap<String, ProcessId>,
    pub(crate) state: ProcessState,
    /// Taken out of the slot while the behavior is being dispatched.
    pub(crate) behavior: Option<Box<dyn Behavior<M>>>,
}

/// Arena of process records owned by one simulation instance.
pub(crate) struct ProcessRegistry<M> {
    entries: HashMap<u64, ProcessEntry<M>>,
    /// Top-level processes by name.
    pub(crate) roots: BTreeMap<String, ProcessId>,
    next_id: u64,
}

impl<M> ProcessRegistry<M> {
    pub(crate) fn new() -> Self {
        ProcessRegistry {
            entries: HashMap::new(),
            roots: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn insert(&mut self, entry: ProcessEntry<M>) -> ProcessId {
        let id = ProcessId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id.0, entry);
        id
    }

    pub(crate) fn get(&self, id: ProcessId) -> Option<&ProcessEntry<M>> {
        self.entries.get(&id.0)
    }

    pub(crate) fn get_mut(&mut self, id: ProcessId) -> Option<&mut ProcessEntry<M>> {
        self.entries.get_mut(&id.0)
    }

    pub(crate) fn remove(&mut self, id: ProcessId) -> Option<ProcessEntry<M>> {
        self.entries.remove(&id.0)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
