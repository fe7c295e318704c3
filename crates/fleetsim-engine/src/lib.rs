//! Discrete-event datacenter fleet simulator.
//!
//! The crate is layered. At the bottom sits a deterministic discrete-event
//! kernel ([`kernel::Simulation`]): a virtual clock, a time-ordered event
//! queue, and a tree of logical processes exchanging messages. On top of it,
//! the fleet layer models hosts whose CPUs are shared between guests by a
//! pull-based flow engine ([`flow::FlowMultiplexer`]), a compute service
//! that places submitted tasks through a filter/weigher scheduler
//! ([`scheduler::ComputeScheduler`]), and pluggable fault injectors
//! ([`failure::FailureModel`]) that take hosts down and bring them back.
//!
//! Everything is single-threaded and reproducible: equal-time events fire
//! in scheduling order, iteration orders are fixed, and all randomness is
//! drawn from seeded generators.

pub mod error;
pub mod event;
pub mod failure;
pub mod flow;
pub mod host;
pub mod kernel;
pub mod process;
pub mod scheduler;
pub mod service;
pub mod topology;
pub mod types;

pub use error::SimError;
pub use event::{SimTime, TimerHandle};
pub use failure::{FailureModel, FailureRecord, FaultRound, FaultTimeline, Sampler};
pub use kernel::{Context, Simulation};
pub use process::{Behavior, Handled, ProcessRef, Signal};
pub use scheduler::{ComputeScheduler, SchedulerStats};
pub use service::FleetService;
pub use topology::{HostSpec, PowerModel};
pub use types::{HostId, ServiceTask, TaskId, WorkloadSpec};
