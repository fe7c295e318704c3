//! Error types for the simulation engine

use thiserror::Error;

/// Core error type for simulation operations
#[derive(Error, Debug)]
pub enum SimError {
    #[error("invalid delay: {0} ms (must be >= 0)")]
    InvalidDelay(i64),

    #[error("invalid run deadline: {0} ms (must be >= 0)")]
    InvalidDeadline(i64),

    #[error("simulated clock overflow: {delay} ms after {now} ms")]
    ClockOverflow { now: i64, delay: i64 },

    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error("allocation ratio must be positive, got {0}")]
    InvalidAllocationRatio(f64),

    #[error("failure intensity must be in (0, 1], got {0}")]
    InvalidIntensity(f64),

    #[error("invalid distribution parameter: {0}")]
    InvalidDistribution(String),

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),

    #[error("a fault injector is already installed")]
    InjectorInstalled,

    #[error("process error: {0}")]
    Process(String),
}
