//! Bear: deployment automation built around a phased computation grid.
//!
//! The [`grid`] runs a fixed set of parties (typically hosts) through an
//! ordered list of phases (checkout, build, restart, ...). Each party moves
//! at its own pace and any computation may read, or wait for, the result of
//! any party in any earlier phase. A failing party is broken for the rest of
//! the run without disturbing the others, and [`grid::Grid::aggregate_successful`]
//! summarises a phase with gaps where parties failed.
//!
//! The [`deploy`] module is the consumer side: remote command execution,
//! release folder bookkeeping, upstart jobs, and a pipeline that maps the
//! hosts of a stage onto a grid.

// Core infrastructure modules
pub mod core {
    pub mod errors;
    pub mod pool;

    pub use errors::{BearError, FlightError, PhaseError, Result};
    pub use pool::{PoolStats, WorkerPermit, WorkerPool};
}

pub mod config;
pub mod deploy;
pub mod grid;
pub mod logging;

// Re-exports for convenience
pub use crate::config::{BearConfig, HostConfig, ReleasesConfig, StageConfig};
pub use crate::core::errors::{BearError, FlightError, PhaseError, Result};
pub use crate::core::pool::{PoolStats, WorkerPool};
pub use crate::grid::{
    Cell, CellOutcome, Flight, Grid, GridBuilder, GridEvent, GridObserver, LoggingObserver,
    OnceEntered, Party, PartyState, Phase, PhaseComputation, PhaseContext, PhaseKey,
    RecordingObserver,
};
