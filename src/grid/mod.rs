//! Phased computation grid
//!
//! A fixed set of parties runs through an ordered list of phases. Each
//! party advances at its own pace; any computation may read, and wait on,
//! the cell of any party in any phase.

pub mod cell;
pub mod coordinator;
pub mod hooks;
pub mod once;
pub mod party;
pub mod phase;
pub mod types;

pub use cell::Cell;
pub use coordinator::{Grid, GridBuilder};
pub use hooks::{GridObserver, LoggingObserver, RecordingObserver};
pub use once::{Flight, FlightOutcome, OnceEntered};
pub use party::Party;
pub use phase::{Phase, PhaseComputation, PhaseContext};
pub use types::{CellOutcome, GridEvent, PartyState, PhaseKey, TypeInfo};
