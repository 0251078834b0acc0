//! Single-assignment result slots, one per (phase, party) pair
//!
//! A slot is written exactly once by the driver of the party that owns it
//! and read by any number of other parties. The `watch` channel gives the
//! single-writer/many-reader discipline without extra locking.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::core::errors::PhaseError;
use crate::grid::types::{CellOutcome, ErasedOutcome, TypeInfo};

/// Type-erased storage behind a [`Cell`]
pub(crate) struct CellSlot {
    phase: usize,
    party: usize,
    output: TypeInfo,
    tx: watch::Sender<Option<ErasedOutcome>>,
}

impl CellSlot {
    pub(crate) fn new(phase: usize, party: usize, output: TypeInfo) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            phase,
            party,
            output,
            tx,
        }
    }

    /// Set the outcome. Returns false if the slot was already resolved, in
    /// which case the existing outcome is kept.
    pub(crate) fn resolve(&self, outcome: ErasedOutcome) -> bool {
        let success = outcome.is_ok();
        let mut outcome = Some(outcome);
        let written = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        });

        if written {
            debug!(
                "Cell ({}, {}) resolved, success: {}",
                self.phase, self.party, success
            );
        }
        written
    }

    pub(crate) fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub(crate) fn peek(&self) -> Option<ErasedOutcome> {
        self.tx.borrow().clone()
    }

    pub(crate) async fn wait(&self) -> ErasedOutcome {
        let mut rx = self.tx.subscribe();
        let seen = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        seen.unwrap_or(Err(PhaseError::Aborted {
            phase: self.phase,
            party: self.party,
        }))
    }
}

/// Typed view of the result of one party's computation in one phase.
///
/// Cloning a `Cell` yields another view of the same slot; lookups for the
/// same pair always address the same slot whether or not it has resolved.
pub struct Cell<Out> {
    slot: Arc<CellSlot>,
    _out: PhantomData<fn() -> Out>,
}

impl<Out> Clone for Cell<Out> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _out: PhantomData,
        }
    }
}

impl<Out> std::fmt::Debug for Cell<Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("phase", &self.slot.phase)
            .field("party", &self.slot.party)
            .field("done", &self.slot.is_done())
            .finish()
    }
}

impl<Out: Send + Sync + 'static> Cell<Out> {
    pub(crate) fn new(slot: Arc<CellSlot>) -> Self {
        Self {
            slot,
            _out: PhantomData,
        }
    }

    pub fn phase_index(&self) -> usize {
        self.slot.phase
    }

    pub fn party_index(&self) -> usize {
        self.slot.party
    }

    /// Whether the cell has resolved, successfully or not. Never blocks.
    pub fn is_done(&self) -> bool {
        self.slot.is_done()
    }

    /// The outcome if the cell has resolved, without waiting
    pub fn try_get(&self) -> Option<CellOutcome<Out>> {
        self.slot.peek().map(|outcome| self.typed(outcome))
    }

    /// Wait until the cell resolves
    pub async fn get(&self) -> CellOutcome<Out> {
        let outcome = self.slot.wait().await;
        self.typed(outcome)
    }

    /// Wait at most `limit` for the cell to resolve.
    ///
    /// An elapsed wait yields [`PhaseError::Timeout`]; a cell that resolved
    /// with an error yields that error, so the two stay distinguishable.
    pub async fn get_timeout(&self, limit: Duration) -> CellOutcome<Out> {
        match tokio::time::timeout(limit, self.slot.wait()).await {
            Ok(outcome) => self.typed(outcome),
            Err(_) => Err(PhaseError::Timeout {
                phase: self.slot.phase,
                party: self.slot.party,
                waited: limit,
            }),
        }
    }

    /// True when both views address the same slot
    pub fn same_cell(&self, other: &Cell<Out>) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    fn typed(&self, outcome: ErasedOutcome) -> CellOutcome<Out> {
        let value = outcome?;
        value.downcast::<Out>().map_err(|_| PhaseError::TypeMismatch {
            phase: self.slot.phase,
            party: self.slot.party,
            expected: std::any::type_name::<Out>(),
            actual: self.slot.output.name(),
        })
    }
}
