//! Grid - owns the phases, the parties and the cell matrix
//!
//! Every party runs its phases in order on its own spawned task, holding one
//! worker from the pool for its whole timeline. Parties never wait on each
//! other implicitly: cross-party ordering only exists where a computation
//! explicitly waits on another party's cell.

use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::errors::{BearError, PhaseError, Result};
use crate::core::pool::WorkerPool;
use crate::grid::cell::{Cell, CellSlot};
use crate::grid::hooks::GridObserver;
use crate::grid::party::Party;
use crate::grid::phase::{ErasedPhase, Phase, PhaseContext};
use crate::grid::types::{ErasedOutcome, GridEvent, PartyState, PhaseKey};

/// Collects the phases of a grid before it starts
pub struct GridBuilder<In> {
    name: String,
    phase_count: usize,
    inputs: Vec<In>,
    phases: Vec<Arc<dyn ErasedPhase<In>>>,
    observers: Vec<Arc<dyn GridObserver>>,
}

impl<In: Send + Sync + 'static> GridBuilder<In> {
    /// A grid of `phase_count` phases with one party per input
    pub fn new(phase_count: usize, inputs: impl IntoIterator<Item = In>) -> Self {
        Self {
            name: "grid".to_string(),
            phase_count,
            inputs: inputs.into_iter().collect(),
            phases: Vec::with_capacity(phase_count),
            observers: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn GridObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Append the next phase. Phases execute in the order they are added.
    pub fn add_phase<Out>(&mut self, phase: Phase<In, Out>) -> Result<PhaseKey<Out>>
    where
        Out: Send + Sync + 'static,
    {
        if self.phases.len() >= self.phase_count {
            return Err(BearError::configuration(format!(
                "grid '{}' declares {} phases, cannot add '{}'",
                self.name,
                self.phase_count,
                phase.name()
            )));
        }

        let key = PhaseKey::new(self.phases.len());
        debug!("Grid {}: phase {} is '{}'", self.name, key.index(), phase.name());
        self.phases.push(Arc::new(phase));
        Ok(key)
    }

    /// Create the parties and cells and spawn one driver per party.
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the
    /// drivers are spawned; use [`Grid::join`] to wait for them.
    pub fn start(self, pool: &WorkerPool) -> Result<Grid<In>> {
        if self.phases.len() != self.phase_count {
            return Err(BearError::configuration(format!(
                "grid '{}' declares {} phases but {} were added",
                self.name,
                self.phase_count,
                self.phases.len()
            )));
        }

        let party_count = self.inputs.len();
        if pool.capacity() < party_count {
            warn!(
                "Grid {}: pool has {} workers for {} parties, waits across parties may stall",
                self.name,
                pool.capacity(),
                party_count
            );
        }

        let parties: Vec<Arc<Party<In>>> = self
            .inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| Arc::new(Party::new(index, input)))
            .collect();

        // Row-major: all parties of phase 0, then phase 1, ...
        let mut cells = Vec::with_capacity(self.phase_count * party_count);
        for (phase_index, phase) in self.phases.iter().enumerate() {
            for party_index in 0..party_count {
                cells.push(Arc::new(CellSlot::new(
                    phase_index,
                    party_index,
                    phase.output(),
                )));
            }
        }

        let (finished, _) = watch::channel(0);
        let grid = Grid {
            inner: Arc::new(GridInner {
                name: self.name,
                phases: self.phases,
                parties,
                cells,
                observers: self.observers,
                pool: pool.clone(),
                finished,
            }),
        };

        info!(
            "Grid {} starting: {} phases x {} parties",
            grid.name(),
            grid.phase_count(),
            grid.party_count()
        );
        for party in &grid.inner.parties {
            tokio::spawn(drive_party(grid.clone(), party.clone()));
        }

        Ok(grid)
    }
}

struct GridInner<In> {
    name: String,
    phases: Vec<Arc<dyn ErasedPhase<In>>>,
    parties: Vec<Arc<Party<In>>>,
    cells: Vec<Arc<CellSlot>>,
    observers: Vec<Arc<dyn GridObserver>>,
    pool: WorkerPool,
    finished: watch::Sender<usize>,
}

/// Handle to a running grid. Cheap to clone.
pub struct Grid<In> {
    inner: Arc<GridInner<In>>,
}

impl<In> Clone for Grid<In> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<In> std::fmt::Debug for Grid<In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grid")
            .field("name", &self.inner.name)
            .field("phases", &self.inner.phases.len())
            .field("parties", &self.inner.parties.len())
            .finish()
    }
}

impl<In: Send + Sync + 'static> Grid<In> {
    pub fn builder(phase_count: usize, inputs: impl IntoIterator<Item = In>) -> GridBuilder<In> {
        GridBuilder::new(phase_count, inputs)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn phase_count(&self) -> usize {
        self.inner.phases.len()
    }

    pub fn party_count(&self) -> usize {
        self.inner.parties.len()
    }

    pub fn phase_name(&self, phase: usize) -> Arc<str> {
        self.check_phase(phase);
        self.inner.phases[phase].name()
    }

    pub fn parties(&self) -> &[Arc<Party<In>>] {
        &self.inner.parties
    }

    pub fn party(&self, index: usize) -> &Arc<Party<In>> {
        self.check_party(index);
        &self.inner.parties[index]
    }

    /// The cell of `party` in the phase behind `key`.
    ///
    /// Repeated lookups address the same slot.
    ///
    /// # Panics
    ///
    /// If `party` is out of range or `key` belongs to a larger grid.
    pub fn cell<Out: Send + Sync + 'static>(&self, key: PhaseKey<Out>, party: usize) -> Cell<Out> {
        Cell::new(self.slot(key.index(), party).clone())
    }

    /// Every party's cell for one phase, in party order
    pub fn phase_cells<Out: Send + Sync + 'static>(&self, key: PhaseKey<Out>) -> Vec<Cell<Out>> {
        (0..self.party_count())
            .map(|party| self.cell(key, party))
            .collect()
    }

    /// Result of `party` in the phase before `phase_index`.
    ///
    /// Waits for that cell to resolve. `None` for the first phase, for a
    /// failed cell, and for a value that is not a `T`.
    pub async fn previous_result<T: Send + Sync + 'static>(
        &self,
        party: &Party<In>,
        phase_index: usize,
    ) -> Option<Arc<T>> {
        if phase_index == 0 {
            return None;
        }
        let slot = self.slot(phase_index - 1, party.index()).clone();
        let value = slot.wait().await.ok()?;
        value.downcast::<T>().ok()
    }

    /// Successful results of one phase, one entry per party in party order.
    ///
    /// Waits until every cell of the phase resolved. Failed parties show up
    /// as `None`. Fails as a whole only if a party never ran because the
    /// pool was shut down, or if `key` does not describe the stored values.
    pub async fn aggregate_successful<Out: Send + Sync + 'static>(
        &self,
        key: PhaseKey<Out>,
    ) -> Result<Vec<Option<Arc<Out>>>> {
        let cells = self.phase_cells(key);
        let outcomes = join_all(cells.iter().map(|cell| cell.get())).await;

        outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Ok(value) => Ok(Some(value)),
                Err(e @ PhaseError::Aborted { .. }) | Err(e @ PhaseError::TypeMismatch { .. }) => {
                    Err(BearError::Phase(e))
                }
                Err(_) => Ok(None),
            })
            .collect()
    }

    /// Wait until every party has finished its timeline
    pub async fn join(&self) {
        let total = self.party_count();
        let mut rx = self.inner.finished.subscribe();
        // The sender lives in `inner`, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done >= total).await;
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.finished.borrow() >= self.party_count()
    }

    /// Parties that broke, in party order
    pub fn broken_parties(&self) -> Vec<usize> {
        self.inner
            .parties
            .iter()
            .filter(|party| party.is_broken())
            .map(|party| party.index())
            .collect()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    fn check_phase(&self, phase: usize) {
        assert!(
            phase < self.phase_count(),
            "phase index {} out of range for grid '{}' with {} phases",
            phase,
            self.inner.name,
            self.phase_count()
        );
    }

    fn check_party(&self, party: usize) {
        assert!(
            party < self.party_count(),
            "party index {} out of range for grid '{}' with {} parties",
            party,
            self.inner.name,
            self.party_count()
        );
    }

    fn slot(&self, phase: usize, party: usize) -> &Arc<CellSlot> {
        self.check_phase(phase);
        self.check_party(party);
        &self.inner.cells[phase * self.party_count() + party]
    }

    async fn emit(&self, event: GridEvent) {
        for observer in &self.inner.observers {
            observer.on_event(&self.inner.name, &event).await;
        }
    }

    async fn finish_party(&self, party: &Party<In>) {
        self.emit(GridEvent::PartyFinished {
            party: party.index(),
            state: party.state(),
        })
        .await;

        let mut done = 0;
        self.inner.finished.send_modify(|finished| {
            *finished += 1;
            done = *finished;
        });
        if done == self.party_count() {
            info!(
                "Grid {} finished, broken parties: {:?}",
                self.name(),
                self.broken_parties()
            );
        }
    }
}

/// One party's timeline: every phase in order, on one worker
async fn drive_party<In: Send + Sync + 'static>(grid: Grid<In>, party: Arc<Party<In>>) {
    let party_index = party.index();

    let _worker = match grid.inner.pool.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            warn!("Grid {}: party {} never ran: {}", grid.name(), party_index, e);
            for phase in 0..grid.phase_count() {
                grid.slot(phase, party_index)
                    .resolve(Err(PhaseError::Aborted {
                        phase,
                        party: party_index,
                    }));
                grid.emit(GridEvent::CellResolved {
                    phase,
                    party: party_index,
                    success: false,
                })
                .await;
            }
            grid.finish_party(&party).await;
            return;
        }
    };

    grid.emit(GridEvent::PartyStarted { party: party_index })
        .await;

    for (phase_index, phase) in grid.inner.phases.iter().enumerate() {
        let outcome = match party.upstream_error(phase_index) {
            Some(upstream) => Err(upstream),
            None => run_phase(&grid, &party, phase_index, phase.as_ref()).await,
        };

        if let Err(error) = &outcome {
            if !error.is_upstream() && party.mark_broken(phase_index, error.clone()) {
                warn!(
                    "Grid {}: party {} broke in phase {} '{}': {}",
                    grid.name(),
                    party_index,
                    phase_index,
                    phase.name(),
                    error
                );
                grid.emit(GridEvent::PartyBroken {
                    phase: phase_index,
                    party: party_index,
                    error: error.to_string(),
                })
                .await;
            }
        }

        let success = outcome.is_ok();
        grid.slot(phase_index, party_index).resolve(outcome);
        grid.emit(GridEvent::CellResolved {
            phase: phase_index,
            party: party_index,
            success,
        })
        .await;
    }

    grid.finish_party(&party).await;
    debug!(
        "Grid {}: party {} done ({:?})",
        grid.name(),
        party_index,
        party.state()
    );
    if party.state() == PartyState::Broken {
        debug!("Party {} failure: {:?}", party_index, party.failure());
    }
}

async fn run_phase<In: Send + Sync + 'static>(
    grid: &Grid<In>,
    party: &Arc<Party<In>>,
    phase_index: usize,
    phase: &dyn ErasedPhase<In>,
) -> ErasedOutcome {
    let ctx = PhaseContext::new(grid.clone(), party.clone(), phase_index, phase.name());
    debug!("Running {} '{}'", party.name(phase_index), phase.name());

    match AssertUnwindSafe(phase.run(ctx)).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PhaseError::computation(phase_index, party.index(), e)),
        Err(panic) => Err(PhaseError::computation(
            phase_index,
            party.index(),
            anyhow::anyhow!("computation panicked: {}", panic_message(panic.as_ref())),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
