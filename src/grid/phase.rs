//! Phases and the computations they hand out to parties
//!
//! A phase holds no mutable state. For every party it resolves a fresh
//! computation from the party's input; the computation runs once, inside
//! that party's timeline, and its outcome lands in the party's cell.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

use crate::grid::coordinator::Grid;
use crate::grid::party::Party;
use crate::grid::types::{ErasedValue, TypeInfo};

/// The work one party performs in one phase.
///
/// Consumed by value: a computation runs at most once. Any
/// `FnOnce(PhaseContext<In>) -> impl Future<Output = anyhow::Result<Out>>`
/// closure is a computation.
#[async_trait]
pub trait PhaseComputation<In, Out>: Send
where
    In: Send + Sync + 'static,
    Out: Send + 'static,
{
    async fn run(self: Box<Self>, ctx: PhaseContext<In>) -> anyhow::Result<Out>;
}

#[async_trait]
impl<In, Out, F, Fut> PhaseComputation<In, Out> for F
where
    In: Send + Sync + 'static,
    Out: Send + 'static,
    F: FnOnce(PhaseContext<In>) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
{
    async fn run(self: Box<Self>, ctx: PhaseContext<In>) -> anyhow::Result<Out> {
        (*self)(ctx).await
    }
}

type Factory<In, Out> = dyn Fn(&In) -> Box<dyn PhaseComputation<In, Out>> + Send + Sync;

/// A named step of the pipeline shared by all parties
pub struct Phase<In, Out> {
    name: Arc<str>,
    factory: Arc<Factory<In, Out>>,
}

impl<In, Out> Clone for Phase<In, Out> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<In, Out> Phase<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    /// Create a phase from a per-party factory.
    ///
    /// The factory must not touch the grid; it only selects the behavior
    /// for the given input. Nothing runs until the computation is invoked.
    pub fn new<F, C>(name: impl Into<String>, make: F) -> Self
    where
        F: Fn(&In) -> C + Send + Sync + 'static,
        C: PhaseComputation<In, Out> + 'static,
    {
        let factory = move |input: &In| -> Box<dyn PhaseComputation<In, Out>> {
            Box::new(make(input))
        };
        Self {
            name: Arc::from(name.into()),
            factory: Arc::new(factory),
        }
    }

    /// Create a phase whose computation is the same for every party
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(PhaseContext<In>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        Self::new(name, move |_: &In| f.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The computation `input`'s party runs in this phase
    pub fn resolve(&self, input: &In) -> Box<dyn PhaseComputation<In, Out>> {
        (self.factory)(input)
    }
}

/// What a computation receives: its party, the phase position and the grid
pub struct PhaseContext<In> {
    grid: Grid<In>,
    party: Arc<Party<In>>,
    phase_index: usize,
    phase_name: Arc<str>,
}

impl<In> Clone for PhaseContext<In> {
    fn clone(&self) -> Self {
        Self {
            grid: self.grid.clone(),
            party: self.party.clone(),
            phase_index: self.phase_index,
            phase_name: self.phase_name.clone(),
        }
    }
}

impl<In: Send + Sync + 'static> PhaseContext<In> {
    pub(crate) fn new(
        grid: Grid<In>,
        party: Arc<Party<In>>,
        phase_index: usize,
        phase_name: Arc<str>,
    ) -> Self {
        Self {
            grid,
            party,
            phase_index,
            phase_name,
        }
    }

    pub fn grid(&self) -> &Grid<In> {
        &self.grid
    }

    pub fn party(&self) -> &Arc<Party<In>> {
        &self.party
    }

    pub fn input(&self) -> &In {
        self.party.input()
    }

    pub fn phase_index(&self) -> usize {
        self.phase_index
    }

    pub fn phase_name(&self) -> &str {
        &self.phase_name
    }

    /// `(phase, party)` label of the running computation
    pub fn name(&self) -> String {
        self.party.name(self.phase_index)
    }

    /// This party's result from the previous phase, see
    /// [`Grid::previous_result`]
    pub async fn previous_result<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.grid
            .previous_result::<T>(&self.party, self.phase_index)
            .await
    }
}

/// Object-safe view of a phase with its output type erased, so phases of
/// different output types can share one grid.
pub(crate) trait ErasedPhase<In>: Send + Sync {
    fn name(&self) -> Arc<str>;

    fn output(&self) -> TypeInfo;

    fn run(&self, ctx: PhaseContext<In>) -> BoxFuture<'static, anyhow::Result<ErasedValue>>;
}

impl<In, Out> ErasedPhase<In> for Phase<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    fn name(&self) -> Arc<str> {
        self.name.clone()
    }

    fn output(&self) -> TypeInfo {
        TypeInfo::of::<Out>()
    }

    fn run(&self, ctx: PhaseContext<In>) -> BoxFuture<'static, anyhow::Result<ErasedValue>> {
        let phase = self.clone();
        async move {
            let computation = phase.resolve(ctx.input());
            let value = computation.run(ctx).await?;
            Ok(Arc::new(value) as ErasedValue)
        }
        .boxed()
    }
}
