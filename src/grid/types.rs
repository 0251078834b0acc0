//! Core types shared by the grid, its cells and its observers

use crate::core::errors::PhaseError;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed handle to a phase that was added to a grid.
///
/// Carries the phase's position and its output type, so cell lookups made
/// through it come back typed.
pub struct PhaseKey<Out> {
    index: usize,
    _out: PhantomData<fn() -> Out>,
}

impl<Out> PhaseKey<Out> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            _out: PhantomData,
        }
    }

    /// 0-based position of the phase in the grid
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<Out> Clone for PhaseKey<Out> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Out> Copy for PhaseKey<Out> {}

impl<Out> fmt::Debug for PhaseKey<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseKey")
            .field("index", &self.index)
            .field("output", &type_name::<Out>())
            .finish()
    }
}

/// Lifecycle state of a party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyState {
    Active,
    Broken,
}

/// Events emitted while parties advance through the grid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GridEvent {
    PartyStarted {
        party: usize,
    },
    CellResolved {
        phase: usize,
        party: usize,
        success: bool,
    },
    PartyBroken {
        phase: usize,
        party: usize,
        error: String,
    },
    PartyFinished {
        party: usize,
        state: PartyState,
    },
}

/// A [`TypeId`] and the type's name.
#[derive(Debug, Clone, Copy)]
pub struct TypeInfo {
    id: TypeId,
    name: &'static str,
}

impl TypeInfo {
    /// Returns the [`TypeInfo`] of the type this generic function has been
    /// instantiated with.
    pub fn of<T: 'static>() -> Self {
        TypeInfo {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for TypeInfo {
    fn eq(&self, other: &TypeInfo) -> bool {
        self.id.eq(&other.id)
    }
}

impl Eq for TypeInfo {}

/// Type-erased phase output as stored in a cell
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// What a cell resolves to before it is downcast for a typed reader
pub(crate) type ErasedOutcome = Result<ErasedValue, PhaseError>;

/// What a typed reader observes when a cell resolves
pub type CellOutcome<Out> = Result<Arc<Out>, PhaseError>;
