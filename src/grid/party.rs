use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::core::errors::PhaseError;
use crate::grid::types::PartyState;

/// One independent timeline through every phase of a grid, e.g. one host.
///
/// A party starts `Active` and turns `Broken` at its first failing phase.
/// There is no way back: every later phase of a broken party is failed
/// without running.
pub struct Party<In> {
    index: usize,
    input: In,
    status: Mutex<PartyStatus>,
}

#[derive(Debug, Clone)]
enum PartyStatus {
    Active,
    Broken { phase: usize, error: PhaseError },
}

impl<In> Party<In> {
    pub(crate) fn new(index: usize, input: In) -> Self {
        Self {
            index,
            input,
            status: Mutex::new(PartyStatus::Active),
        }
    }

    /// Column of this party in the grid
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn input(&self) -> &In {
        &self.input
    }

    pub fn state(&self) -> PartyState {
        match *self.status.lock() {
            PartyStatus::Active => PartyState::Active,
            PartyStatus::Broken { .. } => PartyState::Broken,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.state() == PartyState::Broken
    }

    /// The error that broke this party
    pub fn failure(&self) -> Option<PhaseError> {
        match &*self.status.lock() {
            PartyStatus::Active => None,
            PartyStatus::Broken { error, .. } => Some(error.clone()),
        }
    }

    /// Phase in which this party broke
    pub fn broken_at(&self) -> Option<usize> {
        match *self.status.lock() {
            PartyStatus::Active => None,
            PartyStatus::Broken { phase, .. } => Some(phase),
        }
    }

    /// Display name of this party within a phase, e.g. `(1, 0)`
    pub fn name(&self, phase_index: usize) -> String {
        format!("({}, {})", phase_index, self.index)
    }

    /// Record the first failure. Later calls keep the original cause.
    pub(crate) fn mark_broken(&self, phase: usize, error: PhaseError) -> bool {
        let mut status = self.status.lock();
        if matches!(*status, PartyStatus::Broken { .. }) {
            return false;
        }
        *status = PartyStatus::Broken { phase, error };
        true
    }

    /// The error to record for `phase` if the party already broke earlier
    pub(crate) fn upstream_error(&self, phase: usize) -> Option<PhaseError> {
        match &*self.status.lock() {
            PartyStatus::Active => None,
            PartyStatus::Broken {
                phase: failed_phase,
                error,
            } => {
                let cause = match error {
                    PhaseError::Computation { cause, .. } | PhaseError::Upstream { cause, .. } => {
                        cause.clone()
                    }
                    other => Arc::new(anyhow::Error::new(other.clone())),
                };
                Some(PhaseError::Upstream {
                    phase,
                    party: self.index,
                    failed_phase: *failed_phase,
                    cause,
                })
            }
        }
    }
}

impl<In: fmt::Debug> fmt::Debug for Party<In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Party")
            .field("index", &self.index)
            .field("input", &self.input)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_name() {
        let party = Party::new(2, "web-1");
        assert_eq!(party.name(0), "(0, 2)");
        assert_eq!(party.name(1), "(1, 2)");
        assert_eq!(*party.input(), "web-1");
    }

    #[test]
    fn test_broken_is_terminal() {
        let party = Party::new(0, ());
        assert_eq!(party.state(), PartyState::Active);
        assert!(party.upstream_error(1).is_none());

        let first = PhaseError::computation(0, 0, anyhow::anyhow!("checkout failed"));
        assert!(party.mark_broken(0, first));
        assert!(!party.mark_broken(1, PhaseError::computation(1, 0, anyhow::anyhow!("other"))));

        assert!(party.is_broken());
        assert_eq!(party.broken_at(), Some(0));
        let failure = party.failure().unwrap();
        assert_eq!(failure.cause().unwrap().to_string(), "checkout failed");
    }

    #[test]
    fn test_upstream_error_shares_cause() {
        let party = Party::new(1, ());
        let error = PhaseError::computation(0, 1, anyhow::anyhow!("1"));
        party.mark_broken(0, error.clone());

        let upstream = party.upstream_error(2).unwrap();
        match (&upstream, &error) {
            (
                PhaseError::Upstream {
                    phase: 2,
                    party: 1,
                    failed_phase: 0,
                    cause,
                },
                PhaseError::Computation { cause: original, .. },
            ) => assert!(Arc::ptr_eq(cause, original)),
            other => panic!("unexpected errors: {:?}", other),
        }
    }
}
