//! Observers notified as parties advance through a grid
//!
//! Observers only watch. They cannot influence scheduling or cell contents.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::grid::types::GridEvent;

#[async_trait]
pub trait GridObserver: Send + Sync {
    async fn on_event(&self, grid: &str, event: &GridEvent);
}

/// Logs every event through `tracing`
pub struct LoggingObserver;

#[async_trait]
impl GridObserver for LoggingObserver {
    async fn on_event(&self, grid: &str, event: &GridEvent) {
        match event {
            GridEvent::PartyStarted { party } => {
                tracing::info!("[{}] party {} started", grid, party);
            }
            GridEvent::CellResolved {
                phase,
                party,
                success,
            } => {
                tracing::debug!(
                    "[{}] cell ({}, {}) resolved, success: {}",
                    grid,
                    phase,
                    party,
                    success
                );
            }
            GridEvent::PartyBroken {
                phase,
                party,
                error,
            } => {
                tracing::error!("[{}] party {} broke in phase {}: {}", grid, party, phase, error);
            }
            GridEvent::PartyFinished { party, state } => {
                tracing::info!("[{}] party {} finished: {:?}", grid, party, state);
            }
        }
    }
}

/// Buffers events in arrival order
#[derive(Clone, Default)]
pub struct RecordingObserver {
    events: Arc<RwLock<Vec<GridEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GridEvent> {
        self.events.read().clone()
    }

    /// Events concerning one party
    pub fn events_for(&self, party: usize) -> Vec<GridEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event_party(event) == party)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl GridObserver for RecordingObserver {
    async fn on_event(&self, _grid: &str, event: &GridEvent) {
        self.events.write().push(event.clone());
    }
}

fn event_party(event: &GridEvent) -> usize {
    match event {
        GridEvent::PartyStarted { party }
        | GridEvent::CellResolved { party, .. }
        | GridEvent::PartyBroken { party, .. }
        | GridEvent::PartyFinished { party, .. } => *party,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::types::PartyState;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_recording_observer() {
        let recorder = RecordingObserver::new();
        recorder
            .on_event("deploy", &GridEvent::PartyStarted { party: 0 })
            .await;
        recorder
            .on_event("deploy", &GridEvent::PartyStarted { party: 1 })
            .await;
        recorder
            .on_event(
                "deploy",
                &GridEvent::PartyFinished {
                    party: 1,
                    state: PartyState::Active,
                },
            )
            .await;

        assert_eq!(recorder.events().len(), 3);
        assert_eq!(
            recorder.events_for(1),
            vec![
                GridEvent::PartyStarted { party: 1 },
                GridEvent::PartyFinished {
                    party: 1,
                    state: PartyState::Active
                },
            ]
        );

        recorder.clear();
        assert!(recorder.events().is_empty());
    }
}
