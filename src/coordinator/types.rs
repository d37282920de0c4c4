//! Public types for the offline engine coordinator.

use thiserror::Error;

use crate::reconcile::ReconcileError;
use crate::records::WriteError;
use crate::schema::MigrationError;
use crate::storage::StorageError;

/// Engine lifecycle state.
///
/// Use [`super::OfflineEngine::state()`] to check the current state or
/// [`super::OfflineEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, store not opened
    Created,
    /// Store open, applying migrations
    Migrating,
    /// Schema ready, accepting calls
    Ready,
    /// Pool closed or closing
    ShuttingDown,
}

impl EngineState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Migrating => "Migrating",
            Self::Ready => "Ready",
            Self::ShuttingDown => "ShuttingDown",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine not ready (state: {0})")]
    NotReady(EngineState),
    #[error("Schema migration failed: {0}")]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Migrating), "Migrating");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
    }

    #[test]
    fn test_not_ready_message_names_state() {
        let err = EngineError::NotReady(EngineState::Created);
        assert_eq!(err.to_string(), "Engine not ready (state: Created)");
    }
}
