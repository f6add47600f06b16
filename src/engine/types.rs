//! Public types for the sync engine.

/// Engine lifecycle state.
///
/// The engine progresses through states during startup and shutdown.
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Opening stores and restoring outbox state
    Starting,
    /// Startup complete, accepting requests
    Ready,
    /// Run loop active
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Shutdown complete
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Outcome of one per-tenant outbox drain.
///
/// Returned by [`super::SyncEngine::drain_tenant()`]. The counts cover only
/// the mutations that were pending when the drain began; records queued
/// mid-drain wait for the next trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainResult {
    /// Pending mutations found at drain start
    pub total: usize,
    /// Confirmed by the server and removed
    pub replayed: usize,
    /// Moved to the conflict registry
    pub conflicted: usize,
    /// Hit the attempt cap, excluded from automatic replay
    pub failed: usize,
    /// Failed below the cap, still pending for the next drain
    pub requeued: usize,
}

impl DrainResult {
    /// Check if every mutation found was confirmed by the server.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.replayed == self.total
    }

    pub(super) fn count_failure(&mut self, permanent: bool) {
        if permanent {
            self.failed += 1;
        } else {
            self.requeued += 1;
        }
    }
}

/// Outcome of a critical-data refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Endpoints fetched and cached
    pub fetched: usize,
    /// Endpoints that failed or answered non-2xx
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::Stopped), "Stopped");
    }

    #[test]
    fn test_drain_result_is_clean() {
        let clean = DrainResult { total: 4, replayed: 4, ..Default::default() };
        assert!(clean.is_clean());

        let dirty = DrainResult { total: 4, replayed: 3, requeued: 1, ..Default::default() };
        assert!(!dirty.is_clean());

        // An empty drain is trivially clean
        assert!(DrainResult::default().is_clean());
    }
}
