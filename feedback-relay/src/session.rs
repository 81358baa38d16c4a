use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

/// Admits at most one session at a time on a receiving side.
#[derive(Clone, Default)]
pub struct SessionGate {
    busy: Arc<AtomicBool>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a session, or returns `None` while another one is running.
    pub fn try_begin(&self) -> Option<SessionToken> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let token = SessionToken {
            id: Uuid::new_v4(),
            busy: self.busy.clone(),
        };
        debug!(session = %token.id, "Session started");
        Some(token)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof of an admitted session. The gate reopens when the token is dropped.
pub struct SessionToken {
    id: Uuid,
    busy: Arc<AtomicBool>,
}

impl SessionToken {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SessionToken {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        debug!(session = %self.id, "Session finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_session_is_refused_until_the_first_ends() {
        let gate = SessionGate::new();
        let first = gate.try_begin().expect("first session");
        assert!(gate.is_busy());
        assert!(gate.try_begin().is_none());
        drop(first);
        assert!(!gate.is_busy());
        assert!(gate.try_begin().is_some());
    }
}
