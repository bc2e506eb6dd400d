//! Generation sessions: the per-invoice in-flight guard and the stage machine.

use log::debug;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Building,
    Rendering,
    Syncing,
    Rasterizing,
    Delivering,
    Succeeded,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed)
    }

    /// Stages advance strictly in order; any non-terminal stage may fail.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Building)
            | (Building, Rendering)
            | (Rendering, Syncing)
            | (Syncing, Rasterizing)
            | (Rasterizing, Delivering)
            | (Delivering, Succeeded) => true,
            (current, Failed) => !current.is_terminal() && current != Idle,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Building => "building",
            SessionState::Rendering => "rendering",
            SessionState::Syncing => "syncing",
            SessionState::Rasterizing => "rasterizing",
            SessionState::Delivering => "delivering",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session cannot move from {from} to {to}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// One generation attempt for one invoice. Holding it keeps the invoice
/// marked as in flight.
#[derive(Debug)]
pub struct GenerationSession {
    invoice_id: String,
    state: SessionState,
    history: Vec<SessionState>,
    _ticket: SessionTicket,
}

impl GenerationSession {
    pub fn invoice_id(&self) -> &str {
        &self.invoice_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the session has been in, starting with `Idle`.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), IllegalTransition> {
        if !self.state.can_advance_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("session {}: {} -> {}", self.invoice_id, self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

#[derive(Debug)]
struct SessionTicket {
    invoice_id: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.invoice_id);
    }
}

/// Tracks which invoices have a session in flight. Unrelated invoices never
/// wait on each other.
#[derive(Debug, Clone, Default)]
pub struct SessionGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a session, or returns `None` if one is already running for this invoice.
    pub fn begin(&self, invoice_id: &str) -> Option<GenerationSession> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(invoice_id.to_string()) {
            return None;
        }
        Some(GenerationSession {
            invoice_id: invoice_id.to_string(),
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            _ticket: SessionTicket {
                invoice_id: invoice_id.to_string(),
                in_flight: Arc::clone(&self.in_flight),
            },
        })
    }

    pub fn is_in_flight(&self, invoice_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(invoice_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn happy_path_walks_every_stage() {
        let guard = SessionGuard::new();
        let mut session = guard.begin("inv-1").unwrap();
        for next in [Building, Rendering, Syncing, Rasterizing, Delivering, Succeeded] {
            session.advance(next).unwrap();
        }
        assert_eq!(
            session.history(),
            &[Idle, Building, Rendering, Syncing, Rasterizing, Delivering, Succeeded]
        );
    }

    #[test]
    fn stages_cannot_be_skipped_or_revisited() {
        let guard = SessionGuard::new();
        let mut session = guard.begin("inv-1").unwrap();
        assert_eq!(
            session.advance(Rendering),
            Err(IllegalTransition { from: Idle, to: Rendering })
        );
        session.advance(Building).unwrap();
        session.advance(Failed).unwrap();
        assert!(session.advance(Rendering).is_err());
        assert!(session.advance(Failed).is_err());
    }

    #[test]
    fn guard_is_scoped_per_invoice() {
        let guard = SessionGuard::new();
        let first = guard.begin("inv-1").unwrap();
        assert!(guard.begin("inv-1").is_none());
        let other = guard.begin("inv-2");
        assert!(other.is_some());
        assert!(guard.is_in_flight("inv-1"));

        drop(first);
        assert!(!guard.is_in_flight("inv-1"));
        assert!(guard.begin("inv-1").is_some());
    }
}
