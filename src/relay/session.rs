//! Client session lifecycle.
//!
//! One relay process serves one client session. The phase gate keeps tool
//! requests out until the initialize handshake completes and rejects new work
//! once shutdown has begun, while in-flight calls drain.

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    Initialized,
    Active,
    Closing,
    Closed,
}

impl SessionPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SessionPhase::Uninitialized,
            1 => SessionPhase::Initialized,
            2 => SessionPhase::Active,
            3 => SessionPhase::Closing,
            _ => SessionPhase::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionPhase::Uninitialized => 0,
            SessionPhase::Initialized => 1,
            SessionPhase::Active => 2,
            SessionPhase::Closing => 3,
            SessionPhase::Closed => 4,
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Initialized => "initialized",
            SessionPhase::Active => "active",
            SessionPhase::Closing => "closing",
            SessionPhase::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    phase: AtomicU8,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(SessionPhase::Uninitialized.as_u8()),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Tool requests are only served while Active.
    pub fn accepts_requests(&self) -> bool {
        self.phase() == SessionPhase::Active
    }

    /// Initialize handshake answered. Valid exactly once, from Uninitialized.
    pub fn mark_initialized(&self) -> bool {
        self.transition(SessionPhase::Uninitialized, SessionPhase::Initialized)
    }

    /// Initialized notification received. Valid once, from Initialized.
    pub fn mark_active(&self) -> bool {
        self.transition(SessionPhase::Initialized, SessionPhase::Active)
    }

    /// A tool request arrived. The handshake reply already licenses requests,
    /// so a still-Initialized session is promoted to Active here; returns
    /// false in every phase where requests are not served.
    pub fn activate_on_request(&self) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            match SessionPhase::from_u8(current) {
                SessionPhase::Active => return true,
                SessionPhase::Initialized => match self.phase.compare_exchange(
                    current,
                    SessionPhase::Active.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return true,
                    Err(observed) => current = observed,
                },
                _ => return false,
            }
        }
    }

    /// Begin shutdown. Returns false when shutdown already started.
    pub fn begin_closing(&self) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            let phase = SessionPhase::from_u8(current);
            if matches!(phase, SessionPhase::Closing | SessionPhase::Closed) {
                return false;
            }
            match self.phase.compare_exchange(
                current,
                SessionPhase::Closing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Shutdown finished; terminal.
    pub fn mark_closed(&self) {
        self.phase
            .store(SessionPhase::Closed.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: SessionPhase, to: SessionPhase) -> bool {
        self.phase
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_path() {
        let session = SessionState::new();
        assert_eq!(session.phase(), SessionPhase::Uninitialized);
        assert!(!session.accepts_requests());

        assert!(session.mark_initialized());
        assert_eq!(session.phase(), SessionPhase::Initialized);
        assert!(!session.accepts_requests());

        assert!(session.mark_active());
        assert!(session.accepts_requests());
    }

    #[test]
    fn test_double_initialize_rejected() {
        let session = SessionState::new();
        assert!(session.mark_initialized());
        assert!(!session.mark_initialized());
    }

    #[test]
    fn test_active_requires_initialized() {
        let session = SessionState::new();
        assert!(!session.mark_active());
        assert_eq!(session.phase(), SessionPhase::Uninitialized);
    }

    #[test]
    fn test_closing_stops_new_requests() {
        let session = SessionState::new();
        session.mark_initialized();
        session.mark_active();

        assert!(session.begin_closing());
        assert!(!session.accepts_requests());
        assert!(!session.begin_closing());

        session.mark_closed();
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[test]
    fn test_closing_possible_before_handshake() {
        let session = SessionState::new();
        assert!(session.begin_closing());
        assert_eq!(session.phase(), SessionPhase::Closing);
    }

    #[test]
    fn test_request_promotes_initialized_session() {
        let session = SessionState::new();
        assert!(!session.activate_on_request());
        assert_eq!(session.phase(), SessionPhase::Uninitialized);

        session.mark_initialized();
        assert!(session.activate_on_request());
        assert_eq!(session.phase(), SessionPhase::Active);

        // Idempotent once active.
        assert!(session.activate_on_request());
    }

    #[test]
    fn test_request_rejected_while_closing() {
        let session = SessionState::new();
        session.mark_initialized();
        session.mark_active();
        session.begin_closing();

        assert!(!session.activate_on_request());
        session.mark_closed();
        assert!(!session.activate_on_request());
    }
}
