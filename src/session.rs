use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

use crate::error::{Error, SessionErrorKind};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub enum PublisherType {
    #[default]
    Simple,
    Simulcast,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Display)]
pub enum SessionState {
    AwaitingOffer,
    Negotiating,
    Streaming,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (AwaitingOffer, Negotiating)
                | (Negotiating, Streaming)
                | (Streaming, Streaming)
                | (AwaitingOffer | Negotiating | Streaming, Closed)
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionRole {
    Publisher(PublisherType),
    Subscriber,
}

#[derive(Debug)]
pub(crate) struct Session {
    pub id: String,
    pub role: SessionRole,
    pub state: SessionState,
    /// Sources published by this session, in publication order.
    pub source_ids: Vec<String>,
    /// Sinks owned by this session.
    pub sink_ids: Vec<String>,
}

impl Session {
    pub fn new(role: SessionRole) -> Self {
        let id = Uuid::new_v4().to_string();
        tracing::debug!("Session id={} role={:?} is created", id, role);
        Self {
            id,
            role,
            state: SessionState::AwaitingOffer,
            source_ids: vec![],
            sink_ids: vec![],
        }
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), Error> {
        if !self.state.can_transition_to(next) {
            return Err(Error::new_session(
                format!(
                    "Session {} can not move from {} to {}",
                    self.id, self.state, next
                ),
                SessionErrorKind::InvalidStateTransitionError,
            ));
        }
        if self.state != next {
            tracing::debug!(
                "Session id={} state {} -> {}",
                self.id,
                self.state,
                next
            );
        }
        self.state = next;
        Ok(())
    }

    pub fn publisher_type(&self) -> Option<PublisherType> {
        match self.role {
            SessionRole::Publisher(publisher_type) => Some(publisher_type),
            SessionRole::Subscriber => None,
        }
    }

    pub fn expect_publisher(&self) -> Result<PublisherType, Error> {
        self.publisher_type().ok_or_else(|| {
            Error::new_session(
                format!("Session {} is not a publisher", self.id),
                SessionErrorKind::RoleMismatchError,
            )
        })
    }

    pub fn expect_subscriber(&self) -> Result<(), Error> {
        match self.role {
            SessionRole::Subscriber => Ok(()),
            SessionRole::Publisher(_) => Err(Error::new_session(
                format!("Session {} is not a subscriber", self.id),
                SessionErrorKind::RoleMismatchError,
            )),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        tracing::debug!("Session id={} is dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions() {
        let mut session = Session::new(SessionRole::Publisher(PublisherType::Simple));
        assert_eq!(session.state, SessionState::AwaitingOffer);
        session.transition(SessionState::Negotiating).unwrap();
        session.transition(SessionState::Streaming).unwrap();
        session.transition(SessionState::Streaming).unwrap();
        session.transition(SessionState::Closed).unwrap();
    }

    #[test]
    fn any_live_state_may_close() {
        for state in [
            SessionState::AwaitingOffer,
            SessionState::Negotiating,
            SessionState::Streaming,
        ] {
            assert!(state.can_transition_to(SessionState::Closed));
        }
        assert!(!SessionState::Closed.can_transition_to(SessionState::Closed));
    }

    #[test]
    fn rejects_backward_and_skipping_transitions() {
        let mut session = Session::new(SessionRole::Subscriber);
        let err = session.transition(SessionState::Streaming).unwrap_err();
        assert_eq!(
            err.session_kind(),
            Some(&SessionErrorKind::InvalidStateTransitionError)
        );
        assert_eq!(session.state, SessionState::AwaitingOffer);

        session.transition(SessionState::Negotiating).unwrap();
        assert!(session.transition(SessionState::AwaitingOffer).is_err());
        session.transition(SessionState::Closed).unwrap();
        assert!(session.transition(SessionState::Negotiating).is_err());
        assert!(session.transition(SessionState::Streaming).is_err());
    }

    #[test]
    fn role_checks() {
        let publisher = Session::new(SessionRole::Publisher(PublisherType::Simulcast));
        assert_eq!(publisher.expect_publisher().unwrap(), PublisherType::Simulcast);
        assert_eq!(
            publisher.expect_subscriber().unwrap_err().session_kind(),
            Some(&SessionErrorKind::RoleMismatchError)
        );

        let subscriber = Session::new(SessionRole::Subscriber);
        assert!(subscriber.expect_subscriber().is_ok());
        assert!(subscriber.expect_publisher().is_err());
    }
}
