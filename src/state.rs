//! Session state and its reducer.
//!
//! All status/error/user changes go through [`reduce`], a pure function that
//! either returns the next state (plus the event to publish) or `None` when
//! the action changes nothing.

use crate::events::SessionEvent;
use crate::types::{SessionError, Status, User};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub status: Status,
    pub error: Option<SessionError>,
    pub user: Option<User>,
}

impl SessionState {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.status == Status::Authorized
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.status.is_settled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SetStatus(Status),
    /// Store the user and move to [`Status::Authorized`].
    Authorize(User),
    SetError(SessionError),
    ClearError,
}

/// Outcome of an effective action.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: SessionState,
    pub event: Option<SessionEvent>,
}

#[must_use]
pub fn reduce(state: &SessionState, action: Action) -> Option<Transition> {
    match action {
        Action::SetStatus(status) => {
            if state.status == status {
                return None;
            }
            let user = if status == Status::Authorized {
                state.user.clone()
            } else {
                None
            };
            Some(Transition {
                state: SessionState {
                    status,
                    user,
                    error: state.error.clone(),
                },
                event: Some(SessionEvent::StatusChange(status)),
            })
        }
        Action::Authorize(user) => {
            let status_changed = state.status != Status::Authorized;
            if !status_changed && state.user.as_ref() == Some(&user) {
                return None;
            }
            Some(Transition {
                state: SessionState {
                    status: Status::Authorized,
                    user: Some(user),
                    error: state.error.clone(),
                },
                event: status_changed.then_some(SessionEvent::StatusChange(Status::Authorized)),
            })
        }
        Action::SetError(error) => {
            if state.error.as_ref().is_some_and(|current| current.kind == error.kind) {
                return None;
            }
            Some(Transition {
                state: SessionState {
                    error: Some(error.clone()),
                    ..state.clone()
                },
                event: Some(SessionEvent::Error(error)),
            })
        }
        Action::ClearError => {
            state.error.as_ref()?;
            Some(Transition {
                state: SessionState {
                    error: None,
                    ..state.clone()
                },
                event: None,
            })
        }
    }
}
