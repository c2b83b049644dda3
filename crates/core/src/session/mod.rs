//! Authentication session state machine.
//!
//! An [`AuthnSession`] tracks one user agent's progress through an SSO
//! exchange across several HTTP requests. All mutation goes through the
//! transition methods below; each of them rejects an illegal predecessor
//! state instead of correcting it, so a replayed or out-of-order request can
//! never push the exchange forward.
//!
//! ```text
//! Idle -> Authenticating <-> InCredentialsGatherer <-> InUlForm
//!                  \                  |                   /
//!                   +----------> Succeeded | Failed <----+
//! ```

pub mod store;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::{InMemorySessionManager, SessionHandle, SessionManager};

/// States of an authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Authenticating,
    InCredentialsGatherer,
    InUlForm,
    Succeeded,
    Failed,
}

impl SessionState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed)
    }

    /// States in which credentials are being gathered for a pending request.
    pub fn is_gathering(self) -> bool {
        matches!(
            self,
            SessionState::Authenticating
                | SessionState::InCredentialsGatherer
                | SessionState::InUlForm
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::Authenticating => "AUTHENTICATING",
            SessionState::InCredentialsGatherer => "IN_CREDENTIALS_GATHERER",
            SessionState::InUlForm => "IN_UL_FORM",
            SessionState::Succeeded => "SUCCEEDED",
            SessionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// State machine violations. These are never recovered from inside the
/// request that triggered them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session {session_id} is in state {actual}, expected one of {expected:?}")]
    IllegalState {
        session_id: String,
        expected: Vec<SessionState>,
        actual: SessionState,
    },

    #[error("session {session_id} already finished with a different outcome")]
    DoubleFinish { session_id: String },

    #[error("session {session_id} is terminal and cannot restart authentication")]
    TerminalReentry { session_id: String },
}

/// The decoded SSO request a session is working to answer, captured when the
/// session enters [`SessionState::Authenticating`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolContext {
    /// ID of the incoming request, echoed as `InResponseTo`.
    pub request_id: String,
    /// Entity ID of the relying party that issued the request.
    pub issuer: String,
    /// Where the final response is delivered.
    pub acs_url: String,
    #[serde(default)]
    pub relay_state: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    /// Credential groups that verified this principal.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuthnOutcome {
    Success { principal: Principal },
    Failure { reason: String },
}

impl AuthnOutcome {
    pub fn success(principal: Principal) -> Self {
        AuthnOutcome::Success { principal }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        AuthnOutcome::Failure {
            reason: reason.into(),
        }
    }

    fn terminal_state(&self) -> SessionState {
        match self {
            AuthnOutcome::Success { .. } => SessionState::Succeeded,
            AuthnOutcome::Failure { .. } => SessionState::Failed,
        }
    }
}

/// What the credential pipeline has learned so far in the current exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalHints {
    /// Username last offered by the user agent, verified or not.
    pub username: Option<String>,
    /// Verified username per credential group.
    pub verified_groups: BTreeMap<String, String>,
    pub failed_form_attempts: u32,
}

/// Server-side record of one user agent's authentication exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthnSession {
    id: String,
    state: SessionState,
    pending_context: Option<ProtocolContext>,
    return_destination: Option<String>,
    outcome: Option<AuthnOutcome>,
    created_at: DateTime<Utc>,
    last_touched_at: DateTime<Utc>,
    principal_hints: PrincipalHints,
}

impl AuthnSession {
    /// Create a session in [`SessionState::Idle`].
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: SessionState::Idle,
            pending_context: None,
            return_destination: None,
            outcome: None,
            created_at: now,
            last_touched_at: now,
            principal_hints: PrincipalHints::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_context(&self) -> Option<&ProtocolContext> {
        self.pending_context.as_ref()
    }

    pub fn return_destination(&self) -> Option<&str> {
        self.return_destination.as_deref()
    }

    pub fn outcome(&self) -> Option<&AuthnOutcome> {
        self.outcome.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_touched_at(&self) -> DateTime<Utc> {
        self.last_touched_at
    }

    pub fn principal_hints(&self) -> &PrincipalHints {
        &self.principal_hints
    }

    pub fn principal_hints_mut(&mut self) -> &mut PrincipalHints {
        &mut self.principal_hints
    }

    /// Record activity on the session.
    pub fn touch(&mut self) {
        self.last_touched_at = Utc::now();
    }

    /// Whether the session has been idle longer than `idle_timeout` at `now`.
    pub fn is_expired(&self, idle_timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_touched_at > idle_timeout
    }

    /// Guard that the session is in one of `expected` and return the current
    /// state. Never changes the session.
    pub fn assert_state(&self, expected: &[SessionState]) -> Result<SessionState, SessionError> {
        if expected.contains(&self.state) {
            Ok(self.state)
        } else {
            Err(self.illegal(expected))
        }
    }

    /// Start (or restart) answering `context`.
    ///
    /// Legal from every non-terminal state. Restarting discards whatever the
    /// previous exchange gathered. Calling this on a finished session is a
    /// programming error reported as [`SessionError::TerminalReentry`].
    pub fn set_state_authenticating(
        &mut self,
        return_destination: impl Into<String>,
        context: ProtocolContext,
    ) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::TerminalReentry {
                session_id: self.id.clone(),
            });
        }
        self.return_destination = Some(return_destination.into());
        self.pending_context = Some(context);
        self.principal_hints = PrincipalHints::default();
        self.state = SessionState::Authenticating;
        Ok(())
    }

    /// Hand the exchange to a credentials gatherer.
    pub fn advance_to_credentials_gatherer(&mut self) -> Result<(), SessionError> {
        self.transition(
            &[
                SessionState::Authenticating,
                SessionState::InCredentialsGatherer,
                SessionState::InUlForm,
            ],
            SessionState::InCredentialsGatherer,
        )
    }

    /// A gatherer has decided to show the universal login form.
    pub fn advance_to_form(&mut self) -> Result<(), SessionError> {
        self.transition(
            &[SessionState::InCredentialsGatherer],
            SessionState::InUlForm,
        )
    }

    /// Move to a terminal state.
    ///
    /// A second call with the same outcome is a no-op; a second call with a
    /// different outcome fails with [`SessionError::DoubleFinish`]. Success is
    /// only reachable while credentials are being gathered; failure from any
    /// live state.
    pub fn finish(&mut self, outcome: AuthnOutcome) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return match &self.outcome {
                Some(existing) if *existing == outcome => Ok(()),
                _ => Err(SessionError::DoubleFinish {
                    session_id: self.id.clone(),
                }),
            };
        }
        if matches!(outcome, AuthnOutcome::Success { .. }) && !self.state.is_gathering() {
            return Err(self.illegal(&[
                SessionState::Authenticating,
                SessionState::InCredentialsGatherer,
                SessionState::InUlForm,
            ]));
        }
        self.state = outcome.terminal_state();
        self.outcome = Some(outcome);
        Ok(())
    }

    fn transition(
        &mut self,
        from: &[SessionState],
        to: SessionState,
    ) -> Result<(), SessionError> {
        self.assert_state(from)?;
        self.state = to;
        Ok(())
    }

    fn illegal(&self, expected: &[SessionState]) -> SessionError {
        SessionError::IllegalState {
            session_id: self.id.clone(),
            expected: expected.to_vec(),
            actual: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SessionState; 6] = [
        SessionState::Idle,
        SessionState::Authenticating,
        SessionState::InCredentialsGatherer,
        SessionState::InUlForm,
        SessionState::Succeeded,
        SessionState::Failed,
    ];

    fn context() -> ProtocolContext {
        ProtocolContext {
            request_id: "_req_1".into(),
            issuer: "https://gsa.example.com".into(),
            acs_url: "https://gsa.example.com/acs".into(),
            relay_state: Some("/search?q=x".into()),
            received_at: Utc::now(),
        }
    }

    fn principal(name: &str) -> Principal {
        Principal {
            username: name.into(),
            groups: vec!["default".into()],
        }
    }

    fn session_in(state: SessionState) -> AuthnSession {
        let mut session = AuthnSession::new("s-1");
        match state {
            SessionState::Idle => {}
            SessionState::Authenticating => {
                session.set_state_authenticating("/saml/sso", context()).unwrap();
            }
            SessionState::InCredentialsGatherer => {
                session.set_state_authenticating("/saml/sso", context()).unwrap();
                session.advance_to_credentials_gatherer().unwrap();
            }
            SessionState::InUlForm => {
                session.set_state_authenticating("/saml/sso", context()).unwrap();
                session.advance_to_credentials_gatherer().unwrap();
                session.advance_to_form().unwrap();
            }
            SessionState::Succeeded => {
                session.set_state_authenticating("/saml/sso", context()).unwrap();
                session.finish(AuthnOutcome::success(principal("alice"))).unwrap();
            }
            SessionState::Failed => {
                session.finish(AuthnOutcome::failure("boom")).unwrap();
            }
        }
        assert_eq!(session.state(), state);
        session
    }

    #[test]
    fn new_session_is_idle() {
        let session = AuthnSession::new("abc");
        assert_eq!(session.id(), "abc");
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.pending_context().is_none());
        assert!(session.outcome().is_none());
    }

    #[test]
    fn assert_state_returns_current_state() {
        let session = session_in(SessionState::InCredentialsGatherer);
        let state = session
            .assert_state(&[SessionState::Idle, SessionState::InCredentialsGatherer])
            .unwrap();
        assert_eq!(state, SessionState::InCredentialsGatherer);
    }

    #[test]
    fn assert_state_never_mutates() {
        for state in ALL_STATES {
            let session = session_in(state);
            let _ = session.assert_state(&[SessionState::Idle]);
            let _ = session.assert_state(&ALL_STATES);
            assert_eq!(session.state(), state);
        }
    }

    #[test]
    fn assert_state_fails_regardless_of_ordering() {
        let session = session_in(SessionState::Succeeded);
        let forward = [SessionState::InUlForm, SessionState::InCredentialsGatherer];
        let reversed = [SessionState::InCredentialsGatherer, SessionState::InUlForm];
        for expected in [&forward[..], &reversed[..]] {
            let err = session.assert_state(expected).unwrap_err();
            assert!(matches!(
                err,
                SessionError::IllegalState {
                    actual: SessionState::Succeeded,
                    ..
                }
            ));
        }
    }

    #[test]
    fn assert_state_with_empty_set_fails() {
        let session = session_in(SessionState::Idle);
        assert!(session.assert_state(&[]).is_err());
    }

    #[test]
    fn set_state_authenticating_stores_context() {
        let mut session = AuthnSession::new("s");
        session
            .set_state_authenticating("https://idp/saml/sso", context())
            .unwrap();
        assert_eq!(session.state(), SessionState::Authenticating);
        assert_eq!(session.return_destination(), Some("https://idp/saml/sso"));
        assert_eq!(session.pending_context().unwrap().request_id, "_req_1");
    }

    #[test]
    fn set_state_authenticating_reentry_resets_hints() {
        let mut session = session_in(SessionState::InUlForm);
        session.principal_hints_mut().failed_form_attempts = 2;
        session
            .principal_hints_mut()
            .verified_groups
            .insert("default".into(), "alice".into());

        let mut next = context();
        next.request_id = "_req_2".into();
        session.set_state_authenticating("/saml/sso", next).unwrap();

        assert_eq!(session.state(), SessionState::Authenticating);
        assert_eq!(session.pending_context().unwrap().request_id, "_req_2");
        assert_eq!(session.principal_hints(), &PrincipalHints::default());
    }

    #[test]
    fn set_state_authenticating_from_terminal_fails() {
        for state in [SessionState::Succeeded, SessionState::Failed] {
            let mut session = session_in(state);
            let err = session
                .set_state_authenticating("/saml/sso", context())
                .unwrap_err();
            assert!(matches!(err, SessionError::TerminalReentry { .. }));
            assert_eq!(session.state(), state);
        }
    }

    #[test]
    fn gathering_cycle_can_repeat() {
        let mut session = session_in(SessionState::Authenticating);
        for _ in 0..3 {
            session.advance_to_credentials_gatherer().unwrap();
            session.advance_to_form().unwrap();
            assert_eq!(session.state(), SessionState::InUlForm);
        }
        session.advance_to_credentials_gatherer().unwrap();
        assert_eq!(session.state(), SessionState::InCredentialsGatherer);
    }

    #[test]
    fn advance_to_credentials_gatherer_from_idle_fails() {
        let mut session = session_in(SessionState::Idle);
        let err = session.advance_to_credentials_gatherer().unwrap_err();
        assert!(matches!(err, SessionError::IllegalState { .. }));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn advance_to_form_requires_gatherer() {
        for state in [
            SessionState::Idle,
            SessionState::Authenticating,
            SessionState::InUlForm,
            SessionState::Succeeded,
        ] {
            let mut session = session_in(state);
            assert!(session.advance_to_form().is_err(), "from {state}");
            assert_eq!(session.state(), state);
        }
    }

    #[test]
    fn finish_is_idempotent_for_same_outcome() {
        let mut session = session_in(SessionState::InUlForm);
        let outcome = AuthnOutcome::success(principal("alice"));
        session.finish(outcome.clone()).unwrap();
        session.finish(outcome.clone()).unwrap();
        assert_eq!(session.state(), SessionState::Succeeded);
        assert_eq!(session.outcome(), Some(&outcome));
    }

    #[test]
    fn finish_with_different_outcome_fails() {
        let mut session = session_in(SessionState::InUlForm);
        session
            .finish(AuthnOutcome::success(principal("alice")))
            .unwrap();

        let err = session
            .finish(AuthnOutcome::success(principal("mallory")))
            .unwrap_err();
        assert!(matches!(err, SessionError::DoubleFinish { .. }));

        let err = session.finish(AuthnOutcome::failure("late")).unwrap_err();
        assert!(matches!(err, SessionError::DoubleFinish { .. }));
        assert_eq!(session.state(), SessionState::Succeeded);
    }

    #[test]
    fn finish_failure_from_idle() {
        let mut session = session_in(SessionState::Idle);
        session.finish(AuthnOutcome::failure("bad request")).unwrap();
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn finish_success_from_idle_is_illegal() {
        let mut session = session_in(SessionState::Idle);
        let err = session
            .finish(AuthnOutcome::success(principal("alice")))
            .unwrap_err();
        assert!(matches!(err, SessionError::IllegalState { .. }));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn expiry_uses_last_touch() {
        let session = AuthnSession::new("s");
        let timeout = Duration::minutes(30);
        assert!(!session.is_expired(timeout, Utc::now()));
        assert!(session.is_expired(timeout, Utc::now() + Duration::minutes(31)));
    }

    #[test]
    fn state_display_names() {
        assert_eq!(SessionState::InUlForm.to_string(), "IN_UL_FORM");
        assert_eq!(
            SessionState::InCredentialsGatherer.to_string(),
            "IN_CREDENTIALS_GATHERER"
        );
    }

    #[test]
    fn session_serialization_roundtrip() {
        let session = session_in(SessionState::InUlForm);
        let json = serde_json::to_string(&session).unwrap();
        let back: AuthnSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state(), SessionState::InUlForm);
        assert_eq!(back.pending_context(), session.pending_context());
    }
}
