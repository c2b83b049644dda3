//! Session lookup and storage.
//!
//! The IdP only ever touches a session through a [`SessionHandle`]. The
//! handle's mutex is held for the whole request so that a state check and
//! the transition that follows it happen as one step per session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::AuthnSession;
use crate::config::IdpConfig;

/// Shared, lockable reference to one session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    created: bool,
    inner: Arc<Mutex<AuthnSession>>,
}

impl SessionHandle {
    pub fn new(session: AuthnSession, created: bool) -> Self {
        Self {
            id: session.id().to_string(),
            created,
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when this request created the session, so the cookie must be set.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Acquire exclusive access to the session.
    pub async fn lock(&self) -> MutexGuard<'_, AuthnSession> {
        self.inner.lock().await
    }

    /// Look at the session without waiting. `None` while a request holds it.
    fn peek<T>(&self, f: impl FnOnce(&AuthnSession) -> T) -> Option<T> {
        self.inner.try_lock().ok().map(|session| f(&session))
    }

    fn reused(&self) -> Self {
        Self {
            id: self.id.clone(),
            created: false,
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Source of sessions, keyed by the opaque token in the session cookie.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Return the live session named by `token`, or create a new one.
    /// `None` means no session could be obtained at all.
    async fn create_session(&self, token: Option<&str>) -> Option<SessionHandle>;

    /// Return the live session named by `token`, if any.
    async fn find_session(&self, token: Option<&str>) -> Option<SessionHandle>;
}

/// Process-local session store with idle expiry and a capacity limit.
#[derive(Debug)]
pub struct InMemorySessionManager {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    idle_timeout: Duration,
    max_sessions: usize,
}

impl InMemorySessionManager {
    pub fn new(idle_timeout: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
            max_sessions,
        }
    }

    /// Store sized and timed by the `[idp]` configuration section.
    pub fn from_config(config: &IdpConfig) -> Self {
        Self::new(
            Duration::minutes(i64::from(config.session_idle_timeout_minutes)),
            config.max_sessions,
        )
    }

    /// Number of stored sessions, expired ones included.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Drop every session idle past the timeout. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let idle_timeout = self.idle_timeout;
        self.evict(|session, now| session.is_expired(idle_timeout, now)).await
    }

    /// Make room in a full store. Finished exchanges are never resumed, so
    /// they go along with the expired sessions.
    async fn make_room(&self) -> usize {
        let idle_timeout = self.idle_timeout;
        self.evict(|session, now| {
            session.state().is_terminal() || session.is_expired(idle_timeout, now)
        })
        .await
    }

    /// Remove the sessions `doomed` picks. A session held by an in-flight
    /// request is in use and always stays.
    async fn evict(&self, doomed: impl Fn(&AuthnSession, DateTime<Utc>) -> bool) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, handle| {
            !handle.peek(|session| doomed(session, now)).unwrap_or(false)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, remaining = sessions.len(), "purged sessions");
        }
        removed
    }

    /// Look up a live session. Expired sessions are removed on the way.
    async fn live(&self, token: &str) -> Option<SessionHandle> {
        let handle = self.sessions.read().await.get(token).cloned()?;
        let expired = handle
            .peek(|session| session.is_expired(self.idle_timeout, Utc::now()))
            .unwrap_or(false);
        if expired {
            self.sessions.write().await.remove(token);
            debug!(session_id = %token, "session expired");
            return None;
        }
        Some(handle.reused())
    }
}

#[async_trait]
impl SessionManager for InMemorySessionManager {
    async fn create_session(&self, token: Option<&str>) -> Option<SessionHandle> {
        if let Some(token) = token {
            if let Some(handle) = self.live(token).await {
                let finished = handle
                    .peek(|session| session.state().is_terminal())
                    .unwrap_or(false);
                if !finished {
                    return Some(handle);
                }
                // A finished exchange is never resumed; start over with a new id.
                self.sessions.write().await.remove(token);
            }
        }

        if self.len().await >= self.max_sessions {
            self.make_room().await;
        }

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            warn!(
                max_sessions = self.max_sessions,
                "session store is full, refusing to create a session"
            );
            return None;
        }
        let id = Uuid::new_v4().simple().to_string();
        let handle = SessionHandle::new(AuthnSession::new(id.clone()), true);
        sessions.insert(id.clone(), handle.reused());
        debug!(session_id = %id, "created session");
        Some(handle)
    }

    async fn find_session(&self, token: Option<&str>) -> Option<SessionHandle> {
        self.live(token?).await
    }
}
