//! One interpreter session per REPL context.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::SessionConfig;
use crate::hooks::Hooks;
use crate::ipc::{ReplSession, SessionError};
use crate::registry::ContextId;

/// Owns the sessions of every REPL context.
#[derive(Debug)]
pub struct SessionManager {
    config: Arc<SessionConfig>,
    hooks: Hooks,
    sessions: Mutex<HashMap<ContextId, Arc<ReplSession>>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, hooks: Hooks) -> Self {
        Self {
            config: Arc::new(config),
            hooks,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session for `context`, connecting with the shared config if there is
    /// none or the previous one has died.
    ///
    /// A dead session is torn down when it is replaced, which settles its
    /// outstanding requests and drops its name cache.
    pub async fn connect(&self, context: &ContextId) -> Result<Arc<ReplSession>, SessionError> {
        self.connect_with(context, Arc::clone(&self.config)).await
    }

    /// Like [`connect`](Self::connect) with a config for this context only.
    ///
    /// The map is not locked while connecting, so a slow or retrying connect
    /// never holds up other contexts. If another caller connects the same
    /// context first, its session wins and this one is torn down.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConnectionFailed`] once every attempt failed.
    pub async fn connect_with(
        &self,
        context: &ContextId,
        config: Arc<SessionConfig>,
    ) -> Result<Arc<ReplSession>, SessionError> {
        if let Some(live) = self.live(context).await {
            return Ok(live);
        }

        let session =
            Arc::new(ReplSession::connect(context.clone(), config, self.hooks.clone()).await?);

        let mut sessions = self.sessions.lock().await;
        let winner = sessions
            .get(context)
            .filter(|existing| existing.is_connected())
            .cloned();
        if let Some(winner) = winner {
            drop(sessions);
            session.teardown().await;
            return Ok(winner);
        }

        let replaced = sessions.insert(context.clone(), Arc::clone(&session));
        drop(sessions);
        if let Some(dead) = replaced {
            info!("{context}: replacing dead session");
            dead.teardown().await;
        }
        Ok(session)
    }

    async fn live(&self, context: &ContextId) -> Option<Arc<ReplSession>> {
        self.sessions
            .lock()
            .await
            .get(context)
            .filter(|session| session.is_connected())
            .cloned()
    }

    /// Current session for `context`, live or not.
    pub async fn get(&self, context: &ContextId) -> Option<Arc<ReplSession>> {
        self.sessions.lock().await.get(context).cloned()
    }

    /// Tear down and forget the session for `context`.
    ///
    /// Returns false if there was none.
    pub async fn teardown(&self, context: &ContextId) -> bool {
        let removed = self.sessions.lock().await.remove(context);
        match removed {
            Some(session) => {
                session.teardown().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every session.
    pub async fn teardown_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, session) in sessions {
            session.teardown().await;
        }
    }

    /// Number of sessions held, including dead ones not yet replaced.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
