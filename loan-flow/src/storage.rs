use async_trait::async_trait;
use chrono::TimeDelta;
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::{FlowError, Result},
    state::{ApplicationState, ApplicationStateSnapshot},
};

/// Exclusive access to one session. Holding the lock serializes turns for that session.
pub type SessionHandle = Arc<Mutex<ApplicationState>>;

/// Trait for storing and retrieving application sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the session, creating a fresh one at Greeting if the id is unknown.
    async fn acquire(&self, session_id: &str) -> Result<SessionHandle>;

    async fn get(&self, session_id: &str) -> Result<Option<ApplicationStateSnapshot>>;

    async fn remove(&self, session_id: &str) -> Result<bool>;

    /// Drops closed sessions that have not been touched for `max_idle`. Returns how many went.
    async fn purge_idle(&self, max_idle: Duration) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory implementation of SessionStore
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionHandle>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn acquire(&self, session_id: &str) -> Result<SessionHandle> {
        if session_id.trim().is_empty() {
            return Err(FlowError::validation("session_id", "must not be empty"));
        }
        let handle = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id, "Creating new session");
                Arc::new(Mutex::new(ApplicationState::new(session_id)))
            })
            .value()
            .clone();
        Ok(handle)
    }

    async fn get(&self, session_id: &str) -> Result<Option<ApplicationStateSnapshot>> {
        let Some(handle) = self.sessions.get(session_id).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        let state = handle.lock().await;
        Ok(Some(ApplicationStateSnapshot::from(&*state)))
    }

    async fn remove(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.remove(session_id).is_some())
    }

    async fn purge_idle(&self, max_idle: Duration) -> Result<usize> {
        let max_idle = TimeDelta::from_std(max_idle)
            .map_err(|err| FlowError::Config(format!("session idle timeout: {err}")))?;

        let mut purged = 0;
        self.sessions.retain(|_, handle| {
            // someone is about to lock it
            if Arc::strong_count(handle) > 1 {
                return true;
            }
            let Ok(state) = handle.try_lock() else {
                return true;
            };
            let expired = state.current_stage.is_terminal() && state.idle_for() >= max_idle;
            if expired {
                purged += 1;
            }
            !expired
        });

        if purged > 0 {
            info!(purged, remaining = self.sessions.len(), "Purged idle sessions");
        }
        Ok(purged)
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Stage;

    #[tokio::test]
    async fn unknown_ids_start_at_greeting() {
        let store = InMemorySessionStore::new();
        assert!(store.get("s-1").await.unwrap().is_none());

        let handle = store.acquire("s-1").await.unwrap();
        assert_eq!(handle.lock().await.current_stage, Stage::Greeting);
        assert_eq!(store.len(), 1);

        let again = store.acquire("s-1").await.unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn empty_ids_are_rejected() {
        let store = InMemorySessionStore::new();
        assert!(matches!(
            store.acquire("  ").await,
            Err(FlowError::Validation { .. })
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn concurrent_first_turns_share_one_session() {
        let store = Arc::new(InMemorySessionStore::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.acquire("shared").await.unwrap() }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert_eq!(store.len(), 1);
        assert!(handles.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[tokio::test]
    async fn purge_only_takes_idle_closed_sessions() {
        let store = InMemorySessionStore::new();
        for id in ["open", "closed", "recent"] {
            store.acquire(id).await.unwrap();
        }
        {
            let handle = store.acquire("closed").await.unwrap();
            let mut state = handle.lock().await;
            state.current_stage = Stage::Closure;
            state.updated_at -= TimeDelta::hours(2);
        }
        {
            let handle = store.acquire("recent").await.unwrap();
            handle.lock().await.current_stage = Stage::Closure;
        }
        {
            let handle = store.acquire("open").await.unwrap();
            handle.lock().await.updated_at -= TimeDelta::hours(2);
        }

        let purged = store.purge_idle(Duration::from_secs(3_600)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get("closed").await.unwrap().is_none());
        assert!(store.get("open").await.unwrap().is_some());
        assert!(store.get("recent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_skips_sessions_in_use() {
        let store = InMemorySessionStore::new();
        let handle = store.acquire("busy").await.unwrap();
        {
            let mut state = handle.lock().await;
            state.current_stage = Stage::Closure;
            state.updated_at -= TimeDelta::hours(2);
        }
        assert_eq!(store.purge_idle(Duration::from_secs(60)).await.unwrap(), 0);
        drop(handle);
        assert_eq!(store.purge_idle(Duration::from_secs(60)).await.unwrap(), 1);
    }
}
