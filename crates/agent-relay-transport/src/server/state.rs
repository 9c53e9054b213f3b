//! Relay tables: registered handlers, active sessions and browser sockets.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use agent_relay_core::CancellationToken;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};

use super::handler::AgentHandler;
use crate::{config::RelayServerConfig, protocol::RelayMessage};

/// Outbound channel of one socket, carrying serialized frames.
pub(crate) type Outbound = mpsc::UnboundedSender<String>;

/// Serialize and queue a frame. Returns `false` if the socket is gone.
pub(crate) fn send_frame<T: Serialize>(tx: &Outbound, msg: &T) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => tx.send(json).is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize message: {e}");
            false
        }
    }
}

pub(crate) struct Registration {
    pub handler: Arc<dyn AgentHandler>,
    /// Owning handler connection; `None` for in-process handlers.
    pub conn_id: Option<u64>,
}

pub(crate) struct ActiveSession {
    pub agent_id: String,
    pub browser: u64,
    pub token: CancellationToken,
    pub generation: u64,
}

/// An entry removed from the active table whose handler must be told to abort.
pub(crate) struct Evicted {
    pub session_id: String,
    pub agent_id: String,
}

/// Shared relay state. Every table has a single owner: this struct.
pub(crate) struct RelayState {
    pub config: RelayServerConfig,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
    handlers: RwLock<HashMap<String, Registration>>,
    sessions: Mutex<HashMap<String, ActiveSession>>,
    browsers: RwLock<HashMap<u64, Outbound>>,
    next_conn: AtomicU64,
    next_generation: AtomicU64,
}

impl RelayState {
    pub(crate) fn new(config: RelayServerConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            shutdown,
            handlers: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            browsers: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    // --- handlers ---

    /// Register a handler, replacing any prior registration for the id.
    pub(crate) async fn register(
        &self,
        agent_id: &str,
        handler: Arc<dyn AgentHandler>,
        conn_id: Option<u64>,
    ) {
        let previous = self
            .handlers
            .write()
            .await
            .insert(agent_id.to_string(), Registration { handler, conn_id });
        if previous.is_some() {
            tracing::info!(agent_id, "Replaced handler registration");
        } else {
            tracing::info!(agent_id, "Registered handler");
        }
        self.broadcast_handlers().await;
    }

    /// Remove a registration. With `conn_id`, only a registration owned by
    /// that connection is removed.
    pub(crate) async fn unregister(&self, agent_id: &str, conn_id: Option<u64>) -> bool {
        let removed = {
            let mut handlers = self.handlers.write().await;
            match handlers.get(agent_id) {
                Some(reg) if conn_id.is_none() || reg.conn_id == conn_id => {
                    handlers.remove(agent_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::info!(agent_id, "Unregistered handler");
            self.broadcast_handlers().await;
        }
        removed
    }

    /// Drop every registration owned by a handler connection.
    pub(crate) async fn unregister_connection(&self, conn_id: u64) -> Vec<String> {
        let removed: Vec<String> = {
            let mut handlers = self.handlers.write().await;
            let ids: Vec<String> = handlers
                .iter()
                .filter(|(_, reg)| reg.conn_id == Some(conn_id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                handlers.remove(id);
            }
            ids
        };
        if !removed.is_empty() {
            tracing::info!(conn_id, agents = ?removed, "Handler connection closed");
            self.broadcast_handlers().await;
        }
        removed
    }

    pub(crate) async fn handler(&self, agent_id: &str) -> Option<Arc<dyn AgentHandler>> {
        self.handlers
            .read()
            .await
            .get(agent_id)
            .map(|reg| Arc::clone(&reg.handler))
    }

    /// Registered agent ids, sorted.
    pub(crate) async fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // --- browsers ---

    /// Track a browser socket and send it the current handler list.
    ///
    /// The snapshot is taken under the browsers write lock, so any later
    /// registration change is broadcast to this socket too.
    pub(crate) async fn add_browser(&self, conn_id: u64, tx: Outbound) {
        let mut browsers = self.browsers.write().await;
        browsers.insert(conn_id, tx.clone());
        let handlers = self.handler_ids().await;
        send_frame(&tx, &RelayMessage::Handlers { handlers });
    }

    pub(crate) async fn remove_browser(&self, conn_id: u64) {
        self.browsers.write().await.remove(&conn_id);
    }

    pub(crate) async fn browser_count(&self) -> usize {
        self.browsers.read().await.len()
    }

    /// Send the current handler list to every browser.
    ///
    /// Holding the write lock serializes broadcasts, so the last frame a
    /// browser sees always reflects the latest registration state.
    async fn broadcast_handlers(&self) {
        let browsers = self.browsers.write().await;
        let msg = RelayMessage::Handlers {
            handlers: self.handler_ids().await,
        };
        for tx in browsers.values() {
            send_frame(tx, &msg);
        }
    }

    // --- active sessions ---

    /// Insert an active session, evicting any live entry with the same id
    /// owned by the same browser.
    ///
    /// Returns the new entry's generation and token, plus the evicted entry,
    /// or `None` if another browser owns a live session with this id.
    pub(crate) fn begin_session(
        &self,
        session_id: &str,
        agent_id: &str,
        browser: u64,
    ) -> Option<(u64, CancellationToken, Option<Evicted>)> {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(session_id)
            .is_some_and(|s| s.browser != browser)
        {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let previous = sessions.insert(
            session_id.to_string(),
            ActiveSession {
                agent_id: agent_id.to_string(),
                browser,
                token: token.clone(),
                generation,
            },
        );
        let evicted = previous.map(|old| {
            old.token.cancel();
            Evicted {
                session_id: session_id.to_string(),
                agent_id: old.agent_id,
            }
        });
        Some((generation, token, evicted))
    }

    pub(crate) fn is_current(&self, session_id: &str, generation: u64) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .is_some_and(|s| s.generation == generation)
    }

    /// Remove the entry if it still belongs to `generation`.
    pub(crate) fn finish_session(&self, session_id: &str, generation: u64) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(session_id)
            .is_some_and(|s| s.generation == generation)
        {
            sessions.remove(session_id);
            true
        } else {
            false
        }
    }

    /// Cancel and remove a session on behalf of the browser that owns it.
    pub(crate) fn abort_session(&self, session_id: &str, browser: u64) -> Option<Evicted> {
        let mut sessions = self.sessions.lock();
        if !sessions.get(session_id).is_some_and(|s| s.browser == browser) {
            return None;
        }
        let old = sessions.remove(session_id)?;
        old.token.cancel();
        Some(Evicted {
            session_id: session_id.to_string(),
            agent_id: old.agent_id,
        })
    }

    /// Cancel and remove every session owned by a browser connection.
    pub(crate) fn abort_browser_sessions(&self, browser: u64) -> Vec<Evicted> {
        let mut sessions = self.sessions.lock();
        let ids: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.browser == browser)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                let old = sessions.remove(&id)?;
                old.token.cancel();
                Some(Evicted {
                    session_id: id,
                    agent_id: old.agent_id,
                })
            })
            .collect()
    }

    pub(crate) fn active_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Tell handlers to abort evicted runs.
    pub(crate) async fn notify_aborted(&self, evicted: Vec<Evicted>) {
        for entry in evicted {
            if let Some(handler) = self.handler(&entry.agent_id).await {
                tracing::debug!(
                    agent_id = %entry.agent_id,
                    session_id = %entry.session_id,
                    "Notifying handler of abort"
                );
                handler.abort(&entry.session_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_relay_core::AgentContext;
    use futures::StreamExt;

    use super::*;
    use crate::server::handler::HandlerEventStream;

    struct Silent;

    #[async_trait::async_trait]
    impl AgentHandler for Silent {
        fn run(&self, _: &str, _: AgentContext, _: CancellationToken) -> HandlerEventStream {
            futures::stream::empty().boxed()
        }
    }

    fn state() -> RelayState {
        RelayState::new(RelayServerConfig::default(), CancellationToken::new())
    }

    #[tokio::test]
    async fn registration_is_broadcast_to_browsers() {
        let state = state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.add_browser(1, tx).await;
        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"handlers","handlers":[]}"#);

        state.register("claude", Arc::new(Silent), None).await;
        assert_eq!(
            rx.recv().await.unwrap(),
            r#"{"type":"handlers","handlers":["claude"]}"#
        );
        assert!(state.unregister("claude", None).await);
        assert_eq!(rx.recv().await.unwrap(), r#"{"type":"handlers","handlers":[]}"#);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn browser_joining_during_registration_sees_final_list() {
        for _ in 0..50 {
            let state = Arc::new(state());
            let (tx, mut rx) = mpsc::unbounded_channel();

            let joining = tokio::spawn({
                let state = Arc::clone(&state);
                async move { state.add_browser(1, tx).await }
            });
            let registering = tokio::spawn({
                let state = Arc::clone(&state);
                async move { state.register("claude", Arc::new(Silent), None).await }
            });
            joining.await.unwrap();
            registering.await.unwrap();

            let mut last = None;
            while let Ok(frame) = rx.try_recv() {
                last = Some(frame);
            }
            assert_eq!(
                last.as_deref(),
                Some(r#"{"type":"handlers","handlers":["claude"]}"#)
            );
        }
    }

    #[tokio::test]
    async fn connection_only_unregisters_its_own_handlers() {
        let state = state();
        state.register("a", Arc::new(Silent), Some(1)).await;
        state.register("b", Arc::new(Silent), Some(2)).await;
        assert!(!state.unregister("b", Some(1)).await);
        assert_eq!(state.unregister_connection(1).await, vec!["a".to_string()]);
        assert_eq!(state.handler_ids().await, vec!["b".to_string()]);
    }

    #[test]
    fn duplicate_session_supersedes_previous_entry() {
        let state = state();
        let (first, first_token, evicted) = state.begin_session("s", "a", 1).unwrap();
        assert!(evicted.is_none());
        let (second, _, evicted) = state.begin_session("s", "a", 1).unwrap();

        assert!(first_token.is_cancelled());
        assert_eq!(evicted.unwrap().agent_id, "a");
        assert_eq!(state.active_session_count(), 1);
        assert!(!state.is_current("s", first));
        assert!(!state.finish_session("s", first));
        assert!(state.finish_session("s", second));
        assert_eq!(state.active_session_count(), 0);
    }

    #[test]
    fn session_of_another_browser_is_not_superseded() {
        let state = state();
        let (generation, token, _) = state.begin_session("s", "a", 1).unwrap();
        assert!(state.begin_session("s", "a", 2).is_none());
        assert!(!token.is_cancelled());
        assert!(state.is_current("s", generation));

        assert!(state.finish_session("s", generation));
        assert!(state.begin_session("s", "a", 2).is_some());
    }

    #[test]
    fn abort_requires_owning_browser() {
        let state = state();
        let (_, token, _) = state.begin_session("s", "a", 1).unwrap();
        assert!(state.abort_session("s", 2).is_none());
        assert!(!token.is_cancelled());
        assert!(state.abort_session("s", 1).is_some());
        assert!(token.is_cancelled());
    }

    #[test]
    fn browser_close_cancels_owned_sessions() {
        let state = state();
        let (_, a, _) = state.begin_session("s1", "x", 1).unwrap();
        let (_, b, _) = state.begin_session("s2", "x", 1).unwrap();
        let (_, other, _) = state.begin_session("s3", "x", 2).unwrap();

        assert_eq!(state.abort_browser_sessions(1).len(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(!other.is_cancelled());
        assert_eq!(state.active_session_count(), 1);
    }
}
