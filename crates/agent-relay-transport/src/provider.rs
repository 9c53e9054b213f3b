//! [`AgentProvider`] backed by the relay.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use agent_relay_core::{
    AgentContext, AgentError, AgentProvider, CancellationToken, KeyValueStorage, StatusStream,
};
use agent_relay_session::{DEFAULT_STORAGE_KEY, SessionStore};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::DropGuard;
use uuid::Uuid;

use crate::{
    client::{RelayClient, SessionEvent, SessionSubscription},
    protocol::RelayMessage,
};

#[derive(Debug, Default, Clone, Copy)]
struct History {
    can_undo: bool,
    can_redo: bool,
}

/// State shared between the provider and its in-flight streams.
struct Shared {
    client: RelayClient,
    agent_id: String,
    history: Mutex<History>,
    /// Run generation that currently owns each session id.
    live: Mutex<HashMap<String, u64>>,
    next_run: AtomicU64,
}

impl Shared {
    /// Send `agent-abort` if `generation` still owns the session.
    fn abort_run(&self, session_id: &str, generation: Option<u64>) {
        let mut live = self.live.lock();
        let owned = match generation {
            Some(g) => live.get(session_id) == Some(&g),
            None => live.contains_key(session_id),
        };
        if !owned {
            return;
        }
        live.remove(session_id);
        if let Err(e) = self.client.abort_agent(&self.agent_id, session_id) {
            tracing::debug!(session_id, "Could not send abort: {e}");
        }
    }
}

/// Runs agents through a [`RelayClient`].
///
/// Follow-ups and resumes reuse the session id; the relay supersedes any
/// run still active under it.
#[derive(Clone)]
pub struct RelayAgentProvider {
    shared: Arc<Shared>,
    storage_key: String,
}

impl RelayAgentProvider {
    #[must_use]
    pub fn new(client: RelayClient, agent_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                agent_id: agent_id.into(),
                history: Mutex::new(History::default()),
                live: Mutex::new(HashMap::new()),
                next_run: AtomicU64::new(1),
            }),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }

    /// Storage key persisted sessions are read from on resume.
    #[must_use]
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }

    #[must_use]
    pub fn client(&self) -> &RelayClient {
        &self.shared.client
    }
}

#[async_trait]
impl AgentProvider for RelayAgentProvider {
    fn send(&self, mut context: AgentContext, cancel: CancellationToken) -> StatusStream {
        let session_id = context
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        context.session_id = Some(session_id.clone());
        let generation = self.shared.next_run.fetch_add(1, Ordering::Relaxed);
        RelayRun::new(Arc::clone(&self.shared), session_id, generation, context, cancel).into_stream()
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn supports_follow_up(&self) -> bool {
        true
    }

    fn resume(
        &self,
        session_id: &str,
        cancel: CancellationToken,
        storage: Arc<dyn KeyValueStorage>,
    ) -> StatusStream {
        let store = SessionStore::new(storage, self.storage_key.clone());
        match store.get(session_id) {
            Ok(Some(session)) => {
                tracing::info!(session_id, "Resuming relay session");
                let context = session.context.with_session_id(session_id);
                self.send(context, cancel)
            }
            Ok(None) => failed(format!("No persisted session {session_id}")),
            Err(e) => failed(e.to_string()),
        }
    }

    async fn abort(&self, session_id: &str) {
        self.shared.abort_run(session_id, None);
    }

    async fn undo(&self) -> Result<(), AgentError> {
        self.shared
            .client
            .undo_agent(&self.shared.agent_id)
            .map_err(|_| AgentError::ConnectionLost)?;
        let mut history = self.shared.history.lock();
        history.can_undo = false;
        history.can_redo = true;
        Ok(())
    }

    fn can_undo(&self) -> bool {
        self.shared.history.lock().can_undo
    }

    async fn redo(&self) -> Result<(), AgentError> {
        self.shared
            .client
            .redo_agent(&self.shared.agent_id)
            .map_err(|_| AgentError::ConnectionLost)?;
        let mut history = self.shared.history.lock();
        history.can_undo = true;
        history.can_redo = false;
        Ok(())
    }

    fn can_redo(&self) -> bool {
        self.shared.history.lock().can_redo
    }

    /// Connect if needed and report whether the relay has a handler for this agent.
    async fn check_connection(&self) -> bool {
        let client = &self.shared.client;
        if let Err(e) = client.connect().await {
            tracing::debug!("Relay unreachable: {e}");
            return false;
        }
        let mut handlers = client.subscribe_handlers();
        let listed = tokio::time::timeout(
            client.config().handshake_timeout(),
            handlers.wait_for(Option::is_some),
        )
        .await;
        match listed {
            Ok(Ok(list)) => list
                .as_ref()
                .is_some_and(|ids| ids.iter().any(|id| id == &self.shared.agent_id)),
            _ => false,
        }
    }
}

fn failed(message: String) -> StatusStream {
    futures::stream::once(async move { Err(AgentError::Failed(message)) }).boxed()
}

enum Phase {
    /// Not yet sent; holds the request context.
    Idle(AgentContext),
    Streaming,
    Completed,
    Errored(AgentError),
    Cancelled,
    /// The stream has ended.
    Finished,
}

/// One relay run, polled as a stream of statuses.
///
/// Queued statuses are always drained before a terminal phase is reported,
/// so a burst ending in `agent-done` is delivered in full.
struct RelayRun {
    shared: Arc<Shared>,
    session_id: String,
    generation: u64,
    phase: Phase,
    queue: VecDeque<String>,
    events: Option<SessionSubscription>,
    cancel: CancellationToken,
    /// Stops the abort watcher once the run settles or is dropped.
    abort_watcher: Option<DropGuard>,
}

impl RelayRun {
    fn new(
        shared: Arc<Shared>,
        session_id: String,
        generation: u64,
        context: AgentContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            session_id,
            generation,
            phase: Phase::Idle(context),
            queue: VecDeque::new(),
            events: None,
            cancel,
            abort_watcher: None,
        }
    }

    fn into_stream(self) -> StatusStream {
        futures::stream::unfold(self, |mut run| async move {
            let item = run.next().await?;
            Some((item, run))
        })
        .boxed()
    }

    async fn next(&mut self) -> Option<Result<String, AgentError>> {
        loop {
            if let Some(status) = self.queue.pop_front() {
                return Some(Ok(status));
            }

            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Idle(context) => {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    self.phase = self.start(context).await;
                    continue;
                }
                Phase::Streaming => self.phase = Phase::Streaming,
                Phase::Errored(e) => return Some(Err(e)),
                Phase::Completed | Phase::Cancelled | Phase::Finished => return None,
            }

            let Some(events) = self.events.as_mut() else {
                self.phase = Phase::Errored(AgentError::ConnectionLost);
                continue;
            };
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                event = events.recv() => Some(event),
            };
            let Some(event) = event else {
                tracing::debug!(session_id = %self.session_id, "Relay run cancelled");
                self.phase = Phase::Cancelled;
                continue;
            };
            self.apply(event);
            // Drain whatever else already arrived before looking at the phase.
            while matches!(self.phase, Phase::Streaming) {
                let Some(event) = self.events.as_mut().and_then(SessionSubscription::try_recv)
                else {
                    break;
                };
                self.apply(Some(event));
            }
        }
    }

    async fn start(&mut self, context: AgentContext) -> Phase {
        let client = self.shared.client.clone();
        if let Err(e) = client.connect().await {
            tracing::warn!(session_id = %self.session_id, "Relay unreachable: {e}");
            return Phase::Errored(AgentError::ConnectionLost);
        }

        self.events = Some(client.subscribe_session(&self.session_id));
        {
            let mut live = self.shared.live.lock();
            live.insert(self.session_id.clone(), self.generation);
            if let Err(e) =
                client.send_agent_request(&self.shared.agent_id, Some(&self.session_id), context)
            {
                live.remove(&self.session_id);
                tracing::warn!(session_id = %self.session_id, "Failed to send request: {e}");
                return Phase::Errored(AgentError::ConnectionLost);
            }
        }
        self.abort_watcher = Some(self.watch_cancel());
        Phase::Streaming
    }

    /// Spawn the task that tells the relay when the run is cancelled.
    fn watch_cancel(&self) -> DropGuard {
        let done = CancellationToken::new();
        let stop = done.clone();
        let cancel = self.cancel.clone();
        let shared = Arc::clone(&self.shared);
        let session_id = self.session_id.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => shared.abort_run(&session_id, Some(generation)),
                () = stop.cancelled() => {}
            }
        });
        done.drop_guard()
    }

    fn apply(&mut self, event: Option<SessionEvent>) {
        match event {
            Some(SessionEvent::Message(RelayMessage::AgentStatus { content, .. })) => {
                self.queue.push_back(content);
            }
            Some(SessionEvent::Message(RelayMessage::AgentDone { .. })) => {
                self.settle();
                let mut history = self.shared.history.lock();
                history.can_undo = true;
                history.can_redo = false;
                self.phase = Phase::Completed;
            }
            Some(SessionEvent::Message(RelayMessage::AgentError { content, .. })) => {
                self.settle();
                self.phase = Phase::Errored(AgentError::Handler(content));
            }
            Some(SessionEvent::Message(_)) => {}
            Some(SessionEvent::Disconnected) | None => {
                self.settle();
                self.phase = Phase::Errored(AgentError::ConnectionLost);
            }
        }
    }

    /// Release the session id if this run still owns it.
    fn settle(&mut self) {
        self.abort_watcher.take();
        let mut live = self.shared.live.lock();
        if live.get(&self.session_id) == Some(&self.generation) {
            live.remove(&self.session_id);
        }
    }
}

impl Drop for RelayRun {
    /// A stream dropped mid-run frees its session id and aborts the relay side.
    fn drop(&mut self) {
        if matches!(self.phase, Phase::Streaming) {
            tracing::debug!(session_id = %self.session_id, "Relay run dropped while streaming");
            self.shared.abort_run(&self.session_id, Some(self.generation));
        }
    }
}
