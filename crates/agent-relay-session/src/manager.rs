//! Session manager for orchestrating agent sessions.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use agent_relay_core::{
    AgentContext, AgentError, AgentProvider, AgentSession, CancellationToken, ElementRef,
    KeyValueStorage, Page, Point, Rect, SessionId, SnippetGenerator, StatusStream,
};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    events::{NoopEvents, SessionEvents},
    store::{DEFAULT_STORAGE_KEY, SessionStore},
};

const STATUS_THINKING: &str = "Thinking…";
const STATUS_RETRYING: &str = "Retrying…";
const STATUS_RESUMING: &str = "Resuming…";

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Errored sessions older than this are not revived on resume.
    pub error_resume_window_secs: u64,
    /// Storage key the session table is persisted under.
    pub storage_key: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            error_resume_window_secs: 30,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
        }
    }
}

/// Parameters of [`SessionManager::start`].
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Selected elements. Ignored for follow-ups.
    pub elements: Vec<ElementRef>,
    pub prompt: String,
    /// UI anchor point.
    pub position: Point,
    /// One rectangle per selected element.
    pub selection_bounds: Vec<Rect>,
    /// Existing session to continue.
    pub session_id: Option<SessionId>,
    /// Provider-specific options.
    pub options: Option<Value>,
}

struct Run {
    id: u64,
    token: CancellationToken,
}

struct UndoEntry {
    session: AgentSession,
    elements: Vec<ElementRef>,
}

#[derive(Default)]
struct State {
    /// Streaming and errored sessions.
    sessions: HashMap<SessionId, AgentSession>,
    /// Completed sessions still addressable by dismiss, undo and redo.
    settled: HashMap<SessionId, AgentSession>,
    elements: HashMap<SessionId, Vec<ElementRef>>,
    runs: HashMap<SessionId, Run>,
    undone: Vec<UndoEntry>,
    can_undo: bool,
    can_redo: bool,
}

impl State {
    fn is_current(&self, session_id: &str, run_id: u64) -> bool {
        self.runs.get(session_id).is_some_and(|r| r.id == run_id)
    }
}

enum RunOutcome {
    Completed,
    Cancelled,
    Errored(String),
    Superseded,
}

struct Inner {
    config: ManagerConfig,
    provider: RwLock<Option<Arc<dyn AgentProvider>>>,
    snippets: Arc<dyn SnippetGenerator>,
    page: Arc<dyn Page>,
    events: Arc<dyn SessionEvents>,
    store: SessionStore,
    state: Mutex<State>,
    next_run: AtomicU64,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: ManagerConfig,
    provider: Option<Arc<dyn AgentProvider>>,
    storage: Arc<dyn KeyValueStorage>,
    page: Arc<dyn Page>,
    snippets: Arc<dyn SnippetGenerator>,
    events: Arc<dyn SessionEvents>,
}

impl SessionManagerBuilder {
    #[must_use]
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn AgentProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<dyn SessionEvents>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionManager {
        let store = SessionStore::new(self.storage, self.config.storage_key.clone());
        SessionManager {
            inner: Arc::new(Inner {
                config: self.config,
                provider: RwLock::new(self.provider),
                snippets: self.snippets,
                page: self.page,
                events: self.events,
                store,
                state: Mutex::new(State::default()),
                next_run: AtomicU64::new(1),
            }),
        }
    }
}

/// Owns the lifecycle of concurrent agent sessions.
///
/// Cheap to clone; every clone drives the same session table. Each running
/// session is pulled on its own tokio task.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Start building a manager over the given host capabilities.
    #[must_use]
    pub fn builder(
        storage: Arc<dyn KeyValueStorage>,
        page: Arc<dyn Page>,
        snippets: Arc<dyn SnippetGenerator>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config: ManagerConfig::default(),
            provider: None,
            storage,
            page,
            snippets,
            events: Arc::new(NoopEvents),
        }
    }

    /// Replace the configured provider.
    pub fn set_provider(&self, provider: Option<Arc<dyn AgentProvider>>) {
        *self.inner.provider.write() = provider;
    }

    fn provider(&self) -> Option<Arc<dyn AgentProvider>> {
        self.inner.provider.read().clone()
    }

    /// Start a session, or continue one when `request.session_id` names a
    /// known session and the provider supports follow-ups.
    ///
    /// Returns `None` when no provider is configured.
    pub async fn start(&self, request: StartRequest) -> Option<SessionId> {
        let Some(provider) = self.provider() else {
            tracing::warn!("No agent provider configured, ignoring start");
            return None;
        };

        if let Some(existing) = request.session_id.as_deref() {
            if provider.supports_follow_up() {
                if let Some(id) = self.follow_up(existing, &request, &provider) {
                    return Some(id);
                }
            } else {
                tracing::debug!(session_id = existing, "Provider has no follow-up support");
            }
        }

        let content = self.inner.snippets.generate(&request.elements).await;
        let (tag_name, component_name) = describe_selection(&request.elements);

        let id = Uuid::new_v4().to_string();
        let mut context = AgentContext::new(content, request.prompt).with_session_id(&id);
        context.options = request.options;

        let mut session = AgentSession::new(
            &id,
            context.clone(),
            request.position,
            request.selection_bounds,
        );
        session.tag_name = tag_name;
        session.component_name = component_name;
        session.set_status(STATUS_THINKING);

        let (run_id, token) = {
            let mut state = self.inner.state.lock();
            let run = self.new_run();
            let handle = (run.id, run.token.clone());
            state.runs.insert(id.clone(), run);
            state.elements.insert(id.clone(), request.elements);
            state.sessions.insert(id.clone(), session.clone());
            self.persist(&session);
            handle
        };

        tracing::info!(session_id = %id, "Starting agent session");
        let stream = provider.send(context, token.clone());
        self.spawn_run(session, run_id, token, stream);
        Some(id)
    }

    fn follow_up(
        &self,
        session_id: &str,
        request: &StartRequest,
        provider: &Arc<dyn AgentProvider>,
    ) -> Option<SessionId> {
        let (session, run_id, token) = {
            let mut state = self.inner.state.lock();
            let mut session = state
                .sessions
                .remove(session_id)
                .or_else(|| state.settled.remove(session_id))?;

            let mut context = AgentContext::new(session.context.content.clone(), &request.prompt)
                .with_session_id(session_id);
            context.options = request
                .options
                .clone()
                .or_else(|| session.context.options.clone());
            session.context = context;
            session.begin_streaming(STATUS_THINKING);

            if let Some(previous) = state.runs.remove(session_id) {
                tracing::debug!(session_id, "Superseding in-flight run");
                previous.token.cancel();
            }
            let run = self.new_run();
            let handle = (run.id, run.token.clone());
            state.runs.insert(session_id.to_string(), run);
            state.sessions.insert(session_id.to_string(), session.clone());
            self.persist(&session);
            (session, handle.0, handle.1)
        };

        tracing::info!(session_id, "Continuing agent session");
        let stream = provider.send(session.context.clone(), token.clone());
        self.spawn_run(session, run_id, token, stream);
        Some(session_id.to_string())
    }

    fn new_run(&self) -> Run {
        Run {
            id: self.inner.next_run.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    fn spawn_run(
        &self,
        session: AgentSession,
        run_id: u64,
        token: CancellationToken,
        stream: StatusStream,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.drive(session, run_id, token, stream).await;
        });
    }

    async fn drive(
        &self,
        mut snapshot: AgentSession,
        run_id: u64,
        token: CancellationToken,
        mut stream: StatusStream,
    ) {
        let id = snapshot.id.clone();
        let outcome = loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break RunOutcome::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(status)) => {
                        let Some(updated) = self.record_status(&id, run_id, &status) else {
                            break RunOutcome::Superseded;
                        };
                        snapshot = updated;
                        self.inner.events.on_status(&snapshot, &status);
                    }
                    Some(Err(AgentError::Cancelled)) => break RunOutcome::Cancelled,
                    Some(Err(e)) => break RunOutcome::Errored(e.to_string()),
                    None if token.is_cancelled() => break RunOutcome::Cancelled,
                    None => break RunOutcome::Completed,
                },
            }
        };
        drop(stream);

        match outcome {
            RunOutcome::Completed => self.finish_completed(&id, run_id).await,
            RunOutcome::Cancelled => self.finish_cancelled(snapshot, run_id),
            RunOutcome::Errored(error) => self.finish_errored(&id, run_id, &error),
            RunOutcome::Superseded => {
                tracing::debug!(session_id = %id, run_id, "Dropping output of stale run");
            }
        }
    }

    fn record_status(&self, session_id: &str, run_id: u64, status: &str) -> Option<AgentSession> {
        let mut state = self.inner.state.lock();
        if !state.is_current(session_id, run_id) {
            return None;
        }
        let session = state.sessions.get_mut(session_id)?;
        session.set_status(status);
        let session = session.clone();
        self.persist(&session);
        Some(session)
    }

    async fn finish_completed(&self, session_id: &str, run_id: u64) {
        let provider = self.provider();
        let (snapshot, elements) = {
            let mut state = self.inner.state.lock();
            if !state.is_current(session_id, run_id) {
                return;
            }
            state.runs.remove(session_id);
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            session.complete();
            if let Some(message) = provider.as_ref().and_then(|p| p.completion_message()) {
                session.last_status = message;
            }
            let snapshot = session.clone();
            let elements = state.elements.get(session_id).cloned().unwrap_or_default();
            (snapshot, elements)
        };

        tracing::info!(session_id, "Agent session completed");
        let verdict = self.inner.events.on_complete(&snapshot, &elements).await;

        {
            let mut state = self.inner.state.lock();
            // A follow-up may have started while the completion hook ran.
            if state.runs.contains_key(session_id) {
                return;
            }
            if let Some(error) = verdict {
                if let Some(session) = state.sessions.get_mut(session_id) {
                    session.fail(error);
                    let session = session.clone();
                    self.persist(&session);
                }
            } else if let Some(session) = state.sessions.remove(session_id) {
                state.settled.insert(session_id.to_string(), session);
                if let Err(e) = self.inner.store.remove(session_id) {
                    tracing::warn!(session_id, "Failed to clear persisted session: {e}");
                }
            }
            state.undone.clear();
        }

        if let Some(provider) = provider {
            self.refresh_history(provider.as_ref());
        }
    }

    fn finish_cancelled(&self, snapshot: AgentSession, run_id: u64) {
        let id = snapshot.id.clone();
        let session = {
            let mut state = self.inner.state.lock();
            if !state.is_current(&id, run_id) {
                return;
            }
            state.runs.remove(&id);
            state.elements.remove(&id);
            let session = state.sessions.remove(&id).unwrap_or(snapshot);
            if let Err(e) = self.inner.store.remove(&id) {
                tracing::warn!(session_id = %id, "Failed to clear persisted session: {e}");
            }
            session
        };
        tracing::info!(session_id = %id, "Agent session aborted");
        self.inner.events.on_abort(&session);
    }

    fn finish_errored(&self, session_id: &str, run_id: u64, error: &str) {
        let session = {
            let mut state = self.inner.state.lock();
            if !state.is_current(session_id, run_id) {
                return;
            }
            state.runs.remove(session_id);
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            session.fail(error);
            let session = session.clone();
            self.persist(&session);
            session
        };
        tracing::warn!(session_id, error, "Agent session failed");
        self.inner.events.on_error(&session, error);
    }

    /// Cancel one session, or every session when `session_id` is `None`.
    ///
    /// A global abort also clears the table and wipes persisted state.
    /// Returns `false` if the named session has no running stream.
    pub async fn abort(&self, session_id: Option<&str>) -> bool {
        let provider = self.provider();
        let cancelled: Vec<SessionId> = {
            let mut state = self.inner.state.lock();
            if let Some(id) = session_id {
                let Some(run) = state.runs.get(id) else {
                    return false;
                };
                run.token.cancel();
                vec![id.to_string()]
            } else {
                for run in state.runs.values() {
                    run.token.cancel();
                }
                state.sessions.clear();
                state.settled.clear();
                state.elements.clear();
                if let Err(e) = self.inner.store.clear() {
                    tracing::warn!("Failed to wipe persisted sessions: {e}");
                }
                state.runs.keys().cloned().collect()
            }
        };

        if let Some(provider) = provider {
            for id in &cancelled {
                provider.abort(id).await;
            }
        }
        true
    }

    /// Remove a session, firing `on_dismiss` with its bound elements.
    ///
    /// A running stream is cancelled silently.
    pub fn dismiss(&self, session_id: &str) -> bool {
        let (session, elements) = {
            let mut state = self.inner.state.lock();
            if let Some(run) = state.runs.remove(session_id) {
                run.token.cancel();
            }
            let session = state
                .sessions
                .remove(session_id)
                .or_else(|| state.settled.remove(session_id));
            let elements = state.elements.remove(session_id).unwrap_or_default();
            if let Err(e) = self.inner.store.remove(session_id) {
                tracing::warn!(session_id, "Failed to clear persisted session: {e}");
            }
            (session, elements)
        };

        let Some(session) = session else {
            return false;
        };
        self.inner.events.on_dismiss(&session, &elements);
        true
    }

    /// Re-run an errored session with its existing context.
    pub async fn retry(&self, session_id: &str) -> bool {
        let Some(provider) = self.provider() else {
            return false;
        };

        let (session, run_id, token) = {
            let mut state = self.inner.state.lock();
            let Some(session) = state.sessions.get_mut(session_id) else {
                return false;
            };
            if session.error.is_none() {
                return false;
            }
            session.begin_streaming(STATUS_RETRYING);
            let session = session.clone();
            self.persist(&session);
            let run = self.new_run();
            let handle = (run.id, run.token.clone());
            state.runs.insert(session_id.to_string(), run);
            (session, handle.0, handle.1)
        };

        tracing::info!(session_id, "Retrying agent session");
        let stream = provider.send(session.context.clone(), token.clone());
        self.spawn_run(session, run_id, token, stream);
        true
    }

    /// Undo the change a session made, then dismiss it.
    ///
    /// The session is remembered so a later [`history_redo`](Self::history_redo) can bring
    /// it back. A session still streaming has nothing to undo yet and is refused.
    pub async fn undo(&self, session_id: &str) -> bool {
        let entry = {
            let state = self.inner.state.lock();
            let session = state
                .sessions
                .get(session_id)
                .or_else(|| state.settled.get(session_id))
                .filter(|s| !s.is_streaming)
                .cloned();
            session.map(|session| UndoEntry {
                session,
                elements: state.elements.get(session_id).cloned().unwrap_or_default(),
            })
        };
        let Some(entry) = entry else {
            return false;
        };

        self.inner.events.on_undo(&entry.session, &entry.elements);
        self.inner.state.lock().undone.push(entry);

        if let Some(provider) = self.provider() {
            if let Err(e) = provider.undo().await {
                tracing::warn!(session_id, "Provider undo failed: {e}");
            }
            self.refresh_history(provider.as_ref());
        }
        self.dismiss(session_id)
    }

    /// Global undo, independent of any session.
    pub async fn history_undo(&self) {
        let Some(provider) = self.provider() else {
            return;
        };
        if let Err(e) = provider.undo().await {
            tracing::warn!("Provider undo failed: {e}");
        }
        self.refresh_history(provider.as_ref());
    }

    /// Global redo.
    ///
    /// Also restores the most recently undone session if any of its
    /// elements are still attached. Returns the restored session id.
    pub async fn history_redo(&self) -> Option<SessionId> {
        if let Some(provider) = self.provider() {
            if let Err(e) = provider.redo().await {
                tracing::warn!("Provider redo failed: {e}");
            }
            self.refresh_history(provider.as_ref());
        }

        let entry = self.inner.state.lock().undone.pop()?;
        let UndoEntry {
            mut session,
            elements,
        } = entry;
        let elements: Vec<ElementRef> = elements.into_iter().filter(|e| e.is_connected()).collect();
        if elements.is_empty() {
            tracing::debug!(session_id = %session.id, "Undone elements left the page, not restoring");
            return None;
        }

        session.selection_bounds = elements.iter().map(|e| e.bounding_rect()).collect();
        let id = session.id.clone();
        {
            let mut state = self.inner.state.lock();
            state.settled.insert(id.clone(), session.clone());
            state.elements.insert(id.clone(), elements.clone());
        }
        self.inner.events.on_redo(&session, &elements);
        Some(id)
    }

    /// Dismiss an errored session and hand back its prompt for re-prompting.
    pub fn acknowledge_error(&self, session_id: &str) -> Option<String> {
        let prompt = {
            let state = self.inner.state.lock();
            let session = state.sessions.get(session_id)?;
            session.error.as_ref()?;
            session.context.prompt.clone()
        };
        self.dismiss(session_id);
        Some(prompt)
    }

    /// Revive persisted sessions after a restart.
    ///
    /// Streaming sessions and recently errored ones are resumed through the
    /// provider; everything else is discarded. Returns the resumed ids.
    pub async fn try_resume_sessions(&self) -> Vec<SessionId> {
        let persisted = match self.inner.store.load() {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!("Failed to load persisted sessions: {e}");
                return Vec::new();
            }
        };

        let window_millis =
            i64::try_from(self.inner.config.error_resume_window_secs.saturating_mul(1000))
                .unwrap_or(i64::MAX);
        let resumable: HashMap<SessionId, AgentSession> = persisted
            .into_iter()
            .filter(|(_, s)| s.is_streaming || (s.error.is_some() && s.age_millis() < window_millis))
            .collect();

        let provider = self.provider();
        let provider = match provider {
            Some(p) if p.supports_resume() && !resumable.is_empty() => p,
            _ => {
                if let Err(e) = self.inner.store.clear() {
                    tracing::warn!("Failed to wipe persisted sessions: {e}");
                }
                return Vec::new();
            }
        };

        let mut resumed = Vec::with_capacity(resumable.len());
        let mut runs = Vec::with_capacity(resumable.len());
        {
            let mut state = self.inner.state.lock();
            for (id, mut session) in resumable {
                if let Some(element) = self.reacquire(&session) {
                    state.elements.insert(id.clone(), vec![element]);
                }
                let status = if session.last_status.is_empty() {
                    STATUS_RESUMING.to_string()
                } else {
                    session.last_status.clone()
                };
                session.begin_streaming(status);

                let run = self.new_run();
                runs.push((session.clone(), run.id, run.token.clone()));
                state.runs.insert(id.clone(), run);
                state.sessions.insert(id.clone(), session);
                resumed.push(id);
            }
            if let Err(e) = self.inner.store.save_all(&state.sessions) {
                tracing::warn!("Failed to persist resumed sessions: {e}");
            }
        }

        let storage = self.inner.store.storage();
        for (session, run_id, token) in runs {
            tracing::info!(session_id = %session.id, "Resuming agent session");
            let stream = provider.resume(&session.id, token.clone(), Arc::clone(&storage));
            self.spawn_run(session, run_id, token, stream);
        }
        resumed
    }

    fn reacquire(&self, session: &AgentSession) -> Option<ElementRef> {
        let tag = session.tag_name.as_deref()?;
        if is_synthetic_tag(tag) {
            return None;
        }
        let bounds = session.selection_bounds.first()?;
        let element = self.inner.page.element_at(bounds.center())?;
        element
            .tag_name()
            .eq_ignore_ascii_case(tag)
            .then_some(element)
    }

    /// Recompute bounds of every session whose elements are still attached.
    ///
    /// When the anchor (first bound) element moved, the session's position
    /// follows its horizontal center shift. A detached anchor moves nothing.
    /// Returns the number of sessions updated.
    pub fn update_bounds_on_viewport_change(&self) -> usize {
        let mut state = self.inner.state.lock();
        let State {
            sessions,
            settled,
            elements,
            ..
        } = &mut *state;

        let mut updated = 0;
        for (id, bound) in elements.iter() {
            let rects: Vec<Rect> = bound
                .iter()
                .filter(|e| e.is_connected())
                .map(|e| e.bounding_rect())
                .collect();
            if rects.is_empty() {
                continue;
            }

            let (session, active) = match sessions.get_mut(id) {
                Some(s) => (s, true),
                None => match settled.get_mut(id) {
                    Some(s) => (s, false),
                    None => continue,
                },
            };

            let anchored = bound.first().is_some_and(|e| e.is_connected());
            if let (true, Some(old), Some(new)) =
                (anchored, session.selection_bounds.first(), rects.first())
            {
                let dx = new.center().x - old.center().x;
                if dx.abs() > f64::EPSILON {
                    session.position.x += dx;
                }
            }
            session.selection_bounds = rects;
            if active {
                self.persist(session);
            }
            updated += 1;
        }
        updated
    }

    fn refresh_history(&self, provider: &dyn AgentProvider) {
        let (can_undo, can_redo) = (provider.can_undo(), provider.can_redo());
        let changed = {
            let mut state = self.inner.state.lock();
            let changed = state.can_undo != can_undo || state.can_redo != can_redo;
            state.can_undo = can_undo;
            state.can_redo = can_redo;
            changed
        };
        if changed {
            self.inner.events.on_history_change(can_undo, can_redo);
        }
    }

    fn persist(&self, session: &AgentSession) {
        if let Err(e) = self.inner.store.save(session) {
            tracing::warn!(session_id = %session.id, "Failed to persist session: {e}");
        }
    }

    /// Streaming and errored sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<AgentSession> {
        self.inner.state.lock().sessions.values().cloned().collect()
    }

    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<AgentSession> {
        self.inner.state.lock().sessions.get(session_id).cloned()
    }

    /// Completed sessions that can still be dismissed, undone or restored.
    #[must_use]
    pub fn settled_sessions(&self) -> Vec<AgentSession> {
        self.inner.state.lock().settled.values().cloned().collect()
    }

    /// Elements bound to a session.
    #[must_use]
    pub fn bound_elements(&self, session_id: &str) -> Vec<ElementRef> {
        self.inner
            .state
            .lock()
            .elements
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Provider undo availability as of the last query.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.inner.state.lock().can_undo
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.inner.state.lock().can_redo
    }

    /// Whether the configured provider is reachable.
    pub async fn check_connection(&self) -> bool {
        match self.provider() {
            Some(provider) => provider.check_connection().await,
            None => false,
        }
    }
}

fn is_synthetic_tag(tag: &str) -> bool {
    tag.ends_with(" elements")
}

fn describe_selection(elements: &[ElementRef]) -> (Option<String>, Option<String>) {
    match elements {
        [] => (None, None),
        [only] => (Some(only.tag_name()), only.component_name()),
        many => (Some(format!("{} elements", many.len())), None),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };

    use agent_relay_core::PageElement;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::storage::MemoryStorage;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Debug)]
    struct FakeElement {
        tag: String,
        rect: parking_lot::Mutex<Rect>,
        connected: AtomicBool,
    }

    impl FakeElement {
        fn new(tag: &str, rect: Rect) -> Arc<Self> {
            Arc::new(Self {
                tag: tag.to_string(),
                rect: parking_lot::Mutex::new(rect),
                connected: AtomicBool::new(true),
            })
        }

        fn detach(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn move_to(&self, rect: Rect) {
            *self.rect.lock() = rect;
        }
    }

    impl PageElement for FakeElement {
        fn tag_name(&self) -> String {
            self.tag.clone()
        }
        fn component_name(&self) -> Option<String> {
            Some("TodoItem".into())
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn bounding_rect(&self) -> Rect {
            *self.rect.lock()
        }
    }

    #[derive(Default)]
    struct FakePage {
        elements: Vec<ElementRef>,
        lookups: Arc<AtomicUsize>,
    }

    impl Page for FakePage {
        fn element_at(&self, point: Point) -> Option<ElementRef> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.elements
                .iter()
                .find(|e| {
                    let r = e.bounding_rect();
                    point.x >= r.x
                        && point.x <= r.x + r.width
                        && point.y >= r.y
                        && point.y <= r.y + r.height
                })
                .cloned()
        }
    }

    struct TagSnippets;

    #[async_trait]
    impl SnippetGenerator for TagSnippets {
        async fn generate(&self, elements: &[ElementRef]) -> Vec<String> {
            elements
                .iter()
                .map(|e| format!("<{0}>Buy milk</{0}>", e.tag_name()))
                .collect()
        }
    }

    #[derive(Clone, Debug)]
    enum Step {
        Status(&'static str),
        Fail(&'static str),
        Hang,
    }

    fn scripted(steps: Vec<Step>) -> StatusStream {
        let hang = matches!(steps.last(), Some(Step::Hang));
        let items: Vec<Result<String, AgentError>> = steps
            .into_iter()
            .filter_map(|step| match step {
                Step::Status(s) => Some(Ok(s.to_string())),
                Step::Fail(e) => Some(Err(AgentError::Failed(e.to_string()))),
                Step::Hang => None,
            })
            .collect();
        let stream = futures::stream::iter(items);
        if hang {
            stream.chain(futures::stream::pending()).boxed()
        } else {
            stream.boxed()
        }
    }

    #[derive(Default)]
    struct ScriptedProvider {
        scripts: parking_lot::Mutex<VecDeque<Vec<Step>>>,
        contexts: parking_lot::Mutex<Vec<AgentContext>>,
        resumed: parking_lot::Mutex<Vec<String>>,
        resume: bool,
        follow_up: bool,
        undos: AtomicUsize,
        redos: AtomicUsize,
        completion: Option<String>,
    }

    impl ScriptedProvider {
        fn with_scripts(scripts: Vec<Vec<Step>>) -> Self {
            Self {
                scripts: parking_lot::Mutex::new(scripts.into()),
                ..Self::default()
            }
        }

        fn next_script(&self) -> Vec<Step> {
            self.scripts.lock().pop_front().unwrap_or_default()
        }
    }

    #[async_trait]
    impl AgentProvider for ScriptedProvider {
        fn send(&self, context: AgentContext, _cancel: CancellationToken) -> StatusStream {
            self.contexts.lock().push(context);
            scripted(self.next_script())
        }

        fn supports_resume(&self) -> bool {
            self.resume
        }

        fn supports_follow_up(&self) -> bool {
            self.follow_up
        }

        fn resume(
            &self,
            session_id: &str,
            _cancel: CancellationToken,
            _storage: Arc<dyn KeyValueStorage>,
        ) -> StatusStream {
            self.resumed.lock().push(session_id.to_string());
            scripted(self.next_script())
        }

        async fn undo(&self) -> Result<(), AgentError> {
            self.undos.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn can_undo(&self) -> bool {
            self.undos.load(Ordering::SeqCst) == 0
        }

        async fn redo(&self) -> Result<(), AgentError> {
            self.redos.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn can_redo(&self) -> bool {
            self.undos.load(Ordering::SeqCst) > self.redos.load(Ordering::SeqCst)
        }

        fn completion_message(&self) -> Option<String> {
            self.completion.clone()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Status(String, String),
        Complete(String),
        Error(String, String),
        Abort(String),
        Dismiss(String, usize),
        Undo(String),
        Redo(String),
        History(bool, bool),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Event>,
        complete_error: Option<String>,
    }

    #[async_trait]
    impl SessionEvents for Recorder {
        fn on_status(&self, session: &AgentSession, status: &str) {
            let _ = self
                .tx
                .send(Event::Status(session.id.clone(), status.to_string()));
        }

        async fn on_complete(
            &self,
            session: &AgentSession,
            _elements: &[ElementRef],
        ) -> Option<String> {
            assert!(!session.is_streaming);
            let _ = self.tx.send(Event::Complete(session.id.clone()));
            self.complete_error.clone()
        }

        fn on_error(&self, session: &AgentSession, error: &str) {
            let _ = self
                .tx
                .send(Event::Error(session.id.clone(), error.to_string()));
        }

        fn on_abort(&self, session: &AgentSession) {
            let _ = self.tx.send(Event::Abort(session.id.clone()));
        }

        fn on_dismiss(&self, session: &AgentSession, elements: &[ElementRef]) {
            let _ = self
                .tx
                .send(Event::Dismiss(session.id.clone(), elements.len()));
        }

        fn on_undo(&self, session: &AgentSession, _elements: &[ElementRef]) {
            let _ = self.tx.send(Event::Undo(session.id.clone()));
        }

        fn on_redo(&self, session: &AgentSession, _elements: &[ElementRef]) {
            let _ = self.tx.send(Event::Redo(session.id.clone()));
        }

        fn on_history_change(&self, can_undo: bool, can_redo: bool) {
            let _ = self.tx.send(Event::History(can_undo, can_redo));
        }
    }

    struct Harness {
        manager: SessionManager,
        provider: Arc<ScriptedProvider>,
        storage: Arc<MemoryStorage>,
        events: mpsc::UnboundedReceiver<Event>,
    }

    fn harness_with(
        provider: ScriptedProvider,
        storage: Arc<MemoryStorage>,
        page: FakePage,
        complete_error: Option<String>,
    ) -> Harness {
        let (tx, events) = mpsc::unbounded_channel();
        let provider = Arc::new(provider);
        let manager = SessionManager::builder(storage.clone(), Arc::new(page), Arc::new(TagSnippets))
            .provider(provider.clone())
            .events(Arc::new(Recorder { tx, complete_error }))
            .build();
        Harness {
            manager,
            provider,
            storage,
            events,
        }
    }

    fn harness(scripts: Vec<Vec<Step>>) -> Harness {
        harness_with(
            ScriptedProvider::with_scripts(scripts),
            Arc::new(MemoryStorage::new()),
            FakePage::default(),
            None,
        )
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    async fn wait_for(events: &mut mpsc::UnboundedReceiver<Event>, want: &Event) {
        loop {
            if &next_event(events).await == want {
                return;
            }
        }
    }

    fn li() -> Arc<FakeElement> {
        FakeElement::new("li", Rect::new(0.0, 0.0, 100.0, 20.0))
    }

    fn request(elements: Vec<ElementRef>) -> StartRequest {
        let selection_bounds = elements.iter().map(|e| e.bounding_rect()).collect();
        StartRequest {
            elements,
            prompt: "make this bold".into(),
            position: Point::new(50.0, 10.0),
            selection_bounds,
            ..StartRequest::default()
        }
    }

    fn persisted(h: &Harness) -> HashMap<String, AgentSession> {
        SessionStore::new(h.storage.clone(), DEFAULT_STORAGE_KEY)
            .load()
            .unwrap()
    }

    #[tokio::test]
    async fn completed_session_settles_and_enables_undo() {
        let mut h = harness(vec![vec![Step::Status("Thinking…"), Step::Status("Editing…")]]);
        let id = h.manager.start(request(vec![li()])).await.unwrap();

        assert_eq!(
            next_event(&mut h.events).await,
            Event::Status(id.clone(), "Thinking…".into())
        );
        assert_eq!(
            next_event(&mut h.events).await,
            Event::Status(id.clone(), "Editing…".into())
        );
        assert_eq!(next_event(&mut h.events).await, Event::Complete(id.clone()));
        assert_eq!(next_event(&mut h.events).await, Event::History(true, false));

        assert!(h.manager.sessions().is_empty());
        let settled = h.manager.settled_sessions();
        assert_eq!(settled.len(), 1);
        assert!(!settled[0].is_streaming);
        assert_eq!(settled[0].last_status, "Editing…");
        assert!(h.manager.can_undo());
        assert!(persisted(&h).is_empty());

        let sent = h.provider.contexts.lock();
        assert_eq!(sent[0].content, vec!["<li>Buy milk</li>".to_string()]);
        assert_eq!(sent[0].session_id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn completion_message_replaces_last_status() {
        let provider = ScriptedProvider {
            completion: Some("Done!".into()),
            ..ScriptedProvider::with_scripts(vec![vec![Step::Status("Editing…")]])
        };
        let mut h = harness_with(
            provider,
            Arc::new(MemoryStorage::new()),
            FakePage::default(),
            None,
        );
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Complete(id)).await;
        assert_eq!(h.manager.settled_sessions()[0].last_status, "Done!");
    }

    #[tokio::test]
    async fn on_complete_error_keeps_session_errored() {
        let mut h = harness_with(
            ScriptedProvider::with_scripts(vec![vec![Step::Status("Editing…")]]),
            Arc::new(MemoryStorage::new()),
            FakePage::default(),
            Some("agent reported failure".into()),
        );
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Complete(id.clone())).await;
        // Let the completion finish applying.
        wait_for(&mut h.events, &Event::History(true, false)).await;

        let session = h.manager.session(&id).unwrap();
        assert!(!session.is_streaming);
        assert_eq!(session.error.as_deref(), Some("agent reported failure"));
        assert!(persisted(&h).contains_key(&id));
    }

    #[tokio::test]
    async fn stream_failure_marks_session_errored() {
        let mut h = harness(vec![vec![Step::Status("Thinking…"), Step::Fail("disk full")]]);
        let id = h.manager.start(request(vec![li()])).await.unwrap();

        wait_for(
            &mut h.events,
            &Event::Error(id.clone(), "Agent failed: disk full".into()),
        )
        .await;

        let session = h.manager.session(&id).unwrap();
        assert!(!session.is_streaming);
        assert!(session.error.is_some());
        let stored = persisted(&h);
        assert!(stored[&id].error.is_some());
        assert!(!stored[&id].is_streaming);
    }

    #[tokio::test]
    async fn abort_mid_flight_fires_only_on_abort() {
        let mut h = harness(vec![vec![Step::Status("Thinking…"), Step::Hang]]);
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Status(id.clone(), "Thinking…".into())).await;

        assert!(h.manager.abort(Some(&id)).await);
        assert_eq!(next_event(&mut h.events).await, Event::Abort(id.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.events.try_recv().is_err());
        assert!(h.manager.sessions().is_empty());
        assert!(h.manager.settled_sessions().is_empty());
        assert!(persisted(&h).is_empty());
        assert!(!h.manager.abort(Some(&id)).await);
    }

    #[tokio::test]
    async fn global_abort_clears_everything() {
        let mut h = harness(vec![
            vec![Step::Status("a"), Step::Hang],
            vec![Step::Status("b"), Step::Hang],
        ]);
        let first = h.manager.start(request(vec![li()])).await.unwrap();
        let second = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Status(first.clone(), "a".into())).await;

        h.manager.abort(None).await;

        let mut aborted = vec![];
        while aborted.len() < 2 {
            if let Event::Abort(id) = next_event(&mut h.events).await {
                aborted.push(id);
            }
        }
        aborted.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(aborted, expected);
        assert!(h.manager.sessions().is_empty());
        assert!(h.storage.is_empty());
    }

    #[tokio::test]
    async fn retry_reruns_errored_session() {
        let mut h = harness(vec![vec![Step::Fail("flaky")], vec![Step::Status("Editing…")]]);
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(
            &mut h.events,
            &Event::Error(id.clone(), "Agent failed: flaky".into()),
        )
        .await;

        assert!(h.manager.retry(&id).await);
        wait_for(&mut h.events, &Event::Complete(id.clone())).await;

        let contexts = h.provider.contexts.lock();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0], contexts[1]);
    }

    #[tokio::test]
    async fn retry_requires_errored_session() {
        let mut h = harness(vec![vec![Step::Status("Thinking…"), Step::Hang]]);
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Status(id.clone(), "Thinking…".into())).await;
        assert!(!h.manager.retry(&id).await);
        assert!(!h.manager.retry("missing").await);
    }

    #[tokio::test]
    async fn dismiss_reports_bound_elements() {
        let mut h = harness(vec![vec![Step::Fail("nope")]]);
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Error(id.clone(), "Agent failed: nope".into())).await;

        assert!(h.manager.dismiss(&id));
        assert_eq!(next_event(&mut h.events).await, Event::Dismiss(id.clone(), 1));
        assert!(h.manager.session(&id).is_none());
        assert!(h.manager.bound_elements(&id).is_empty());
        assert!(h.storage.is_empty());
        assert!(!h.manager.dismiss(&id));
    }

    #[tokio::test]
    async fn acknowledge_error_returns_prompt() {
        let mut h = harness(vec![vec![Step::Fail("nope")]]);
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Error(id.clone(), "Agent failed: nope".into())).await;

        assert_eq!(
            h.manager.acknowledge_error(&id).as_deref(),
            Some("make this bold")
        );
        assert!(h.manager.sessions().is_empty());
        assert!(h.manager.acknowledge_error(&id).is_none());
    }

    #[tokio::test]
    async fn start_without_provider_is_noop() {
        let manager = SessionManager::builder(
            Arc::new(MemoryStorage::new()),
            Arc::new(FakePage::default()),
            Arc::new(TagSnippets),
        )
        .build();
        assert!(manager.start(request(vec![li()])).await.is_none());
        assert!(manager.sessions().is_empty());
        assert!(!manager.check_connection().await);
    }

    #[tokio::test]
    async fn multiple_elements_get_synthetic_tag() {
        let h = harness(vec![vec![Step::Hang]]);
        let id = h.manager.start(request(vec![li(), li()])).await.unwrap();
        let session = h.manager.session(&id).unwrap();
        assert_eq!(session.tag_name.as_deref(), Some("2 elements"));
        assert!(session.component_name.is_none());
        assert_eq!(session.last_status, "Thinking…");
    }

    #[tokio::test]
    async fn follow_up_reuses_content() {
        let provider = ScriptedProvider {
            follow_up: true,
            ..ScriptedProvider::with_scripts(vec![vec![Step::Status("one")], vec![Step::Hang]])
        };
        let mut h = harness_with(
            provider,
            Arc::new(MemoryStorage::new()),
            FakePage::default(),
            None,
        );
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Complete(id.clone())).await;

        let again = h
            .manager
            .start(StartRequest {
                prompt: "now italic".into(),
                session_id: Some(id.clone()),
                ..StartRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(again, id);

        let session = h.manager.session(&id).unwrap();
        assert!(session.is_streaming);
        assert_eq!(session.last_status, "Thinking…");

        let contexts = h.provider.contexts.lock();
        assert_eq!(contexts[1].content, contexts[0].content);
        assert_eq!(contexts[1].prompt, "now italic");
    }

    #[tokio::test]
    async fn follow_up_while_streaming_supersedes_silently() {
        let provider = ScriptedProvider {
            follow_up: true,
            ..ScriptedProvider::with_scripts(vec![
                vec![Step::Status("one"), Step::Hang],
                vec![Step::Status("two"), Step::Hang],
            ])
        };
        let mut h = harness_with(
            provider,
            Arc::new(MemoryStorage::new()),
            FakePage::default(),
            None,
        );
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Status(id.clone(), "one".into())).await;

        let again = h
            .manager
            .start(StartRequest {
                prompt: "now italic".into(),
                session_id: Some(id.clone()),
                ..StartRequest::default()
            })
            .await;
        assert_eq!(again.as_deref(), Some(id.as_str()));
        wait_for(&mut h.events, &Event::Status(id.clone(), "two".into())).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = h.events.try_recv() {
            assert_ne!(event, Event::Abort(id.clone()));
        }
        let session = h.manager.session(&id).unwrap();
        assert!(session.is_streaming);
        assert_eq!(session.context.prompt, "now italic");
        assert_eq!(h.manager.sessions().len(), 1);
    }

    #[tokio::test]
    async fn streaming_session_survives_reload() {
        let mut first = harness(vec![vec![Step::Status("Thinking…"), Step::Hang]]);
        let id = first.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut first.events, &Event::Status(id.clone(), "Thinking…".into())).await;

        let provider = ScriptedProvider {
            resume: true,
            ..ScriptedProvider::with_scripts(vec![vec![Step::Hang]])
        };
        let second = harness_with(provider, first.storage.clone(), FakePage::default(), None);
        assert_eq!(second.manager.try_resume_sessions().await, vec![id.clone()]);

        let session = second.manager.session(&id).unwrap();
        assert!(session.is_streaming);
        assert_eq!(session.context.prompt, "make this bold");
        assert_eq!(session.last_status, "Thinking…");
        assert_eq!(*second.provider.resumed.lock(), vec![id]);
    }

    #[tokio::test]
    async fn resume_restores_streaming_and_recent_errors() {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(storage.clone(), DEFAULT_STORAGE_KEY);
        let ctx = AgentContext::new(vec!["<p/>".into()], "p");

        let streaming = AgentSession::new("streaming", ctx.clone(), Point::default(), vec![]);
        let mut recent = AgentSession::new("recent", ctx.clone(), Point::default(), vec![]);
        recent.fail("boom");
        let mut stale = AgentSession::new("stale", ctx.clone(), Point::default(), vec![]);
        stale.fail("boom");
        stale.last_updated_at -= 60 * 60 * 1000;
        let mut idle = AgentSession::new("idle", ctx, Point::default(), vec![]);
        idle.complete();
        for s in [&streaming, &recent, &stale, &idle] {
            store.save(s).unwrap();
        }

        let provider = ScriptedProvider {
            resume: true,
            ..ScriptedProvider::with_scripts(vec![vec![Step::Hang], vec![Step::Hang]])
        };
        let h = harness_with(provider, storage, FakePage::default(), None);

        let mut resumed = h.manager.try_resume_sessions().await;
        resumed.sort();
        assert_eq!(resumed, vec!["recent".to_string(), "streaming".to_string()]);

        for id in &resumed {
            let s = h.manager.session(id).unwrap();
            assert!(s.is_streaming);
            assert!(s.error.is_none());
        }
        assert_eq!(h.manager.session("recent").unwrap().last_status, "Resuming…");
        let stored = persisted(&h);
        assert_eq!(stored.len(), 2);
        assert!(!stored.contains_key("stale"));
        assert!(!stored.contains_key("idle"));

        let mut called = h.provider.resumed.lock().clone();
        called.sort();
        assert_eq!(called, resumed);
    }

    #[tokio::test]
    async fn resume_without_support_wipes_state() {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(storage.clone(), DEFAULT_STORAGE_KEY);
        store
            .save(&AgentSession::new(
                "streaming",
                AgentContext::new(vec![], "p"),
                Point::default(),
                vec![],
            ))
            .unwrap();

        let h = harness_with(ScriptedProvider::default(), storage, FakePage::default(), None);
        assert!(h.manager.try_resume_sessions().await.is_empty());
        assert!(h.storage.is_empty());
        assert!(h.manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn resume_reacquires_element_under_first_bound() {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(storage.clone(), DEFAULT_STORAGE_KEY);
        let rect = Rect::new(10.0, 10.0, 80.0, 20.0);
        let mut session = AgentSession::new(
            "s",
            AgentContext::new(vec![], "p"),
            Point::default(),
            vec![rect],
        );
        session.tag_name = Some("li".into());
        session.last_status = String::new();
        store.save(&session).unwrap();

        let element: ElementRef = FakeElement::new("LI", rect);
        let page = FakePage {
            elements: vec![element],
            ..FakePage::default()
        };
        let provider = ScriptedProvider {
            resume: true,
            ..ScriptedProvider::with_scripts(vec![vec![Step::Hang]])
        };
        let h = harness_with(provider, storage, page, None);

        assert_eq!(h.manager.try_resume_sessions().await, vec!["s".to_string()]);
        assert_eq!(h.manager.bound_elements("s").len(), 1);
        assert_eq!(h.manager.session("s").unwrap().last_status, "Resuming…");
    }

    #[tokio::test]
    async fn resume_never_reacquires_multi_element_sessions() {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(storage.clone(), DEFAULT_STORAGE_KEY);
        let rect = Rect::new(10.0, 10.0, 80.0, 20.0);
        let mut session = AgentSession::new(
            "s",
            AgentContext::new(vec![], "p"),
            Point::default(),
            vec![rect],
        );
        session.tag_name = Some("2 elements".into());
        store.save(&session).unwrap();

        let lookups = Arc::new(AtomicUsize::new(0));
        let page = FakePage {
            elements: vec![FakeElement::new("li", rect)],
            lookups: lookups.clone(),
        };
        let provider = ScriptedProvider {
            resume: true,
            ..ScriptedProvider::with_scripts(vec![vec![Step::Hang]])
        };
        let h = harness_with(provider, storage, page, None);

        assert_eq!(h.manager.try_resume_sessions().await, vec!["s".to_string()]);
        assert_eq!(lookups.load(Ordering::SeqCst), 0);
        assert!(h.manager.bound_elements("s").is_empty());
        assert!(h.manager.session("s").unwrap().is_streaming);
    }

    #[tokio::test]
    async fn undo_refuses_streaming_session() {
        let mut h = harness(vec![vec![Step::Status("Thinking…"), Step::Hang]]);
        let id = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Status(id.clone(), "Thinking…".into())).await;

        assert!(!h.manager.undo(&id).await);
        assert_eq!(h.provider.undos.load(Ordering::SeqCst), 0);
        assert!(h.manager.session(&id).unwrap().is_streaming);
        assert!(h.manager.history_redo().await.is_none());
    }

    #[tokio::test]
    async fn redo_skips_sessions_whose_elements_left_the_page() {
        let mut h = harness(vec![vec![Step::Status("Editing…")]]);
        let element = li();
        let id = h.manager.start(request(vec![element.clone()])).await.unwrap();
        wait_for(&mut h.events, &Event::Complete(id.clone())).await;
        wait_for(&mut h.events, &Event::History(true, false)).await;

        assert!(h.manager.undo(&id).await);
        assert_eq!(next_event(&mut h.events).await, Event::Undo(id.clone()));
        element.detach();

        assert!(h.manager.history_redo().await.is_none());
        assert_eq!(h.provider.redos.load(Ordering::SeqCst), 1);
        assert!(h.manager.settled_sessions().is_empty());
        assert!(h.manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn redo_restores_attached_session() {
        let mut h = harness(vec![vec![Step::Status("Editing…")]]);
        let element = li();
        let id = h.manager.start(request(vec![element.clone()])).await.unwrap();
        wait_for(&mut h.events, &Event::Complete(id.clone())).await;

        assert!(h.manager.undo(&id).await);
        wait_for(&mut h.events, &Event::Dismiss(id.clone(), 1)).await;
        assert!(h.manager.settled_sessions().is_empty());
        assert!(h.manager.can_redo());

        element.move_to(Rect::new(0.0, 100.0, 100.0, 20.0));
        assert_eq!(h.manager.history_redo().await.as_deref(), Some(id.as_str()));
        wait_for(&mut h.events, &Event::Redo(id.clone())).await;

        let restored = h.manager.settled_sessions();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].selection_bounds[0].y, 100.0);
        assert_eq!(h.provider.undos.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn global_undo_delegates_to_provider() {
        let h = harness(vec![]);
        h.manager.history_undo().await;
        assert_eq!(h.provider.undos.load(Ordering::SeqCst), 1);
        assert!(h.manager.can_redo());
    }

    #[tokio::test]
    async fn viewport_change_follows_anchor() {
        let mut h = harness(vec![vec![Step::Status("Thinking…"), Step::Hang]]);
        let element = li();
        let id = h.manager.start(request(vec![element.clone()])).await.unwrap();
        wait_for(&mut h.events, &Event::Status(id.clone(), "Thinking…".into())).await;

        element.move_to(Rect::new(30.0, 40.0, 100.0, 20.0));
        assert_eq!(h.manager.update_bounds_on_viewport_change(), 1);

        let session = h.manager.session(&id).unwrap();
        assert_eq!(session.position, Point::new(80.0, 10.0));
        assert_eq!(session.selection_bounds[0], Rect::new(30.0, 40.0, 100.0, 20.0));
        assert_eq!(persisted(&h)[&id].selection_bounds[0].x, 30.0);
    }

    #[tokio::test]
    async fn viewport_change_ignores_detached_elements() {
        let mut h = harness(vec![vec![Step::Status("Thinking…"), Step::Hang]]);
        let element = li();
        let id = h.manager.start(request(vec![element.clone()])).await.unwrap();
        wait_for(&mut h.events, &Event::Status(id.clone(), "Thinking…".into())).await;

        element.detach();
        assert_eq!(h.manager.update_bounds_on_viewport_change(), 0);
        assert_eq!(h.manager.session(&id).unwrap().position, Point::new(50.0, 10.0));
    }

    #[tokio::test]
    async fn viewport_change_with_detached_anchor_keeps_position() {
        let mut h = harness(vec![vec![Step::Status("Thinking…"), Step::Hang]]);
        let anchor = li();
        let other = FakeElement::new("li", Rect::new(0.0, 30.0, 100.0, 20.0));
        let id = h
            .manager
            .start(request(vec![anchor.clone(), other.clone()]))
            .await
            .unwrap();
        wait_for(&mut h.events, &Event::Status(id.clone(), "Thinking…".into())).await;

        anchor.detach();
        other.move_to(Rect::new(200.0, 30.0, 100.0, 20.0));
        assert_eq!(h.manager.update_bounds_on_viewport_change(), 1);

        let session = h.manager.session(&id).unwrap();
        assert_eq!(session.position, Point::new(50.0, 10.0));
        assert_eq!(session.selection_bounds, vec![Rect::new(200.0, 30.0, 100.0, 20.0)]);
    }

    #[tokio::test]
    async fn streaming_and_error_never_coexist() {
        let mut h = harness(vec![
            vec![Step::Status("a"), Step::Fail("x")],
            vec![Step::Status("b"), Step::Hang],
        ]);
        let failed = h.manager.start(request(vec![li()])).await.unwrap();
        let running = h.manager.start(request(vec![li()])).await.unwrap();
        wait_for(&mut h.events, &Event::Error(failed, "Agent failed: x".into())).await;
        wait_for(&mut h.events, &Event::Status(running, "b".into())).await;

        for session in h.manager.sessions() {
            assert!(!(session.is_streaming && session.error.is_some()));
        }
        for session in persisted(&h).values() {
            assert!(!(session.is_streaming && session.error.is_some()));
        }
    }
}
