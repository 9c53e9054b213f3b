//! Agent handlers the relay dispatches runs to.

use std::collections::HashMap;

use agent_relay_core::{AgentContext, CancellationToken};
use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::protocol::{HandlerCommand, HandlerMethod};

pub(crate) const HANDLER_DISCONNECTED: &str = "Agent handler disconnected";

/// One event of a handler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    Status(String),
    Done,
    Error(String),
}

impl HandlerEvent {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

/// Events of one run. A stream that ends without a terminal event counts as done.
pub type HandlerEventStream = BoxStream<'static, HandlerEvent>;

/// An agent implementation reachable through the relay.
///
/// Handlers must watch `cancel` themselves; the relay stops forwarding output
/// as soon as it fires, but cannot stop the work.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Start a run for `session_id`.
    fn run(
        &self,
        session_id: &str,
        context: AgentContext,
        cancel: CancellationToken,
    ) -> HandlerEventStream;

    /// Best-effort abort of a run.
    async fn abort(&self, _session_id: &str) {}

    async fn undo(&self) {}

    async fn redo(&self) {}
}

/// Handler living behind a handler connection.
///
/// Calls become `invoke-handler` frames; the connection's `agent-*` frames
/// are fed back through [`dispatch`](Self::dispatch).
pub(crate) struct RemoteHandler {
    conn_id: u64,
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<HandlerEvent>>>,
}

impl RemoteHandler {
    pub(crate) fn new(conn_id: u64, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            conn_id,
            outbound,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn invoke(
        &self,
        method: HandlerMethod,
        session_id: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> bool {
        let command = HandlerCommand::InvokeHandler {
            method,
            session_id: session_id.map(str::to_string),
            payload,
        };
        match serde_json::to_string(&command) {
            Ok(json) => self.outbound.send(json).is_ok(),
            Err(e) => {
                tracing::error!("Failed to serialize handler command: {e}");
                false
            }
        }
    }

    /// Route an event reported by the handler connection to its run.
    pub(crate) fn dispatch(&self, session_id: &str, event: HandlerEvent) {
        let mut pending = self.pending.lock();
        let sender = if event.is_terminal() {
            pending.remove(session_id)
        } else {
            pending.get(session_id).cloned()
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => {
                tracing::debug!(conn_id = self.conn_id, session_id, "Event for unknown run");
            }
        }
    }

    /// Fail every in-flight run; the connection is gone.
    pub(crate) fn close(&self) {
        for (session_id, tx) in self.pending.lock().drain() {
            tracing::debug!(conn_id = self.conn_id, %session_id, "Failing run of closed handler");
            let _ = tx.send(HandlerEvent::Error(HANDLER_DISCONNECTED.to_string()));
        }
    }
}

#[async_trait]
impl AgentHandler for RemoteHandler {
    fn run(
        &self,
        session_id: &str,
        context: AgentContext,
        _cancel: CancellationToken,
    ) -> HandlerEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(session_id.to_string(), tx);

        let payload = match serde_json::to_value(&context) {
            Ok(v) => v,
            Err(e) => {
                self.pending.lock().remove(session_id);
                return futures::stream::iter([HandlerEvent::Error(e.to_string())]).boxed();
            }
        };
        if !self.invoke(HandlerMethod::Run, Some(session_id), Some(payload)) {
            self.pending.lock().remove(session_id);
            return futures::stream::iter([HandlerEvent::Error(HANDLER_DISCONNECTED.to_string())])
                .boxed();
        }
        UnboundedReceiverStream::new(rx).boxed()
    }

    async fn abort(&self, session_id: &str) {
        self.pending.lock().remove(session_id);
        self.invoke(HandlerMethod::Abort, Some(session_id), None);
    }

    async fn undo(&self) {
        self.invoke(HandlerMethod::Undo, None, None);
    }

    async fn redo(&self) {
        self.invoke(HandlerMethod::Redo, None, None);
    }
}
