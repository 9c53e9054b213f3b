//! Per-socket loops for browser and handler connections.

use std::sync::Arc;

use agent_relay_core::{AgentContext, CancellationToken};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt, stream::SplitStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    handler::{AgentHandler, HandlerEvent, HandlerEventStream, RemoteHandler},
    state::{Outbound, RelayState, send_frame},
};
use crate::protocol::{BrowserMessage, HandlerMessage, RelayMessage};

const HANDLER_TIMED_OUT: &str = "Agent handler timed out";
const SESSION_IN_USE: &str = "Session is in use by another connection";

/// Split the socket and spawn the task that drains the outbound queue into it.
fn split_socket(
    socket: WebSocket,
) -> (
    Outbound,
    SplitStream<WebSocket>,
    tokio::task::JoinHandle<()>,
) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    (tx, receiver, send_task)
}

/// Next text frame, or `None` when the socket closes or the relay shuts down.
async fn next_text(
    receiver: &mut SplitStream<WebSocket>,
    shutdown: &CancellationToken,
    conn_id: u64,
) -> Option<String> {
    loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => return None,
            msg = receiver.next() => msg?,
        };
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => return Some(s),
                Err(_) => {
                    tracing::warn!(conn_id, "Ignoring non-UTF-8 binary frame");
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id, "WebSocket error: {e}");
                return None;
            }
        }
    }
}

// --- browser connections ---

pub(crate) async fn handle_browser(socket: WebSocket, state: Arc<RelayState>) {
    let conn_id = state.next_conn_id();
    let (tx, mut receiver, send_task) = split_socket(socket);
    state.add_browser(conn_id, tx.clone()).await;
    tracing::info!(conn_id, "Browser connected");

    while let Some(text) = next_text(&mut receiver, &state.shutdown, conn_id).await {
        let msg: BrowserMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(conn_id, "Ignoring malformed browser frame: {e}");
                continue;
            }
        };
        handle_browser_message(&state, conn_id, &tx, msg).await;
    }

    state.remove_browser(conn_id).await;
    let orphaned = state.abort_browser_sessions(conn_id);
    if !orphaned.is_empty() {
        tracing::info!(conn_id, count = orphaned.len(), "Cancelling sessions of closed browser");
    }
    state.notify_aborted(orphaned).await;
    drop(tx);
    send_task.abort();
    tracing::info!(conn_id, "Browser disconnected");
}

async fn handle_browser_message(
    state: &Arc<RelayState>,
    conn_id: u64,
    tx: &Outbound,
    msg: BrowserMessage,
) {
    match msg {
        BrowserMessage::Health => {
            send_frame(tx, &RelayMessage::Health);
        }
        BrowserMessage::AgentRequest {
            agent_id,
            session_id,
            context,
        } => start_session(state, conn_id, tx, agent_id, session_id, context).await,
        BrowserMessage::AgentAbort {
            agent_id,
            session_id,
        } => {
            tracing::debug!(conn_id, %agent_id, %session_id, "Abort requested");
            if let Some(evicted) = state.abort_session(&session_id, conn_id) {
                state.notify_aborted(vec![evicted]).await;
            }
        }
        BrowserMessage::AgentUndo { agent_id } => match state.handler(&agent_id).await {
            Some(handler) => handler.undo().await,
            None => tracing::warn!(conn_id, %agent_id, "Undo for unregistered agent"),
        },
        BrowserMessage::AgentRedo { agent_id } => match state.handler(&agent_id).await {
            Some(handler) => handler.redo().await,
            None => tracing::warn!(conn_id, %agent_id, "Redo for unregistered agent"),
        },
    }
}

async fn start_session(
    state: &Arc<RelayState>,
    conn_id: u64,
    tx: &Outbound,
    agent_id: String,
    session_id: Option<String>,
    context: AgentContext,
) {
    let Some(handler) = state.handler(&agent_id).await else {
        tracing::warn!(conn_id, %agent_id, "No handler registered");
        send_frame(
            tx,
            &RelayMessage::AgentError {
                content: format!("No handler registered for agent: {agent_id}"),
                agent_id,
                session_id: session_id.unwrap_or_default(),
            },
        );
        return;
    };

    let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let Some((generation, token, evicted)) = state.begin_session(&session_id, &agent_id, conn_id)
    else {
        tracing::warn!(conn_id, %session_id, "Session is owned by another browser");
        send_frame(
            tx,
            &RelayMessage::AgentError {
                content: format!("{SESSION_IN_USE}: {session_id}"),
                agent_id,
                session_id,
            },
        );
        return;
    };
    if let Some(evicted) = evicted {
        tracing::info!(conn_id, %session_id, "Superseding active run");
        state.notify_aborted(vec![evicted]).await;
    }

    tracing::info!(conn_id, %agent_id, %session_id, "Starting run");
    let events = handler.run(&session_id, context, token.clone());
    let run = Run {
        state: Arc::clone(state),
        handler,
        browser: tx.clone(),
        agent_id,
        session_id,
        generation,
        token,
    };
    tokio::spawn(run.forward(events));
}

enum Next {
    Event(HandlerEvent),
    End,
    TimedOut,
}

/// One handler run forwarded to its browser.
struct Run {
    state: Arc<RelayState>,
    handler: Arc<dyn AgentHandler>,
    browser: Outbound,
    agent_id: String,
    session_id: String,
    generation: u64,
    token: CancellationToken,
}

impl Run {
    async fn next(&self, events: &mut HandlerEventStream) -> Next {
        let event = match self.state.config.handler_idle_timeout() {
            Some(limit) => match tokio::time::timeout(limit, events.next()).await {
                Ok(event) => event,
                Err(_) => return Next::TimedOut,
            },
            None => events.next().await,
        };
        event.map_or(Next::End, Next::Event)
    }

    async fn forward(self, mut events: HandlerEventStream) {
        loop {
            let next = tokio::select! {
                biased;
                () = self.token.cancelled() => {
                    tracing::debug!(session_id = %self.session_id, "Run cancelled");
                    return;
                }
                next = self.next(&mut events) => next,
            };

            match next {
                Next::Event(HandlerEvent::Status(content)) => {
                    if !self.state.is_current(&self.session_id, self.generation) {
                        return;
                    }
                    self.send(RelayMessage::AgentStatus {
                        agent_id: self.agent_id.clone(),
                        session_id: self.session_id.clone(),
                        content,
                    });
                }
                Next::Event(HandlerEvent::Done) | Next::End => {
                    if self.state.finish_session(&self.session_id, self.generation) {
                        tracing::info!(session_id = %self.session_id, "Run completed");
                        self.send(RelayMessage::AgentDone {
                            agent_id: self.agent_id.clone(),
                            session_id: self.session_id.clone(),
                        });
                    }
                    return;
                }
                Next::Event(HandlerEvent::Error(content)) => {
                    if self.state.finish_session(&self.session_id, self.generation) {
                        tracing::warn!(session_id = %self.session_id, error = %content, "Run failed");
                        self.send_error(content);
                    }
                    return;
                }
                Next::TimedOut => {
                    if self.state.finish_session(&self.session_id, self.generation) {
                        tracing::warn!(session_id = %self.session_id, "Handler went idle, failing run");
                        self.token.cancel();
                        self.handler.abort(&self.session_id).await;
                        self.send_error(HANDLER_TIMED_OUT.to_string());
                    }
                    return;
                }
            }
        }
    }

    fn send(&self, msg: RelayMessage) {
        send_frame(&self.browser, &msg);
    }

    fn send_error(&self, content: String) {
        self.send(RelayMessage::AgentError {
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            content,
        });
    }
}

// --- handler connections ---

pub(crate) async fn handle_handler(socket: WebSocket, state: Arc<RelayState>) {
    let conn_id = state.next_conn_id();
    let (tx, mut receiver, send_task) = split_socket(socket);
    let remote = Arc::new(RemoteHandler::new(conn_id, tx));
    tracing::info!(conn_id, "Handler connected");

    while let Some(text) = next_text(&mut receiver, &state.shutdown, conn_id).await {
        let msg: HandlerMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(conn_id, "Ignoring malformed handler frame: {e}");
                continue;
            }
        };
        match msg {
            HandlerMessage::RegisterHandler { agent_id } => {
                let handler: Arc<dyn AgentHandler> = remote.clone();
                state.register(&agent_id, handler, Some(conn_id)).await;
            }
            HandlerMessage::UnregisterHandler { agent_id } => {
                state.unregister(&agent_id, Some(conn_id)).await;
            }
            HandlerMessage::AgentStatus {
                session_id,
                content,
                ..
            } => remote.dispatch(&session_id, HandlerEvent::Status(content)),
            HandlerMessage::AgentDone { session_id, .. } => {
                remote.dispatch(&session_id, HandlerEvent::Done);
            }
            HandlerMessage::AgentError {
                session_id,
                content,
                ..
            } => remote.dispatch(&session_id, HandlerEvent::Error(content)),
        }
    }

    state.unregister_connection(conn_id).await;
    remote.close();
    send_task.abort();
    tracing::info!(conn_id, "Handler disconnected");
}
