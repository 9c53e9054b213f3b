//! Side-effect hooks fired by the session manager.

use agent_relay_core::{AgentSession, ElementRef};
use async_trait::async_trait;

/// Callbacks the host implements to reflect session changes in its UI.
///
/// Every method has a no-op default. The manager never holds its own lock
/// while calling these, so implementations may call back into it.
#[async_trait]
pub trait SessionEvents: Send + Sync {
    /// A status update was pulled from the session's stream.
    fn on_status(&self, _session: &AgentSession, _status: &str) {}

    /// The stream finished without error.
    ///
    /// Returning `Some(message)` turns the completion into a visible error,
    /// e.g. when the agent reported failure in its final message.
    async fn on_complete(
        &self,
        _session: &AgentSession,
        _elements: &[ElementRef],
    ) -> Option<String> {
        None
    }

    /// The stream failed. The session stays in the table for retry.
    fn on_error(&self, _session: &AgentSession, _error: &str) {}

    /// The session was cancelled and removed.
    fn on_abort(&self, _session: &AgentSession) {}

    fn on_dismiss(&self, _session: &AgentSession, _elements: &[ElementRef]) {}

    fn on_undo(&self, _session: &AgentSession, _elements: &[ElementRef]) {}

    /// A previously undone session was restored by a redo.
    fn on_redo(&self, _session: &AgentSession, _elements: &[ElementRef]) {}

    /// Provider undo/redo availability changed.
    fn on_history_change(&self, _can_undo: bool, _can_redo: bool) {}
}

/// Events sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

#[async_trait]
impl SessionEvents for NoopEvents {}
