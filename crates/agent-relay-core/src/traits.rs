//! Core traits for storage and agent providers.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::AgentContext;

/// Agent failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// The run was cancelled; not a failure from the user's point of view.
    #[error("Agent run cancelled")]
    Cancelled,
    #[error("Relay connection lost")]
    ConnectionLost,
    #[error("No handler registered for agent: {0}")]
    NoHandler(String),
    #[error("{0}")]
    Handler(String),
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("Agent failed: {0}")]
    Failed(String),
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Internal(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Synchronous key-value storage capability.
///
/// Writes are synchronous so a reload always observes the last write.
pub trait KeyValueStorage: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    /// Returns error if the backend cannot be read.
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value.
    ///
    /// # Errors
    /// Returns error if the backend rejects the write.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a value. Deleting a missing key is not an error.
    ///
    /// # Errors
    /// Returns error if the backend cannot be written.
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// Pull-stream of status strings produced by one agent run.
///
/// The stream ends on success, yields `Err` on failure.
pub type StatusStream = BoxStream<'static, Result<String, AgentError>>;

/// An agent implementation the session manager can drive.
///
/// Only [`send`](Self::send) is required. Optional capabilities are queried
/// with the `supports_*`/`can_*` methods before use.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Start a run and return its status stream. Nothing happens until the
    /// stream is polled.
    fn send(&self, context: AgentContext, cancel: CancellationToken) -> StatusStream;

    /// Whether [`resume`](Self::resume) may be called.
    fn supports_resume(&self) -> bool {
        false
    }

    /// Whether a finished session may be continued with a new prompt.
    fn supports_follow_up(&self) -> bool {
        false
    }

    /// Reattach to a session persisted before a restart.
    fn resume(
        &self,
        session_id: &str,
        cancel: CancellationToken,
        storage: Arc<dyn KeyValueStorage>,
    ) -> StatusStream {
        let _ = (session_id, cancel, storage);
        futures::stream::once(async { Err(AgentError::Unsupported("resume")) }).boxed()
    }

    /// Best-effort abort of a run.
    async fn abort(&self, _session_id: &str) {}

    /// Revert the last applied change.
    ///
    /// # Errors
    /// Returns error if the provider cannot undo.
    async fn undo(&self) -> Result<(), AgentError> {
        Ok(())
    }

    fn can_undo(&self) -> bool {
        false
    }

    /// Reapply the last reverted change.
    ///
    /// # Errors
    /// Returns error if the provider cannot redo.
    async fn redo(&self) -> Result<(), AgentError> {
        Ok(())
    }

    fn can_redo(&self) -> bool {
        false
    }

    /// Whether the agent is reachable right now.
    async fn check_connection(&self) -> bool {
        true
    }

    /// Message to show instead of the last status once a run completes.
    fn completion_message(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    #[async_trait]
    impl AgentProvider for Minimal {
        fn send(&self, context: AgentContext, _cancel: CancellationToken) -> StatusStream {
            futures::stream::iter(vec![Ok(context.prompt)]).boxed()
        }
    }

    struct NullStorage;

    impl KeyValueStorage for NullStorage {
        fn get_item(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Ok(None)
        }
        fn set_item(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Ok(())
        }
        fn remove_item(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn optional_capabilities_default_off() {
        let p = Minimal;
        assert!(!p.supports_resume());
        assert!(!p.supports_follow_up());
        assert!(!p.can_undo());
        assert!(!p.can_redo());
        assert!(p.check_connection().await);
        assert!(p.completion_message().is_none());
    }

    #[tokio::test]
    async fn default_resume_reports_unsupported() {
        let p = Minimal;
        let mut stream = p.resume("s", CancellationToken::new(), Arc::new(NullStorage));
        assert_eq!(
            stream.next().await,
            Some(Err(AgentError::Unsupported("resume")))
        );
    }

    #[tokio::test]
    async fn send_yields_statuses() {
        let p = Minimal;
        let mut stream = p.send(AgentContext::new(vec![], "hello"), CancellationToken::new());
        assert_eq!(stream.next().await, Some(Ok("hello".to_string())));
        assert!(stream.next().await.is_none());
    }
}
