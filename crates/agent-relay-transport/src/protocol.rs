//! Wire protocol between browsers, the relay and agent handlers.
//!
//! Every frame is a JSON text message tagged by `type` (kebab-case), with
//! camelCase fields.

use agent_relay_core::AgentContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header that marks a connection as a handler connection.
pub const HANDLER_HEADER: &str = "x-relay-handler";

/// Message from a browser to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BrowserMessage {
    /// Liveness check, echoed back.
    Health,
    /// Run an agent. The relay assigns a session id when none is given.
    AgentRequest {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        context: AgentContext,
    },
    AgentAbort {
        agent_id: String,
        session_id: String,
    },
    AgentUndo {
        agent_id: String,
    },
    AgentRedo {
        agent_id: String,
    },
}

/// Message from the relay to a browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Agent ids that currently have a live handler.
    Handlers { handlers: Vec<String> },
    AgentStatus {
        agent_id: String,
        session_id: String,
        content: String,
    },
    AgentDone {
        agent_id: String,
        session_id: String,
    },
    AgentError {
        agent_id: String,
        session_id: String,
        content: String,
    },
    Health,
}

impl RelayMessage {
    /// Session this message belongs to, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::AgentStatus { session_id, .. }
            | Self::AgentDone { session_id, .. }
            | Self::AgentError { session_id, .. } => Some(session_id),
            Self::Handlers { .. } | Self::Health => None,
        }
    }

    /// Whether this message ends its session's run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentDone { .. } | Self::AgentError { .. })
    }
}

/// Message from a handler connection to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HandlerMessage {
    RegisterHandler {
        agent_id: String,
    },
    UnregisterHandler {
        agent_id: String,
    },
    AgentStatus {
        #[serde(default)]
        agent_id: String,
        session_id: String,
        content: String,
    },
    AgentDone {
        #[serde(default)]
        agent_id: String,
        session_id: String,
    },
    AgentError {
        #[serde(default)]
        agent_id: String,
        session_id: String,
        content: String,
    },
}

/// Handler routine the relay asks a handler connection to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerMethod {
    Run,
    Abort,
    Undo,
    Redo,
}

/// Message from the relay to a handler connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HandlerCommand {
    InvokeHandler {
        method: HandlerMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// The [`AgentContext`] for `run`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}
