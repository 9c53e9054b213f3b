//! Core abstractions for relayed agent sessions.
//!
//! This crate provides the vocabulary shared by every party:
//! - `AgentContext` - Input to one agent invocation
//! - `AgentSession` - Session state and geometry
//! - `PageElement`/`Page` - Page capabilities used for reacquisition
//! - `AgentProvider` and `KeyValueStorage` traits

pub mod context;
pub mod page;
pub mod session;
pub mod traits;

pub use context::AgentContext;
pub use page::{ElementRef, Page, PageElement, SnippetGenerator};
pub use session::{AgentSession, Point, Rect, SessionId, SessionPhase, now_millis};
pub use traits::{AgentError, AgentProvider, KeyValueStorage, StatusStream, StorageError};
pub use tokio_util::sync::CancellationToken;
