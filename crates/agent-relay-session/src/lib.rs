//! Client-side session orchestration for relayed agents.
//!
//! Provides:
//! - `SessionManager` - Drive concurrent agent sessions through a provider
//! - `SessionStore` - Persist the session table across reloads
//! - Storage implementations (memory)

pub mod events;
pub mod manager;
pub mod storage;
pub mod store;

pub use events::{NoopEvents, SessionEvents};
pub use manager::{ManagerConfig, SessionManager, SessionManagerBuilder, StartRequest};
#[cfg(feature = "memory")]
pub use storage::MemoryStorage;
pub use store::{DEFAULT_STORAGE_KEY, SessionStore};
