//! Agent session state and geometry.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::AgentContext;

/// Session identifier.
pub type SessionId = String;

/// A point in page coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in page coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Center of the rectangle.
    #[must_use]
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Lifecycle phase derived from a session's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// The agent is still producing output.
    Streaming,
    /// The stream failed; the session is kept for retry or acknowledge.
    Errored,
    /// The stream finished successfully.
    Completed,
}

/// One agent invocation and its UI-facing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    /// Globally unique session id.
    pub id: SessionId,
    /// Input the agent was invoked with.
    pub context: AgentContext,
    /// Latest human-readable progress string.
    pub last_status: String,
    pub is_streaming: bool,
    /// Creation time (Unix epoch milliseconds).
    pub created_at: i64,
    /// Last mutation time (Unix epoch milliseconds).
    pub last_updated_at: i64,
    /// UI anchor point.
    pub position: Point,
    /// One rectangle per bound element, used for reacquisition.
    #[serde(default)]
    pub selection_bounds: Vec<Rect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
    /// Terminal failure message. Never set while streaming.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentSession {
    /// Create a streaming session.
    #[must_use]
    pub fn new(
        id: impl Into<SessionId>,
        context: AgentContext,
        position: Point,
        selection_bounds: Vec<Rect>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            context,
            last_status: String::new(),
            is_streaming: true,
            created_at: now,
            last_updated_at: now,
            position,
            selection_bounds,
            tag_name: None,
            component_name: None,
            error: None,
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        if self.is_streaming {
            SessionPhase::Streaming
        } else if self.error.is_some() {
            SessionPhase::Errored
        } else {
            SessionPhase::Completed
        }
    }

    /// Enter the streaming phase with the given status.
    pub fn begin_streaming(&mut self, status: impl Into<String>) {
        self.is_streaming = true;
        self.error = None;
        self.last_status = status.into();
        self.touch();
    }

    /// Record a progress update.
    pub fn set_status(&mut self, status: impl Into<String>) {
        self.last_status = status.into();
        self.touch();
    }

    /// Enter the errored phase.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.is_streaming = false;
        self.error = Some(error.into());
        self.touch();
    }

    /// Enter the completed phase.
    pub fn complete(&mut self) {
        self.is_streaming = false;
        self.error = None;
        self.touch();
    }

    /// Milliseconds since the last mutation.
    #[must_use]
    pub fn age_millis(&self) -> i64 {
        now_millis().saturating_sub(self.last_updated_at)
    }

    fn touch(&mut self) {
        self.last_updated_at = now_millis();
    }
}

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AgentSession {
        AgentSession::new(
            "s-1",
            AgentContext::new(vec!["<p>hi</p>".into()], "shout"),
            Point::new(10.0, 20.0),
            vec![Rect::new(0.0, 0.0, 100.0, 40.0)],
        )
    }

    #[test]
    fn new_session_is_streaming() {
        let s = session();
        assert_eq!(s.phase(), SessionPhase::Streaming);
        assert!(s.error.is_none());
    }

    #[test]
    fn fail_clears_streaming() {
        let mut s = session();
        s.fail("boom");
        assert_eq!(s.phase(), SessionPhase::Errored);
        assert!(!s.is_streaming);
    }

    #[test]
    fn begin_streaming_clears_error() {
        let mut s = session();
        s.fail("boom");
        s.begin_streaming("Retrying…");
        assert_eq!(s.phase(), SessionPhase::Streaming);
        assert!(s.error.is_none());
        assert_eq!(s.last_status, "Retrying…");
    }

    #[test]
    fn complete_is_neither_streaming_nor_errored() {
        let mut s = session();
        s.complete();
        assert_eq!(s.phase(), SessionPhase::Completed);
    }

    #[test]
    fn rect_center() {
        let r = Rect::new(10.0, 10.0, 20.0, 40.0);
        assert_eq!(r.center(), Point::new(20.0, 30.0));
    }

    #[test]
    fn persisted_shape() {
        let s = session();
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["isStreaming"], true);
        assert!(json["selectionBounds"].is_array());
        assert!(json.get("error").is_none());
        let back: AgentSession = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }
}
