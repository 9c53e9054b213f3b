//! Input context for a single agent invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable input handed to an agent for one invocation.
///
/// `content` holds the pre-generated snippets describing the selected
/// element(s); `options` is opaque provider-specific data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    /// Snippets describing the selected element(s).
    pub content: Vec<String>,

    /// The natural-language edit request.
    pub prompt: String,

    /// Provider-specific options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,

    /// Session this invocation belongs to, when already known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AgentContext {
    /// Create a context from content and a prompt.
    #[must_use]
    pub fn new(content: Vec<String>, prompt: impl Into<String>) -> Self {
        Self {
            content,
            prompt: prompt.into(),
            options: None,
            session_id: None,
        }
    }

    /// Attach provider options.
    #[must_use]
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Bind the context to a session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Get an option value by key.
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.as_ref().and_then(|o| o.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_camel_case() {
        let ctx = AgentContext::new(vec!["<li>Buy milk</li>".into()], "make this bold")
            .with_session_id("s-1");
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["content"][0], "<li>Buy milk</li>");
        assert!(json.get("options").is_none());
    }

    #[test]
    fn missing_optional_fields_deserialize() {
        let ctx: AgentContext =
            serde_json::from_str(r#"{"content":[],"prompt":"p"}"#).unwrap();
        assert!(ctx.session_id.is_none());
        assert!(ctx.options.is_none());
    }

    #[test]
    fn option_lookup() {
        let ctx = AgentContext::new(vec![], "p")
            .with_options(serde_json::json!({"model": "sonnet"}));
        assert_eq!(ctx.option("model").and_then(Value::as_str), Some("sonnet"));
        assert!(ctx.option("missing").is_none());
    }
}
