//! Echo handler for trying the relay without a real agent.

use std::time::Duration;

use agent_relay_core::{AgentContext, CancellationToken};
use agent_relay_transport::{AgentHandler, HandlerEvent, HandlerEventStream};
use async_trait::async_trait;
use futures::StreamExt;

/// Replays the request back as a few status updates.
#[derive(Debug, Clone)]
pub struct EchoHandler {
    step: Duration,
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(250),
        }
    }
}

impl EchoHandler {
    fn script(context: &AgentContext) -> Vec<HandlerEvent> {
        let elements = context.content.len();
        vec![
            HandlerEvent::Status(format!("Reading {elements} snippet(s)…")),
            HandlerEvent::Status(format!("Echo: {}", context.prompt)),
            HandlerEvent::Done,
        ]
    }
}

#[async_trait]
impl AgentHandler for EchoHandler {
    fn run(
        &self,
        session_id: &str,
        context: AgentContext,
        cancel: CancellationToken,
    ) -> HandlerEventStream {
        tracing::debug!(session_id, prompt = %context.prompt, "Echo run");
        let step = self.step;
        futures::stream::iter(Self::script(&context))
            .then(move |event| async move {
                tokio::time::sleep(step).await;
                event
            })
            .take_until(cancel.cancelled_owned())
            .boxed()
    }

    async fn abort(&self, session_id: &str) {
        tracing::debug!(session_id, "Echo run aborted");
    }
}
