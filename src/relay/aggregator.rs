//! Drive a single prompt to its terminal event.
//!
//! A prompt never waits past its timeout. When the deadline passes or the
//! prompt is cancelled, `abort` is sent and the call returns at once; the
//! aborted run's remaining events are drained before the client's next
//! prompt or query.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::relay::reduce::reduce_messages;
use crate::relay::ui::{answer_ui_request, CancelPrompter, UiPrompter};
use crate::rpc::{AgentEvent, AgentEvents, RpcClient, RpcCommand, RpcError};

/// Default time to wait for a terminal event.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time to drain an aborted run before the next prompt.
pub const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(5);

/// Result of one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The run finished; reduced reply text.
    Completed(String),
    /// The agent reported an error.
    AgentError(String),
    /// No terminal event arrived in time.
    TimedOut,
    /// The caller cancelled the prompt.
    Cancelled,
    /// The agent's output closed before a terminal event.
    ProcessExited,
}

impl PromptOutcome {
    /// Whether the run finished normally.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Text shown to the user.
    #[must_use]
    pub fn into_display_text(self) -> String {
        match self {
            Self::Completed(text) => text,
            Self::AgentError(text) => format!("Error: {text}"),
            Self::TimedOut => "Error: Response timed out.".to_string(),
            Self::Cancelled => "Error: Request cancelled.".to_string(),
            Self::ProcessExited => "Error: Agent process exited.".to_string(),
        }
    }
}

/// Sends a prompt and consumes events until the run ends.
#[derive(Clone)]
pub struct ResponseAggregator {
    timeout: Duration,
    abort_grace: Duration,
    cancel: Option<CancellationToken>,
    prompter: Arc<dyn UiPrompter>,
}

impl std::fmt::Debug for ResponseAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseAggregator")
            .field("timeout", &self.timeout)
            .field("abort_grace", &self.abort_grace)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl Default for ResponseAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAggregator {
    /// Create an aggregator with default timeouts that cancels UI requests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_PROMPT_TIMEOUT,
            abort_grace: DEFAULT_ABORT_GRACE,
            cancel: None,
            prompter: Arc::new(CancelPrompter),
        }
    }

    /// Set the deadline for a terminal event.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set how long to drain an aborted run before sending the next prompt.
    #[must_use]
    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    /// Set a cancellation token for the prompt.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Set the prompter that answers UI requests during the run.
    #[must_use]
    pub fn with_prompter(mut self, prompter: Arc<dyn UiPrompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// The configured deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `message` as a prompt and wait for the run to end.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt cannot be sent. Agent errors, timeouts
    /// and cancellation are reported as [`PromptOutcome`] values.
    pub async fn send_prompt_and_await_response(
        &self,
        client: &RpcClient,
        message: &str,
    ) -> Result<PromptOutcome, RpcError> {
        self.run(client, RpcCommand::prompt(message)).await
    }

    /// Send a prompt-family command and wait for the run to end.
    ///
    /// A fresh correlation id is attached to `prompt` commands. The client's
    /// event sequence is held for the whole run. The timeout covers draining
    /// a previously aborted run, which takes at most the abort grace.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidCommand` if the command is invalid,
    /// `RpcError::Desynchronized` if an aborted run could not be drained, or
    /// an I/O error if the command cannot be sent.
    pub async fn run(
        &self,
        client: &RpcClient,
        command: RpcCommand,
    ) -> Result<PromptOutcome, RpcError> {
        let request_id = Uuid::new_v4().to_string();
        let command = command.with_id(&request_id);
        command.validate()?;

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut events = client.events().await;
        let settle_by = deadline.min(Instant::now() + self.abort_grace);
        if !client.settle_events(&mut events, settle_by).await {
            return Err(RpcError::Desynchronized);
        }
        client.send(&command).await?;

        let cancel = self.cancel.clone().unwrap_or_default();
        let outcome = tokio::select! {
            result = tokio::time::timeout_at(deadline, self.consume(client, &mut events)) => {
                result.unwrap_or(PromptOutcome::TimedOut)
            }
            () = cancel.cancelled() => PromptOutcome::Cancelled,
        };

        if matches!(outcome, PromptOutcome::TimedOut | PromptOutcome::Cancelled) {
            tracing::warn!(
                request_id = %request_id,
                outcome = ?outcome,
                elapsed_ms = started.elapsed().as_millis(),
                "Prompt interrupted, aborting run"
            );
            Self::abort(client).await;
        } else {
            tracing::debug!(
                request_id = %request_id,
                elapsed_ms = started.elapsed().as_millis(),
                completed = outcome.is_completed(),
                "Prompt finished"
            );
        }

        Ok(outcome)
    }

    async fn consume(&self, client: &RpcClient, events: &mut AgentEvents) -> PromptOutcome {
        while let Some(event) = events.next_event().await {
            match event.event() {
                AgentEvent::AgentEnd {
                    stop_reason,
                    messages,
                } => {
                    tracing::debug!(stop_reason = ?stop_reason, messages = messages.len(), "Run ended");
                    return PromptOutcome::Completed(reduce_messages(messages));
                }
                AgentEvent::Error { .. } => {
                    let text = event.event().error_text().unwrap_or_default();
                    tracing::warn!(error = %text, "Agent reported an error");
                    return PromptOutcome::AgentError(text);
                }
                AgentEvent::ExtensionUiRequest(request) => {
                    if let Err(e) = answer_ui_request(client, request, &*self.prompter).await {
                        tracing::warn!(id = %request.id, error = %e, "Failed to answer UI request");
                    }
                }
                AgentEvent::Response(response)
                    if !response.success && response.command.as_deref() == Some("prompt") =>
                {
                    let text = response
                        .error
                        .clone()
                        .unwrap_or_else(|| "prompt rejected".to_string());
                    tracing::warn!(error = %text, "Agent rejected prompt");
                    return PromptOutcome::AgentError(text);
                }
                _ => {}
            }
        }
        PromptOutcome::ProcessExited
    }

    /// Abort the run and leave its terminal event for the next caller.
    async fn abort(client: &RpcClient) {
        match client.send(&RpcCommand::Abort).await {
            Ok(()) => client.mark_pending_drain(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to send abort, marking client desynchronized");
                client.mark_desynced();
            }
        }
    }
}
