//! Answering extension UI requests.
//!
//! Every `extension_ui_request` must receive exactly one
//! `extension_ui_response`, otherwise the agent waits forever. A
//! [`UiPrompter`] decides the answer; [`answer_ui_request`] always sends
//! one, cancelling when the prompter fails.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, Lines};
use tokio::sync::Mutex;

use crate::display;
use crate::rpc::{RpcClient, RpcCommand, RpcError, UiMethod, UiRequest};

/// Errors from answering a UI request.
#[derive(Error, Debug)]
pub enum UiError {
    /// The input source ended before an answer was read.
    #[error("UI input closed")]
    InputClosed,
    /// The answer matched no option by number or label.
    #[error("Invalid selection: {0}")]
    InvalidSelection(String),
    /// Reading the answer failed.
    #[error("UI input failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The front-end's answer to a UI request.
#[derive(Debug, Clone, PartialEq)]
pub enum UiAnswer {
    /// A selected option or entered text.
    Value(Value),
    /// A yes/no confirmation.
    Confirmed(bool),
    /// The request was dismissed.
    Cancelled,
}

impl UiAnswer {
    /// Convert into the `extension_ui_response` command for request `id`.
    #[must_use]
    pub fn into_command(self, id: &str) -> RpcCommand {
        match self {
            Self::Value(value) => RpcCommand::ui_value(id, value),
            Self::Confirmed(confirmed) => RpcCommand::ui_confirm(id, confirmed),
            Self::Cancelled => RpcCommand::ui_cancel(id),
        }
    }
}

/// Decides how to answer UI requests.
#[async_trait]
pub trait UiPrompter: Send + Sync {
    /// Produce an answer for `request`.
    async fn answer(&self, request: &UiRequest) -> Result<UiAnswer, UiError>;
}

/// Dismisses every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelPrompter;

#[async_trait]
impl UiPrompter for CancelPrompter {
    async fn answer(&self, request: &UiRequest) -> Result<UiAnswer, UiError> {
        tracing::debug!(id = %request.id, method = ?request.method, "Cancelling UI request");
        Ok(UiAnswer::Cancelled)
    }
}

/// Routes requests to a prompter registered for their method.
///
/// Methods without a registered prompter are cancelled.
#[derive(Default)]
pub struct UiRouter {
    prompters: HashMap<UiMethod, Arc<dyn UiPrompter>>,
}

impl UiRouter {
    /// Create a router with no prompters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `prompter` for `method`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, method: UiMethod, prompter: Arc<dyn UiPrompter>) -> Self {
        self.prompters.insert(method, prompter);
        self
    }

    /// Whether a prompter is registered for `method`.
    #[must_use]
    pub fn handles(&self, method: UiMethod) -> bool {
        self.prompters.contains_key(&method)
    }
}

impl std::fmt::Debug for UiRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiRouter")
            .field("methods", &self.prompters.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl UiPrompter for UiRouter {
    async fn answer(&self, request: &UiRequest) -> Result<UiAnswer, UiError> {
        match self.prompters.get(&request.method) {
            Some(prompter) => prompter.answer(request).await,
            None => CancelPrompter.answer(request).await,
        }
    }
}

/// Asks the user on the terminal, reading answers from a shared line source.
///
/// The line source is shared with the chat loop, which is idle while a
/// prompt is in flight.
pub struct TerminalPrompter<R> {
    input: Arc<Mutex<Lines<R>>>,
    raw_mode: bool,
}

impl<R> TerminalPrompter<R> {
    /// Create a prompter reading from `input`.
    pub fn new(input: Arc<Mutex<Lines<R>>>, raw_mode: bool) -> Self {
        Self { input, raw_mode }
    }
}

impl<R: AsyncBufRead + Unpin + Send> TerminalPrompter<R> {
    async fn read_line(&self) -> Result<String, UiError> {
        let mut input = self.input.lock().await;
        input
            .next_line()
            .await?
            .map(|line| line.trim_end().to_string())
            .ok_or(UiError::InputClosed)
    }

    async fn read_editor(&self) -> Result<String, UiError> {
        let mut input = self.input.lock().await;
        let mut text = Vec::new();
        while let Some(line) = input.next_line().await? {
            if line.trim_end() == "." {
                return Ok(text.join("\n"));
            }
            text.push(line);
        }
        Err(UiError::InputClosed)
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> UiPrompter for TerminalPrompter<R> {
    async fn answer(&self, request: &UiRequest) -> Result<UiAnswer, UiError> {
        display::print_ui_request(request, self.raw_mode);

        match request.method {
            UiMethod::Select => {
                display::print_ui_prompt("Choose a number (empty to cancel):");
                let line = self.read_line().await?;
                if line.is_empty() {
                    return Ok(UiAnswer::Cancelled);
                }
                parse_selection(&line, &request.options).map(UiAnswer::Value)
            }
            UiMethod::Confirm => {
                display::print_ui_prompt("Confirm? [y/n] (empty to cancel):");
                let line = self.read_line().await?;
                Ok(match line.to_ascii_lowercase().as_str() {
                    "" => UiAnswer::Cancelled,
                    "y" | "yes" => UiAnswer::Confirmed(true),
                    _ => UiAnswer::Confirmed(false),
                })
            }
            UiMethod::Input => {
                let label = request.placeholder.as_deref().unwrap_or("Answer:");
                display::print_ui_prompt(label);
                let line = self.read_line().await?;
                Ok(if line.is_empty() {
                    UiAnswer::Cancelled
                } else {
                    UiAnswer::Value(Value::String(line))
                })
            }
            UiMethod::Editor => {
                display::print_ui_prompt("Enter text, finish with a line containing only '.':");
                self.read_editor()
                    .await
                    .map(|text| UiAnswer::Value(Value::String(text)))
            }
            UiMethod::Other => Ok(UiAnswer::Cancelled),
        }
    }
}

/// Pick an option by 1-based number, or by exact label.
///
/// # Errors
///
/// Returns `UiError::InvalidSelection` if nothing matches.
pub fn parse_selection(input: &str, options: &[Value]) -> Result<Value, UiError> {
    let input = input.trim();
    if let Ok(n) = input.parse::<usize>() {
        return n
            .checked_sub(1)
            .and_then(|i| options.get(i))
            .cloned()
            .ok_or_else(|| UiError::InvalidSelection(input.to_string()));
    }
    options
        .iter()
        .find(|option| option.as_str() == Some(input))
        .cloned()
        .ok_or_else(|| UiError::InvalidSelection(input.to_string()))
}

/// Ask `prompter` and send exactly one answer for `request`.
///
/// A prompter failure is logged and answered with a cancellation.
///
/// # Errors
///
/// Returns an error only if the answer cannot be written to the agent.
pub async fn answer_ui_request(
    client: &RpcClient,
    request: &UiRequest,
    prompter: &dyn UiPrompter,
) -> Result<(), RpcError> {
    let answer = match prompter.answer(request).await {
        Ok(answer) => answer,
        Err(e) => {
            tracing::warn!(id = %request.id, method = ?request.method, error = %e, "UI prompter failed, cancelling");
            UiAnswer::Cancelled
        }
    };
    tracing::debug!(id = %request.id, answer = ?answer, "Answering UI request");
    client.send(&answer.into_command(&request.id)).await
}
