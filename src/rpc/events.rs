//! Event types emitted by the agent in RPC mode.
//!
//! Each stdout line is one JSON object tagged by `type`. Known types decode
//! into [`AgentEvent`] variants and are validated; any other type is kept as
//! raw JSON so handlers can still subscribe to it by name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rpc::MalformedEvent;

/// Sub-events carried by `message_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantMessageEvent {
    /// Visible text fragment.
    TextDelta {
        /// The text fragment.
        delta: String,
    },
    /// Reasoning fragment.
    ThinkingDelta {
        /// The reasoning fragment.
        delta: String,
    },
    /// Catch-all for other sub-events.
    #[serde(other)]
    Unknown,
}

/// Why the agent stopped producing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// The message ends in one or more tool calls.
    ToolUse,
    /// The agent finished its answer.
    Stop,
    /// Output was truncated.
    Length,
    /// The run failed.
    Error,
    /// The run was aborted.
    Aborted,
    /// Catch-all for other reasons.
    #[serde(other)]
    Other,
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// The agent.
    Assistant,
    /// The human.
    User,
    /// Output of a tool call.
    ToolResult,
    /// Catch-all for other roles.
    #[serde(other)]
    Other,
}

/// One part of a message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text.
        #[serde(default)]
        text: String,
    },
    /// A tool invocation.
    ToolCall {
        /// Tool call id.
        #[serde(default)]
        id: String,
        /// Tool name.
        #[serde(default)]
        name: String,
        /// Tool arguments.
        #[serde(default)]
        arguments: Value,
    },
    /// Agent reasoning.
    Thinking {
        /// The reasoning text.
        #[serde(default)]
        thinking: String,
    },
    /// Catch-all for images and other parts.
    #[serde(other)]
    Unknown,
}

/// Message content is either a bare string or a list of parts.
#[derive(Deserialize)]
#[serde(untagged)]
enum ContentRepr {
    Text(String),
    Parts(Vec<ContentPart>),
}

fn deserialize_content<'de, D>(deserializer: D) -> Result<Vec<ContentPart>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<ContentRepr>::deserialize(deserializer)? {
        Some(ContentRepr::Text(text)) => vec![ContentPart::Text { text }],
        Some(ContentRepr::Parts(parts)) => parts,
        None => Vec::new(),
    })
}

/// A conversation message as reported in `agent_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    /// Author role.
    pub role: Role,
    /// Ordered content parts.
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: Vec<ContentPart>,
    /// Why the message ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Tool name, for tool results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl AgentMessage {
    /// Text parts of this message, in order.
    pub fn text_parts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Method of an extension UI request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiMethod {
    /// Pick one of several options.
    Select,
    /// Yes/no confirmation.
    Confirm,
    /// Single-line text input.
    Input,
    /// Multi-line text editor.
    Editor,
    /// Catch-all for other methods.
    #[serde(other)]
    Other,
}

/// An `extension_ui_request` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiRequest {
    /// Request id; the answer must carry the same id.
    pub id: String,
    /// Kind of dialog requested.
    pub method: UiMethod,
    /// Dialog title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Dialog body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Options for `select`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,
    /// Placeholder for `input`/`editor`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

/// Reply to a query or control command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Wire type of the command being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Whether the command succeeded.
    #[serde(default = "default_success")]
    pub success: bool,
    /// Command-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Correlation id echoed from the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Events emitted by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A run started.
    AgentStart,
    /// Streaming update of the assistant message.
    #[serde(rename_all = "camelCase")]
    MessageUpdate {
        /// The sub-event.
        assistant_message_event: AssistantMessageEvent,
    },
    /// The run finished. Terminal.
    #[serde(rename_all = "camelCase")]
    AgentEnd {
        /// Why the run stopped.
        #[serde(default)]
        stop_reason: Option<StopReason>,
        /// All messages of the run.
        #[serde(default)]
        messages: Vec<AgentMessage>,
    },
    /// The run failed. Terminal.
    Error {
        /// Error description.
        error: Value,
    },
    /// The agent asks the front-end for input.
    ExtensionUiRequest(UiRequest),
    /// Reply to a query or control command.
    Response(CommandResponse),
    /// Any other event type.
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Returns true if this event ends a prompt turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentEnd { .. } | Self::Error { .. })
    }

    /// Returns the fragment if this is a `text_delta` update.
    #[must_use]
    pub fn text_delta(&self) -> Option<&str> {
        match self {
            Self::MessageUpdate {
                assistant_message_event: AssistantMessageEvent::TextDelta { delta },
            } => Some(delta),
            _ => None,
        }
    }

    /// Returns the error text if this is an `error` event.
    #[must_use]
    pub fn error_text(&self) -> Option<String> {
        match self {
            Self::Error { error } => Some(match error {
                Value::String(s) => s.clone(),
                Value::Object(map) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| error.to_string(), str::to_string),
                other => other.to_string(),
            }),
            _ => None,
        }
    }
}

/// A decoded stdout line: the type name, the typed event and the raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcEvent {
    kind: String,
    event: AgentEvent,
    raw: Value,
}

impl RpcEvent {
    /// Decode one line of agent output.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` if the line is not a JSON object with a
    /// string `type`, or if a known type is missing required fields.
    pub fn parse(line: &str) -> Result<Self, MalformedEvent> {
        let raw: Value = serde_json::from_str(line).map_err(MalformedEvent::InvalidJson)?;
        Self::from_value(raw)
    }

    /// Decode an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// See [`RpcEvent::parse`].
    pub fn from_value(raw: Value) -> Result<Self, MalformedEvent> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MalformedEvent::MissingType)?
            .to_string();

        let event = AgentEvent::deserialize(&raw).map_err(|source| MalformedEvent::InvalidShape {
            kind: kind.clone(),
            source,
        })?;

        Ok(Self { kind, event, raw })
    }

    /// The event's `type` name as it appeared on the wire.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The typed event.
    #[must_use]
    pub fn event(&self) -> &AgentEvent {
        &self.event
    }

    /// The raw JSON object.
    #[must_use]
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Returns true if this event ends a prompt turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.event.is_terminal()
    }
}
