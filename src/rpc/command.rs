//! Commands sent to the agent over its stdin.
//!
//! Every command is one JSON object tagged by `type`, serialized on a single
//! line. Required fields are checked by [`RpcCommand::validate`] before any
//! bytes reach the process.

use std::path::Path;

use base64::Engine as _;
use serde::Serialize;

use crate::rpc::{CommandError, RpcError};

/// How a prompt sent while the agent is streaming should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamingBehavior {
    /// Interrupt the current run.
    #[serde(rename = "steer")]
    Steer,
    /// Queue until the current run finishes.
    #[serde(rename = "followUp")]
    FollowUp,
}

/// Steering mode for messages sent during an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SteeringMode {
    /// Steering messages interrupt the agent.
    Interrupt,
    /// Steering messages are queued.
    Queue,
}

/// An image attachment for prompt-family commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "image", rename_all = "camelCase")]
pub struct ImageContent {
    /// Base64-encoded image bytes.
    pub data: String,
    /// MIME type of the image.
    pub mime_type: String,
}

impl ImageContent {
    /// Encode raw image bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Load an image file, inferring its MIME type from the extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::from_bytes(&bytes, mime_type_for(path)))
    }
}

/// Infer an image MIME type from a file extension, defaulting to `image/png`.
#[must_use]
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// Commands understood by the agent in RPC mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcCommand {
    /// Send a user prompt.
    #[serde(rename_all = "camelCase")]
    Prompt {
        /// User message.
        message: String,
        /// Optional correlation id.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Image attachments.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageContent>,
        /// Behavior if the agent is already streaming.
        #[serde(skip_serializing_if = "Option::is_none")]
        streaming_behavior: Option<StreamingBehavior>,
    },
    /// Interrupt the agent mid-run with a new message.
    Steer {
        /// Steering message.
        message: String,
        /// Image attachments.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageContent>,
    },
    /// Queue a message for after the current run.
    FollowUp {
        /// Follow-up message.
        message: String,
        /// Image attachments.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageContent>,
    },
    /// Abort the current run.
    Abort,
    /// Clear all messages in the session.
    Reset,
    /// Start a fresh session.
    NewSession,
    /// Save the current session.
    SaveSession {
        /// Optional session name.
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Load a saved session.
    LoadSession {
        /// Session name.
        name: String,
    },
    /// List saved sessions.
    ListSessions,
    /// Delete a saved session.
    DeleteSession {
        /// Session name.
        name: String,
    },
    /// Switch the active model.
    #[serde(rename_all = "camelCase")]
    SetModel {
        /// Model ID.
        model_id: String,
    },
    /// Query the active model.
    GetModel,
    /// List available models.
    ListModels,
    /// Fetch the messages of the current session.
    GetMessages,
    /// Delete a message from the session.
    #[serde(rename_all = "camelCase")]
    DeleteMessage {
        /// Message ID.
        message_id: String,
    },
    /// Replace the content of a message.
    #[serde(rename_all = "camelCase")]
    EditMessage {
        /// Message ID.
        message_id: String,
        /// Replacement content.
        new_content: String,
    },
    /// Run a shell command through the agent.
    Bash {
        /// Command line.
        command: String,
        /// Working directory.
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Interrupt the running shell command.
    BashInterrupt,
    /// Set the steering mode.
    SetSteeringMode {
        /// New mode.
        mode: SteeringMode,
    },
    /// Query the steering mode.
    GetSteeringMode,
    /// Enable or disable tool-call auto approval.
    SetAutoApprove {
        /// Whether to auto-approve.
        enabled: bool,
    },
    /// Query the auto-approve setting.
    GetAutoApprove,
    /// Answer an `extension_ui_request`.
    ExtensionUiResponse {
        /// Id of the request being answered.
        id: String,
        /// Selected or entered value.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
        /// Answer to a confirmation.
        #[serde(skip_serializing_if = "Option::is_none")]
        confirmed: Option<bool>,
        /// The dialog was dismissed.
        #[serde(skip_serializing_if = "Option::is_none")]
        cancelled: Option<bool>,
    },
}

impl RpcCommand {
    /// A plain prompt.
    #[must_use]
    pub fn prompt(message: impl Into<String>) -> Self {
        Self::Prompt {
            message: message.into(),
            id: None,
            images: Vec::new(),
            streaming_behavior: None,
        }
    }

    /// A steering message.
    #[must_use]
    pub fn steer(message: impl Into<String>) -> Self {
        Self::Steer {
            message: message.into(),
            images: Vec::new(),
        }
    }

    /// A follow-up message.
    #[must_use]
    pub fn follow_up(message: impl Into<String>) -> Self {
        Self::FollowUp {
            message: message.into(),
            images: Vec::new(),
        }
    }

    /// Answer a UI request with a value (select, input, editor).
    #[must_use]
    pub fn ui_value(id: impl Into<String>, value: serde_json::Value) -> Self {
        Self::ExtensionUiResponse {
            id: id.into(),
            value: Some(value),
            confirmed: None,
            cancelled: None,
        }
    }

    /// Answer a confirmation UI request.
    #[must_use]
    pub fn ui_confirm(id: impl Into<String>, confirmed: bool) -> Self {
        Self::ExtensionUiResponse {
            id: id.into(),
            value: None,
            confirmed: Some(confirmed),
            cancelled: None,
        }
    }

    /// Dismiss a UI request.
    #[must_use]
    pub fn ui_cancel(id: impl Into<String>) -> Self {
        Self::ExtensionUiResponse {
            id: id.into(),
            value: None,
            confirmed: None,
            cancelled: Some(true),
        }
    }

    /// Attach images to a prompt, steer or follow-up. No-op for other kinds.
    #[must_use]
    pub fn with_images(mut self, attached: Vec<ImageContent>) -> Self {
        match &mut self {
            Self::Prompt { images, .. }
            | Self::Steer { images, .. }
            | Self::FollowUp { images, .. } => *images = attached,
            _ => {}
        }
        self
    }

    /// Set the correlation id of a prompt. No-op for other kinds.
    #[must_use]
    pub fn with_id(mut self, request_id: impl Into<String>) -> Self {
        if let Self::Prompt { id, .. } = &mut self {
            *id = Some(request_id.into());
        }
        self
    }

    /// Set the streaming behavior of a prompt. No-op for other kinds.
    #[must_use]
    pub fn with_streaming_behavior(mut self, behavior: StreamingBehavior) -> Self {
        if let Self::Prompt {
            streaming_behavior, ..
        } = &mut self
        {
            *streaming_behavior = Some(behavior);
        }
        self
    }

    /// The wire `type` of this command.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::Steer { .. } => "steer",
            Self::FollowUp { .. } => "follow_up",
            Self::Abort => "abort",
            Self::Reset => "reset",
            Self::NewSession => "new_session",
            Self::SaveSession { .. } => "save_session",
            Self::LoadSession { .. } => "load_session",
            Self::ListSessions => "list_sessions",
            Self::DeleteSession { .. } => "delete_session",
            Self::SetModel { .. } => "set_model",
            Self::GetModel => "get_model",
            Self::ListModels => "list_models",
            Self::GetMessages => "get_messages",
            Self::DeleteMessage { .. } => "delete_message",
            Self::EditMessage { .. } => "edit_message",
            Self::Bash { .. } => "bash",
            Self::BashInterrupt => "bash_interrupt",
            Self::SetSteeringMode { .. } => "set_steering_mode",
            Self::GetSteeringMode => "get_steering_mode",
            Self::SetAutoApprove { .. } => "set_auto_approve",
            Self::GetAutoApprove => "get_auto_approve",
            Self::ExtensionUiResponse { .. } => "extension_ui_response",
        }
    }

    /// Check that required fields are present.
    ///
    /// # Errors
    ///
    /// Returns `CommandError::MissingField` naming the first empty required field.
    pub fn validate(&self) -> Result<(), CommandError> {
        let command = self.kind();
        let require = |value: &str, field: &'static str| {
            if value.trim().is_empty() {
                Err(CommandError::MissingField { command, field })
            } else {
                Ok(())
            }
        };

        match self {
            Self::Prompt { message, .. }
            | Self::Steer { message, .. }
            | Self::FollowUp { message, .. } => require(message, "message"),
            Self::LoadSession { name } | Self::DeleteSession { name } => require(name, "name"),
            Self::SetModel { model_id } => require(model_id, "modelId"),
            Self::DeleteMessage { message_id } => require(message_id, "messageId"),
            Self::EditMessage {
                message_id,
                new_content,
            } => {
                require(message_id, "messageId")?;
                require(new_content, "newContent")
            }
            Self::Bash { command, .. } => require(command, "command"),
            Self::ExtensionUiResponse { id, .. } => require(id, "id"),
            _ => Ok(()),
        }
    }

    /// Validate and serialize to a single newline-terminated JSON line.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidCommand` if validation fails.
    pub fn encode(&self) -> Result<String, RpcError> {
        self.validate()?;
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Whether the agent answers this command with a `response` event only
    /// (as opposed to starting a run that ends in `agent_end`).
    #[must_use]
    pub fn is_query(&self) -> bool {
        !matches!(
            self,
            Self::Prompt { .. }
                | Self::Steer { .. }
                | Self::FollowUp { .. }
                | Self::ExtensionUiResponse { .. }
        )
    }
}
