//! RPC error types.

/// Error type for spawning the agent process.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The agent binary was not found.
    #[error("Agent binary not found: {0}")]
    NotFound(String),
    /// Permission denied when spawning.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// A standard stream was not piped.
    #[error("Agent {0} not available")]
    MissingPipe(&'static str),
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    pub(crate) fn from_io(binary: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(binary.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(binary.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// A command request is missing a required field.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// A required field was empty or absent.
    #[error("`{command}` requires a non-empty `{field}`")]
    MissingField {
        /// Wire name of the command.
        command: &'static str,
        /// Wire name of the field.
        field: &'static str,
    },
}

/// Errors surfaced by the RPC client.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    /// The agent process could not be launched.
    #[error("Failed to start agent process: {0}")]
    ProcessStart(#[from] SpawnError),
    /// Write attempted after the process exited or stdin was closed.
    #[error("Agent input stream closed")]
    StreamClosed,
    /// The command failed validation before any I/O.
    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] CommandError),
    /// The output stream was already handed to another reader.
    #[error("Agent output stream already taken")]
    OutputTaken,
    /// An abandoned run's events could not be drained, so responses can no
    /// longer be matched to requests.
    #[error("Agent event stream is out of step, restart the client")]
    Desynchronized,
    /// Failed to serialize a command.
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Map a write error on the agent's stdin, treating pipe closure as `StreamClosed`.
    pub(crate) fn from_write(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => Self::StreamClosed,
            _ => Self::Io(err),
        }
    }
}

/// A line from the agent could not be decoded into an event.
#[derive(thiserror::Error, Debug)]
pub enum MalformedEvent {
    /// The line is not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    /// The JSON object has no string `type` field.
    #[error("Event has no `type` field")]
    MissingType,
    /// The `type` is known but the payload does not match its shape.
    #[error("Malformed `{kind}` event: {source}")]
    InvalidShape {
        /// The event type name.
        kind: String,
        /// Underlying decode error.
        source: serde_json::Error,
    },
}

/// A registered event handler failed.
#[derive(thiserror::Error, Debug)]
pub enum HandlerFailure {
    /// The handler returned an error.
    #[error("Handler returned error: {0}")]
    Error(String),
    /// The handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}
