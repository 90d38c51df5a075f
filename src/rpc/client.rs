//! RPC client for one agent process.
//!
//! The client owns the process, the event reader and the dispatcher. Writes
//! go through the process's stdin lock; reads go through the reader lock,
//! which a caller can hold for the duration of a prompt so no other consumer
//! interleaves with its events.
//!
//! A run abandoned after `abort` leaves its remaining events in the stream.
//! The client records that as a pending drain; the next [`RpcClient::query`]
//! or prompt reads up to the aborted run's terminal event before sending
//! anything, so responses stay matched to their requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::ChildStdout;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::config::AgentConfig;
use crate::rpc::{
    AgentEvent, AgentProcess, AgentProcessBuilder, CommandResponse, EventDispatcher,
    EventReader, HandlerId, HandlerResult, RpcCommand, RpcError, RpcEvent, SteeringMode,
};

/// Event reader over the agent's stdout.
pub type AgentEvents = EventReader<ChildStdout>;

/// Client for a single agent process in RPC mode.
#[derive(Debug)]
pub struct RpcClient {
    process: AgentProcess,
    dispatcher: Arc<EventDispatcher>,
    events: Mutex<AgentEvents>,
    pending_drain: AtomicBool,
    desynced: AtomicBool,
}

impl RpcClient {
    /// Spawn the agent described by `config` and wrap it in a client.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ProcessStart` if the agent cannot be launched.
    pub fn start(config: &AgentConfig) -> Result<Self, RpcError> {
        let builder = AgentProcessBuilder::from_config(config);
        let process = AgentProcess::spawn_with_binary(&config.binary, &builder)?
            .with_stop_timeout(Duration::from_secs(config.stop_timeout_secs));
        Self::from_process(process)
    }

    /// Wrap an already-spawned process.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::OutputTaken` if the process's stdout was already taken.
    pub fn from_process(mut process: AgentProcess) -> Result<Self, RpcError> {
        let stdout = process.take_stdout().ok_or(RpcError::OutputTaken)?;
        let dispatcher = Arc::new(EventDispatcher::new());
        let events = EventReader::new(stdout, Arc::clone(&dispatcher));

        Ok(Self {
            process,
            dispatcher,
            events: Mutex::new(events),
            pending_drain: AtomicBool::new(false),
            desynced: AtomicBool::new(false),
        })
    }

    /// Process ID of the agent.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    /// The dispatcher events are routed through.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Register an event handler. See [`EventDispatcher::on`].
    pub fn on<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(Arc<RpcEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.dispatcher.on(event_type, handler)
    }

    /// Register a `text_delta` handler. See [`EventDispatcher::on_text_delta`].
    pub fn on_text_delta<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.dispatcher.on_text_delta(handler)
    }

    /// Validate, encode and write one command.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidCommand` before any I/O if validation fails,
    /// or `RpcError::StreamClosed` if the agent's stdin is gone.
    pub async fn send(&self, command: &RpcCommand) -> Result<(), RpcError> {
        let line = command.encode()?;
        tracing::debug!(pid = ?self.pid(), command = command.kind(), "Sending command");
        self.process.write_line(&line).await
    }

    /// Lock the event sequence for exclusive consumption.
    pub async fn events(&self) -> MutexGuard<'_, AgentEvents> {
        self.events.lock().await
    }

    /// Read the next event, dispatching it to handlers first.
    pub async fn next_event(&self) -> Option<Arc<RpcEvent>> {
        self.events.lock().await.next_event().await
    }

    /// Send a query or control command and wait for its `response` event.
    ///
    /// Responses are matched by `command` name, first-in first-out. Other
    /// events read meanwhile are dispatched as usual. Returns `None` if no
    /// matching response arrives within `timeout` or the stream closes.
    ///
    /// `timeout` covers draining an aborted run as well as the wait. A
    /// response that misses the deadline would later be taken for the
    /// answer to another request, so a timeout marks the client
    /// desynchronized.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Desynchronized` if the client is out of step, or
    /// an error if the command cannot be sent.
    pub async fn query(
        &self,
        command: &RpcCommand,
        timeout: Duration,
    ) -> Result<Option<CommandResponse>, RpcError> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().await;
        if !self.settle_events(&mut events, deadline).await {
            return Err(RpcError::Desynchronized);
        }
        self.send(command).await?;

        let kind = command.kind();
        let wait = async {
            while let Some(event) = events.next_event().await {
                if let AgentEvent::Response(response) = event.event() {
                    if response.command.as_deref().map_or(true, |c| c == kind) {
                        return Some(response.clone());
                    }
                }
            }
            None
        };

        match tokio::time::timeout_at(deadline, wait).await {
            Ok(response) => Ok(response),
            Err(_) => {
                tracing::warn!(
                    command = kind,
                    pid = ?self.pid(),
                    "No response from agent before timeout, marking client desynchronized"
                );
                self.mark_desynced();
                Ok(None)
            }
        }
    }

    /// Read past the events of an aborted run, waiting at most `grace`.
    ///
    /// Returns `true` if nothing was pending or the aborted run's terminal
    /// event arrived. Otherwise the client is marked desynchronized.
    pub async fn settle(&self, grace: Duration) -> bool {
        let mut events = self.events.lock().await;
        self.settle_events(&mut events, Instant::now() + grace).await
    }

    /// [`RpcClient::settle`] on an already locked event sequence.
    pub(crate) async fn settle_events(&self, events: &mut AgentEvents, deadline: Instant) -> bool {
        if self.is_desynced() {
            return false;
        }
        if !self.has_pending_drain() {
            return true;
        }

        let drain = async {
            while let Some(event) = events.next_event().await {
                if event.is_terminal() {
                    return true;
                }
            }
            false
        };

        if let Ok(true) = tokio::time::timeout_at(deadline, drain).await {
            tracing::debug!(pid = ?self.pid(), "Aborted run drained");
            self.pending_drain.store(false, Ordering::Release);
            true
        } else {
            tracing::warn!(
                pid = ?self.pid(),
                "Aborted run did not end, marking client desynchronized"
            );
            self.mark_desynced();
            false
        }
    }

    /// Send a prompt.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn prompt(&self, message: &str) -> Result<(), RpcError> {
        self.send(&RpcCommand::prompt(message)).await
    }

    /// Interrupt the current run with a steering message.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn steer(&self, message: &str) -> Result<(), RpcError> {
        self.send(&RpcCommand::steer(message)).await
    }

    /// Queue a follow-up message.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn follow_up(&self, message: &str) -> Result<(), RpcError> {
        self.send(&RpcCommand::follow_up(message)).await
    }

    /// Abort the current run.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn abort(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::Abort).await
    }

    /// Clear the session's messages.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn reset(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::Reset).await
    }

    /// Start a fresh session.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn new_session(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::NewSession).await
    }

    /// Save the current session, optionally under a name.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn save_session(&self, name: Option<&str>) -> Result<(), RpcError> {
        self.send(&RpcCommand::SaveSession {
            name: name.map(str::to_string),
        })
        .await
    }

    /// Load a saved session.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn load_session(&self, name: &str) -> Result<(), RpcError> {
        self.send(&RpcCommand::LoadSession {
            name: name.to_string(),
        })
        .await
    }

    /// List saved sessions.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn list_sessions(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::ListSessions).await
    }

    /// Delete a saved session.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn delete_session(&self, name: &str) -> Result<(), RpcError> {
        self.send(&RpcCommand::DeleteSession {
            name: name.to_string(),
        })
        .await
    }

    /// Switch the active model.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn set_model(&self, model_id: &str) -> Result<(), RpcError> {
        self.send(&RpcCommand::SetModel {
            model_id: model_id.to_string(),
        })
        .await
    }

    /// Ask for the active model.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn get_model(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::GetModel).await
    }

    /// Ask for the available models.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn list_models(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::ListModels).await
    }

    /// Ask for the session's messages.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn get_messages(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::GetMessages).await
    }

    /// Delete a message.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn delete_message(&self, message_id: &str) -> Result<(), RpcError> {
        self.send(&RpcCommand::DeleteMessage {
            message_id: message_id.to_string(),
        })
        .await
    }

    /// Replace a message's content.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn edit_message(&self, message_id: &str, new_content: &str) -> Result<(), RpcError> {
        self.send(&RpcCommand::EditMessage {
            message_id: message_id.to_string(),
            new_content: new_content.to_string(),
        })
        .await
    }

    /// Run a shell command through the agent.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn bash(&self, command: &str, cwd: Option<&str>) -> Result<(), RpcError> {
        self.send(&RpcCommand::Bash {
            command: command.to_string(),
            cwd: cwd.map(str::to_string),
        })
        .await
    }

    /// Interrupt the running shell command.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn bash_interrupt(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::BashInterrupt).await
    }

    /// Set the steering mode.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn set_steering_mode(&self, mode: SteeringMode) -> Result<(), RpcError> {
        self.send(&RpcCommand::SetSteeringMode { mode }).await
    }

    /// Ask for the steering mode.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn get_steering_mode(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::GetSteeringMode).await
    }

    /// Enable or disable tool-call auto approval.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn set_auto_approve(&self, enabled: bool) -> Result<(), RpcError> {
        self.send(&RpcCommand::SetAutoApprove { enabled }).await
    }

    /// Ask for the auto-approve setting.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn get_auto_approve(&self) -> Result<(), RpcError> {
        self.send(&RpcCommand::GetAutoApprove).await
    }

    /// Whether the agent process is still running.
    pub async fn is_running(&self) -> bool {
        self.process.is_running().await
    }

    /// Record that `abort` was sent and the aborted run's events are unread.
    pub fn mark_pending_drain(&self) {
        self.pending_drain.store(true, Ordering::Release);
    }

    /// Whether an aborted run still has to be drained.
    #[must_use]
    pub fn has_pending_drain(&self) -> bool {
        self.pending_drain.load(Ordering::Acquire)
    }

    /// Flag the event stream as out of step with the last prompt.
    pub fn mark_desynced(&self) {
        self.desynced.store(true, Ordering::Release);
    }

    /// Whether an abandoned run or late response left the stream out of step.
    #[must_use]
    pub fn is_desynced(&self) -> bool {
        self.desynced.load(Ordering::Acquire)
    }

    /// Close stdin and wait for the agent to exit. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the process fails.
    pub async fn stop(&self) -> Result<(), RpcError> {
        self.process.stop().await.map(|_| ())
    }
}
