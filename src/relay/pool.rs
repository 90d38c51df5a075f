//! One agent process per chat.
//!
//! Each chat id owns a slot holding at most one [`RpcClient`]. The slot's
//! async mutex is held for the whole of a prompt, so prompts for the same
//! chat queue behind each other and never interleave on one process. Agents
//! are started lazily and restarted when they have exited or lost sync. A
//! prompt that finds its agent out of step is retried once on a fresh agent
//! within what is left of its timeout.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::relay::aggregator::{PromptOutcome, ResponseAggregator};
use crate::relay::ui::{CancelPrompter, UiPrompter};
use crate::rpc::{AgentProcess, AgentProcessBuilder, RpcClient, RpcCommand, RpcError, SpawnError};

/// How long to wait for the agent to acknowledge a control command.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for session pool operations.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// Maximum concurrent chats reached.
    #[error("Maximum sessions reached: {limit}")]
    MaxSessionsReached { limit: usize },

    /// The agent could not be started or talked to.
    #[error("Agent RPC failed: {0}")]
    Rpc(#[from] RpcError),
}

impl From<SpawnError> for PoolError {
    fn from(err: SpawnError) -> Self {
        Self::Rpc(RpcError::ProcessStart(err))
    }
}

/// Starts an agent process for a chat.
pub type Launcher = Arc<dyn Fn() -> Result<AgentProcess, SpawnError> + Send + Sync>;

/// Called once for each newly started client, before its first prompt.
pub type ClientSetup = Arc<dyn Fn(&str, &RpcClient) + Send + Sync>;

#[derive(Default)]
struct ChatSlot {
    client: Mutex<Option<RpcClient>>,
    in_flight: std::sync::Mutex<Option<CancellationToken>>,
}

impl ChatSlot {
    fn set_in_flight(&self, token: Option<CancellationToken>) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn cancel_in_flight(&self) -> bool {
        match self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Pool of agent clients keyed by chat id.
pub struct SessionPool {
    config: RelayConfig,
    slots: Mutex<HashMap<String, Arc<ChatSlot>>>,
    launcher: Launcher,
    setup: Option<ClientSetup>,
    prompter: Arc<dyn UiPrompter>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    /// Create a pool that launches agents as described by `config`.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let agent = config.agent.clone();
        let launcher: Launcher = Arc::new(move || -> Result<AgentProcess, SpawnError> {
            let builder = AgentProcessBuilder::from_config(&agent);
            Ok(AgentProcess::spawn_with_binary(&agent.binary, &builder)?
                .with_stop_timeout(Duration::from_secs(agent.stop_timeout_secs)))
        });

        Self {
            config,
            slots: Mutex::new(HashMap::new()),
            launcher,
            setup: None,
            prompter: Arc::new(CancelPrompter),
        }
    }

    /// Replace how agent processes are started.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Set the prompter that answers UI requests.
    #[must_use]
    pub fn with_prompter(mut self, prompter: Arc<dyn UiPrompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Run `setup` on every newly started client, e.g. to register handlers.
    #[must_use]
    pub fn with_client_setup<F>(mut self, setup: F) -> Self
    where
        F: Fn(&str, &RpcClient) + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(setup));
        self
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Number of chats holding a slot.
    pub async fn active_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Start the chat's agent if it is not running.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::MaxSessionsReached` if the chat is new and the
    /// pool is full, or an RPC error if the agent cannot be started.
    pub async fn ensure_started(&self, chat: &str) -> Result<(), PoolError> {
        let slot = self.slot(chat).await?;
        let mut guard = slot.client.lock().await;
        self.ensure_client(chat, &mut guard).await?;
        Ok(())
    }

    /// Send `text` to the chat's agent and return the reply text.
    ///
    /// Agent errors, timeouts and cancellation are returned as `"Error: ..."`
    /// text rather than as `Err`.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be started or written to.
    pub async fn send_prompt(&self, chat: &str, text: &str) -> Result<String, PoolError> {
        self.prompt(chat, RpcCommand::prompt(text))
            .await
            .map(PromptOutcome::into_display_text)
    }

    /// Send a prompt-family command to the chat's agent and await the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be started or written to.
    pub async fn prompt(&self, chat: &str, command: RpcCommand) -> Result<PromptOutcome, PoolError> {
        let slot = self.slot(chat).await?;
        let mut guard = slot.client.lock().await;

        let cancel = CancellationToken::new();
        slot.set_in_flight(Some(cancel.clone()));
        let result = self.run_prompt(chat, &mut guard, command, cancel).await;
        slot.set_in_flight(None);

        match result {
            Ok(outcome) => {
                tracing::info!(chat, completed = outcome.is_completed(), "Prompt finished");
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(chat, error = %e, "Prompt failed");
                if matches!(e, PoolError::Rpc(RpcError::StreamClosed)) {
                    if let Some(client) = guard.take() {
                        if let Err(e) = client.stop().await {
                            tracing::warn!(chat, error = %e, "Failed to stop closed agent");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_prompt(
        &self,
        chat: &str,
        guard: &mut MutexGuard<'_, Option<RpcClient>>,
        command: RpcCommand,
        cancel: CancellationToken,
    ) -> Result<PromptOutcome, PoolError> {
        let timeout = Duration::from_secs(self.config.relay.prompt_timeout_secs);
        let started = Instant::now();

        let client = self.ensure_client(chat, guard).await?;
        let result = self
            .aggregator(timeout)
            .with_cancellation(cancel.clone())
            .run(client, command.clone())
            .await;
        if !matches!(result, Err(RpcError::Desynchronized)) {
            return result.map_err(PoolError::from);
        }

        tracing::warn!(chat, "Agent out of step, retrying on a fresh agent");
        let client = self.ensure_client(chat, guard).await?;
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Ok(PromptOutcome::TimedOut);
        }
        self.aggregator(remaining)
            .with_cancellation(cancel)
            .run(client, command)
            .await
            .map_err(PoolError::from)
    }

    /// Ask the chat's agent to start a fresh session.
    ///
    /// Returns whether the agent acknowledged the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be started or written to.
    pub async fn new_session(&self, chat: &str) -> Result<bool, PoolError> {
        let slot = self.slot(chat).await?;
        let mut guard = slot.client.lock().await;
        let client = self.ensure_client(chat, &mut guard).await?;

        let first = client.query(&RpcCommand::NewSession, CONTROL_TIMEOUT).await;
        let response = match first {
            Err(RpcError::Desynchronized) => {
                tracing::warn!(chat, "Agent out of step, retrying on a fresh agent");
                let client = self.ensure_client(chat, &mut guard).await?;
                client.query(&RpcCommand::NewSession, CONTROL_TIMEOUT).await?
            }
            other => other?,
        };
        let acknowledged = response.as_ref().is_some_and(|r| r.success);
        if let Some(error) = response.and_then(|r| r.error) {
            tracing::warn!(chat, %error, "Agent refused new session");
        }
        tracing::info!(chat, acknowledged, "New session requested");
        Ok(acknowledged)
    }

    /// Cancel the chat's in-flight prompt, if any.
    pub async fn cancel(&self, chat: &str) -> bool {
        let slot = self.slots.lock().await.get(chat).cloned();
        slot.is_some_and(|slot| slot.cancel_in_flight())
    }

    /// Stop the chat's agent and release its slot.
    ///
    /// An in-flight prompt is cancelled first. Returns whether an agent was
    /// running.
    ///
    /// # Errors
    ///
    /// Returns an error if stopping the process fails.
    pub async fn stop(&self, chat: &str) -> Result<bool, PoolError> {
        let Some(slot) = self.slots.lock().await.remove(chat) else {
            return Ok(false);
        };
        Self::stop_slot(chat, &slot).await.map_err(PoolError::from)
    }

    /// Stop every agent in the pool.
    pub async fn stop_all(&self) {
        let slots: Vec<(String, Arc<ChatSlot>)> = self.slots.lock().await.drain().collect();
        for (chat, slot) in slots {
            if let Err(e) = Self::stop_slot(&chat, &slot).await {
                tracing::warn!(chat = %chat, error = %e, "Failed to stop agent");
            }
        }
    }

    async fn stop_slot(chat: &str, slot: &ChatSlot) -> Result<bool, RpcError> {
        slot.cancel_in_flight();
        let Some(client) = slot.client.lock().await.take() else {
            return Ok(false);
        };
        tracing::info!(chat, pid = ?client.pid(), "Stopping agent");
        client.stop().await?;
        Ok(true)
    }

    async fn slot(&self, chat: &str) -> Result<Arc<ChatSlot>, PoolError> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(chat) {
            return Ok(Arc::clone(slot));
        }

        let limit = self.config.relay.max_sessions;
        if limit > 0 && slots.len() >= limit {
            tracing::warn!(chat, limit, "Refusing new chat, pool is full");
            return Err(PoolError::MaxSessionsReached { limit });
        }

        let slot = Arc::new(ChatSlot::default());
        slots.insert(chat.to_string(), Arc::clone(&slot));
        Ok(slot)
    }

    async fn ensure_client<'a>(
        &self,
        chat: &str,
        slot: &'a mut Option<RpcClient>,
    ) -> Result<&'a RpcClient, PoolError> {
        let healthy = match slot.as_ref() {
            Some(client) => client.is_running().await && !client.is_desynced(),
            None => false,
        };

        if !healthy {
            if let Some(stale) = slot.take() {
                tracing::warn!(
                    chat,
                    pid = ?stale.pid(),
                    desynced = stale.is_desynced(),
                    "Restarting agent"
                );
                if let Err(e) = stale.stop().await {
                    tracing::warn!(chat, error = %e, "Failed to stop stale agent");
                }
            }
        }

        let client = match slot.take() {
            Some(client) => client,
            None => self.launch(chat)?,
        };
        Ok(slot.insert(client))
    }

    fn launch(&self, chat: &str) -> Result<RpcClient, PoolError> {
        let process = (self.launcher)()?;
        let client = RpcClient::from_process(process)?;
        tracing::info!(chat, pid = ?client.pid(), "Started agent");
        if let Some(setup) = &self.setup {
            setup(chat, &client);
        }
        Ok(client)
    }

    fn aggregator(&self, timeout: Duration) -> ResponseAggregator {
        ResponseAggregator::new()
            .with_timeout(timeout)
            .with_abort_grace(Duration::from_secs(self.config.relay.abort_grace_secs))
            .with_prompter(Arc::clone(&self.prompter))
    }
}
