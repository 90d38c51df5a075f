//! Event dispatch to registered handlers.
//!
//! Handlers are registered per event `type` name and run concurrently for
//! each event. `dispatch` returns only after every matching handler has
//! finished, so handlers for event N never overlap handlers for event N+1.
//! A handler that errors or panics is logged and does not affect its
//! siblings or the caller.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;

use crate::rpc::{HandlerFailure, RpcEvent};

/// Result returned by event handlers.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type BoxedHandler = Arc<dyn Fn(Arc<RpcEvent>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Identifies a registered handler so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Counts from one `dispatch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers invoked.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Registry of event handlers keyed by event type.
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Vec<(HandlerId, BoxedHandler)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&str, usize> = handlers
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        f.debug_struct("EventDispatcher")
            .field("handlers", &counts)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for events whose `type` is `event_type`.
    ///
    /// Handlers for the same type are kept in registration order.
    pub fn on<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(Arc<RpcEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let boxed: BoxedHandler = Arc::new(move |event| handler(event).boxed());
        let event_type = event_type.into();

        tracing::debug!(event_type = %event_type, handler = id.0, "Registered event handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push((id, boxed));
        id
    }

    /// Register a handler that receives only `text_delta` fragments.
    pub fn on_text_delta<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on("message_update", move |event: Arc<RpcEvent>| {
            let pending = event
                .event()
                .text_delta()
                .map(|delta| handler(delta.to_string()));
            async move {
                match pending {
                    Some(fut) => fut.await,
                    None => Ok(()),
                }
            }
        })
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(hid, _)| *hid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the event's type and wait for all of them.
    pub async fn dispatch(&self, event: &Arc<RpcEvent>) -> DispatchOutcome {
        // Snapshot so the lock is never held across an await.
        let handlers: Vec<(HandlerId, BoxedHandler)> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.kind())
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            return DispatchOutcome::default();
        }

        let runs = handlers.iter().map(|(id, handler)| {
            let id = *id;
            let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler(Arc::clone(event))));
            async move {
                let result = match started {
                    Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(HandlerFailure::Error(e.to_string())),
                        Err(payload) => Err(HandlerFailure::Panicked(panic_message(&*payload))),
                    },
                    Err(payload) => Err(HandlerFailure::Panicked(panic_message(&*payload))),
                };
                (id, result)
            }
        });

        let results = join_all(runs).await;

        let mut outcome = DispatchOutcome {
            invoked: results.len(),
            failed: 0,
        };
        for (id, result) in results {
            if let Err(failure) = result {
                outcome.failed += 1;
                tracing::warn!(
                    event_type = event.kind(),
                    handler = id.0,
                    error = %failure,
                    "Event handler failed"
                );
            }
        }
        outcome
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
