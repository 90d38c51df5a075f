//! Line reader for agent stdout and stderr.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

use crate::display::truncate;
use crate::rpc::{EventDispatcher, RpcEvent};

/// Maximum length of a malformed line echoed into the log.
const MAX_LOGGED_LINE: usize = 200;

/// Decodes agent stdout into events, dispatching each before yielding it.
///
/// The sequence is lazy and not restartable: events consumed by one caller
/// are gone for the next.
pub struct EventReader<R> {
    lines: Lines<BufReader<R>>,
    dispatcher: Arc<EventDispatcher>,
    malformed: usize,
    finished: bool,
}

impl<R> std::fmt::Debug for EventReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReader")
            .field("malformed", &self.malformed)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> EventReader<R> {
    /// Create a reader over `reader` that dispatches through `dispatcher`.
    pub fn new(reader: R, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            dispatcher,
            malformed: 0,
            finished: false,
        }
    }

    /// Read the next event.
    ///
    /// Empty lines are skipped. Lines that fail to decode are logged and
    /// skipped. Every decoded event is dispatched to registered handlers, and
    /// all of them finish, before it is returned. Returns `None` once the
    /// stream is closed.
    pub async fn next_event(&mut self) -> Option<Arc<RpcEvent>> {
        if self.finished {
            return None;
        }

        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match RpcEvent::parse(line) {
                        Ok(event) => {
                            let event = Arc::new(event);
                            tracing::trace!(event_type = event.kind(), "Agent event");
                            self.dispatcher.dispatch(&event).await;
                            return Some(event);
                        }
                        Err(e) => {
                            self.malformed += 1;
                            tracing::warn!(
                                error = %e,
                                line = %truncate(line, MAX_LOGGED_LINE, false),
                                "Skipping malformed agent output"
                            );
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!("Agent stdout closed");
                    self.finished = true;
                    return None;
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    self.malformed += 1;
                    tracing::warn!(error = %e, "Skipping non-UTF-8 agent output");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read agent stdout");
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Number of lines dropped as malformed so far.
    #[must_use]
    pub fn malformed_count(&self) -> usize {
        self.malformed
    }

    /// Whether the underlying stream has closed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Convert into a `Stream` of events.
    pub fn into_stream(self) -> impl futures_core::Stream<Item = Arc<RpcEvent>> {
        futures_util::stream::unfold(self, |mut reader| async {
            reader.next_event().await.map(|event| (event, reader))
        })
    }
}

/// Log every non-empty stderr line until the stream closes.
///
/// Read failures are logged and end the drain; they never propagate.
pub async fn drain_stderr<R: AsyncRead + Unpin>(stderr: R, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::warn!(pid = ?pid, agent_stderr = %line, "Agent stderr");
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(pid = ?pid, error = %e, "Agent stderr drain failed");
                break;
            }
        }
    }
    tracing::debug!(pid = ?pid, "Agent stderr closed");
}
