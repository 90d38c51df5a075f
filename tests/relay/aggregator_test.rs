//! Tests for driving prompts against scripted agents.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pi_relay::relay::{PromptOutcome, ResponseAggregator, UiAnswer, UiError, UiPrompter};
use pi_relay::rpc::{RpcCommand, RpcError, UiRequest};
use tokio_util::sync::CancellationToken;

use crate::scripted_client;

/// Answers `abort` with an aborted `agent_end` and `ping` with `pong`.
/// Other prompts never finish.
const ABORTABLE_AGENT: &str = r#"while IFS= read -r cmd; do
  case "$cmd" in
    *'"type":"abort"'*)
      printf '%s\n' '{"type":"agent_end","stopReason":"aborted","messages":[]}' ;;
    *'"message":"ping"'*)
      printf '%s\n' '{"type":"agent_end","stopReason":"stop","messages":[{"role":"assistant","content":[{"type":"text","text":"pong"}]}]}' ;;
  esac
done"#;

/// Slack for scheduling when checking that a call returns at its deadline.
const DEADLINE_SLACK: Duration = Duration::from_millis(200);

/// Asks for confirmation and reports which answer it got.
const CONFIRMING_AGENT: &str = r#"read -r line
printf '%s\n' '{"type":"extension_ui_request","id":"ui-7","method":"confirm","title":"Delete file?"}'
read -r answer
case "$answer" in
  *'"id":"ui-7"'*'"cancelled":true'*) reply=cancelled ;;
  *'"id":"ui-7"'*'"confirmed":true'*) reply=confirmed ;;
  *) reply=other ;;
esac
printf '%s\n' "{\"type\":\"agent_end\",\"messages\":[{\"role\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"$reply\"}]}]}"
cat >/dev/null"#;

struct AlwaysConfirm;

#[async_trait]
impl UiPrompter for AlwaysConfirm {
    async fn answer(&self, _request: &UiRequest) -> Result<UiAnswer, UiError> {
        Ok(UiAnswer::Confirmed(true))
    }
}

#[tokio::test]
async fn streams_deltas_then_returns_reduced_text() {
    let client = scripted_client(
        r#"read -r line
case "$line" in
  *'"type":"prompt","message":"hi"'*) ;;
  *) printf '%s\n' '{"type":"error","error":"unexpected command"}' ;;
esac
printf '%s\n' '{"type":"message_update","assistantMessageEvent":{"type":"text_delta","delta":"Hel"}}'
printf '%s\n' '{"type":"message_update","assistantMessageEvent":{"type":"text_delta","delta":"lo"}}'
printf '%s\n' '{"type":"agent_end","stopReason":"stop","messages":[{"role":"assistant","content":[{"type":"text","text":"Hello"}]}]}'
cat >/dev/null"#,
    );

    let deltas = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deltas);
    client.on_text_delta(move |delta| {
        sink.lock().unwrap().push(delta);
        async { Ok(()) }
    });

    let outcome = ResponseAggregator::new()
        .with_timeout(Duration::from_secs(5))
        .send_prompt_and_await_response(&client, "hi")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::Completed("Hello".to_string()));
    assert_eq!(*deltas.lock().unwrap(), ["Hel", "lo"]);
    client.stop().await.unwrap();
}

#[tokio::test]
async fn agent_error_is_a_result_not_an_error() {
    let client = scripted_client(
        r#"read -r line
printf '%s\n' '{"type":"error","error":"model not loaded"}'
cat >/dev/null"#,
    );

    let outcome = ResponseAggregator::new()
        .send_prompt_and_await_response(&client, "hi")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::AgentError("model not loaded".to_string()));
    assert_eq!(outcome.into_display_text(), "Error: model not loaded");
    client.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_prompt_is_an_agent_error() {
    let client = scripted_client(
        r#"read -r line
printf '%s\n' '{"type":"response","command":"prompt","success":false,"error":"agent is busy"}'
cat >/dev/null"#,
    );

    let outcome = ResponseAggregator::new()
        .send_prompt_and_await_response(&client, "hi")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::AgentError("agent is busy".to_string()));
    client.stop().await.unwrap();
}

#[tokio::test]
async fn timeout_returns_at_deadline_and_next_prompt_drains() {
    let client = scripted_client(ABORTABLE_AGENT);
    let timeout = Duration::from_millis(300);

    let started = Instant::now();
    let outcome = ResponseAggregator::new()
        .with_timeout(timeout)
        .send_prompt_and_await_response(&client, "take your time")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::TimedOut);
    assert_eq!(outcome.into_display_text(), "Error: Response timed out.");
    assert!(started.elapsed() < timeout + DEADLINE_SLACK);
    assert!(client.has_pending_drain());

    // The aborted run's empty agent_end must not be taken as this reply.
    let outcome = ResponseAggregator::new()
        .with_timeout(Duration::from_secs(5))
        .send_prompt_and_await_response(&client, "ping")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::Completed("pong".to_string()));
    assert!(!client.has_pending_drain());
    assert!(!client.is_desynced());
    client.stop().await.unwrap();
}

#[tokio::test]
async fn timeout_ignores_abort_grace_when_agent_ignores_abort() {
    let client = scripted_client("cat >/dev/null");
    let timeout = Duration::from_millis(200);

    let started = Instant::now();
    let outcome = ResponseAggregator::new()
        .with_timeout(timeout)
        .send_prompt_and_await_response(&client, "hello?")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::TimedOut);
    assert!(started.elapsed() < timeout + DEADLINE_SLACK);
    assert!(!client.is_desynced());

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let result = ResponseAggregator::new()
        .with_timeout(timeout)
        .send_prompt_and_await_response(&client, "still there?")
        .await;

    assert!(matches!(result, Err(RpcError::Desynchronized)));
    assert!(started.elapsed() < timeout + DEADLINE_SLACK);
    assert!(client.is_desynced());
    client.stop().await.unwrap();
}

#[tokio::test]
async fn cancellation_stops_waiting() {
    let client = scripted_client(ABORTABLE_AGENT);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = ResponseAggregator::new()
        .with_cancellation(cancel)
        .send_prompt_and_await_response(&client, "long task")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::Cancelled);
    assert!(client.has_pending_drain());
    assert!(client.settle(Duration::from_secs(2)).await);
    assert!(!client.is_desynced());
    client.stop().await.unwrap();
}

#[tokio::test]
async fn agent_exit_before_terminal_event() {
    let client = scripted_client(
        r#"read -r line
printf '%s\n' '{"type":"agent_start"}'
exit 1"#,
    );

    let outcome = ResponseAggregator::new()
        .send_prompt_and_await_response(&client, "hi")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::ProcessExited);
    client.stop().await.unwrap();
}

#[tokio::test]
async fn ui_requests_are_cancelled_by_default() {
    let client = scripted_client(CONFIRMING_AGENT);

    let outcome = ResponseAggregator::new()
        .send_prompt_and_await_response(&client, "delete it")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::Completed("cancelled".to_string()));
    client.stop().await.unwrap();
}

#[tokio::test]
async fn ui_requests_use_configured_prompter() {
    let client = scripted_client(CONFIRMING_AGENT);

    let outcome = ResponseAggregator::new()
        .with_prompter(Arc::new(AlwaysConfirm))
        .send_prompt_and_await_response(&client, "delete it")
        .await
        .unwrap();

    assert_eq!(outcome, PromptOutcome::Completed("confirmed".to_string()));
    client.stop().await.unwrap();
}

#[tokio::test]
async fn empty_prompt_is_rejected_without_sending() {
    let client = scripted_client("cat >/dev/null");

    let result = ResponseAggregator::new()
        .run(&client, RpcCommand::prompt(""))
        .await;

    assert!(result.is_err());
    assert!(!client.is_desynced());
    client.stop().await.unwrap();
}
