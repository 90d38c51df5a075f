//! Tests for the per-chat session pool.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pi_relay::config::RelayConfig;
use pi_relay::relay::{Launcher, PoolError, SessionPool};
use pi_relay::rpc::{AgentProcess, RpcError, SpawnError};

/// Replies to every prompt with its sequence number and the agent's pid.
const COUNTING_AGENT: &str = r#"n=0
while IFS= read -r line; do
  case "$line" in
    *'"type":"new_session"'*)
      printf '%s\n' '{"type":"response","command":"new_session","success":true}' ;;
    *'"type":"prompt"'*)
      n=$((n+1))
      sleep 0.1
      printf '%s\n' "{\"type\":\"agent_end\",\"messages\":[{\"role\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"reply $n from $$\"}]}]}" ;;
  esac
done"#;

/// Replies once, then exits.
const ONE_SHOT_AGENT: &str = r#"read -r line
printf '%s\n' "{\"type\":\"agent_end\",\"messages\":[{\"role\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"bye from $$\"}]}]}""#;

fn launcher(script: &'static str) -> Launcher {
    Arc::new(move || AgentProcess::spawn_raw("sh", ["-c", script]))
}

fn pool(script: &'static str, config: RelayConfig) -> SessionPool {
    SessionPool::new(config).with_launcher(launcher(script))
}

fn pid_of(reply: &str) -> &str {
    reply.rsplit(' ').next().unwrap()
}

#[tokio::test]
async fn prompts_reuse_the_chat_agent() {
    let pool = pool(COUNTING_AGENT, RelayConfig::default());

    let first = pool.send_prompt("chat-1", "one").await.unwrap();
    let second = pool.send_prompt("chat-1", "two").await.unwrap();

    assert!(first.starts_with("reply 1 from "));
    assert!(second.starts_with("reply 2 from "));
    assert_eq!(pid_of(&first), pid_of(&second));
    pool.stop_all().await;
}

#[tokio::test]
async fn chats_get_separate_agents() {
    let pool = pool(COUNTING_AGENT, RelayConfig::default());

    let a = pool.send_prompt("alice", "hi").await.unwrap();
    let b = pool.send_prompt("bob", "hi").await.unwrap();

    assert!(a.starts_with("reply 1 "));
    assert!(b.starts_with("reply 1 "));
    assert_ne!(pid_of(&a), pid_of(&b));
    assert_eq!(pool.active_count().await, 2);
    pool.stop_all().await;
    assert_eq!(pool.active_count().await, 0);
}

#[tokio::test]
async fn concurrent_prompts_for_one_chat_are_serialized() {
    let pool = pool(COUNTING_AGENT, RelayConfig::default());

    let (a, b) = tokio::join!(
        pool.send_prompt("chat-1", "first"),
        pool.send_prompt("chat-1", "second")
    );

    let replies: HashSet<String> = [a.unwrap(), b.unwrap()]
        .iter()
        .map(|r| r.split(" from ").next().unwrap().to_string())
        .collect();
    assert_eq!(
        replies,
        HashSet::from(["reply 1".to_string(), "reply 2".to_string()])
    );
    pool.stop_all().await;
}

#[tokio::test]
async fn exited_agent_is_restarted() {
    let pool = pool(ONE_SHOT_AGENT, RelayConfig::default());

    let first = pool.send_prompt("chat-1", "one").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = pool.send_prompt("chat-1", "two").await.unwrap();

    assert!(first.starts_with("bye from "));
    assert!(second.starts_with("bye from "));
    assert_ne!(pid_of(&first), pid_of(&second));
    pool.stop_all().await;
}

#[tokio::test]
async fn timed_out_agent_is_replaced() {
    let mut config = RelayConfig::default();
    config.relay.prompt_timeout_secs = 1;
    config.relay.abort_grace_secs = 1;

    let starts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&starts);
    let pool = pool("cat >/dev/null", config).with_client_setup(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let started = Instant::now();
    let reply = pool.send_prompt("chat-1", "hello?").await.unwrap();
    assert_eq!(reply, "Error: Response timed out.");
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    let started = Instant::now();
    let reply = pool.send_prompt("chat-1", "hello again?").await.unwrap();
    assert_eq!(reply, "Error: Response timed out.");
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    pool.stop_all().await;
}

#[tokio::test]
async fn prompt_after_undrainable_abort_runs_on_fresh_agent() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("hung-once");
    // The first agent never finishes its prompt and ignores abort; later
    // agents answer straight away.
    let script = format!(
        r#"while IFS= read -r line; do
  case "$line" in
    *'"type":"prompt"'*)
      if [ -e '{marker}' ]; then
        printf '%s\n' "{{\"type\":\"agent_end\",\"messages\":[{{\"role\":\"assistant\",\"content\":[{{\"type\":\"text\",\"text\":\"answer from $$\"}}]}}]}}"
      else
        : > '{marker}'
      fi ;;
  esac
done"#,
        marker = marker.display()
    );
    let launcher: Launcher = Arc::new(move || AgentProcess::spawn_raw("sh", ["-c", script.as_str()]));

    let mut config = RelayConfig::default();
    config.relay.prompt_timeout_secs = 3;
    config.relay.abort_grace_secs = 1;
    let pool = SessionPool::new(config).with_launcher(launcher);

    let first = pool.send_prompt("chat-1", "one").await.unwrap();
    assert_eq!(first, "Error: Response timed out.");

    let started = Instant::now();
    let second = pool.send_prompt("chat-1", "two").await.unwrap();
    assert!(second.starts_with("answer from "), "got {second:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
    pool.stop_all().await;
}

#[tokio::test]
async fn max_sessions_is_enforced() {
    let mut config = RelayConfig::default();
    config.relay.max_sessions = 1;
    let pool = pool(COUNTING_AGENT, config);

    pool.ensure_started("alice").await.unwrap();
    let err = pool.ensure_started("bob").await.unwrap_err();
    assert!(matches!(err, PoolError::MaxSessionsReached { limit: 1 }));

    assert!(pool.stop("alice").await.unwrap());
    pool.ensure_started("bob").await.unwrap();
    pool.stop_all().await;
}

#[tokio::test]
async fn new_session_is_acknowledged() {
    let pool = pool(COUNTING_AGENT, RelayConfig::default());
    assert!(pool.new_session("chat-1").await.unwrap());
    pool.stop_all().await;
}

#[tokio::test]
async fn stop_unknown_chat_is_noop() {
    let pool = pool(COUNTING_AGENT, RelayConfig::default());
    assert!(!pool.stop("nobody").await.unwrap());
    assert!(!pool.cancel("nobody").await);
}

#[tokio::test]
async fn setup_runs_once_per_agent() {
    let starts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&starts);
    let pool = pool(COUNTING_AGENT, RelayConfig::default()).with_client_setup(move |chat, client| {
        assert_eq!(chat, "chat-1");
        assert!(client.pid().is_some());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    pool.ensure_started("chat-1").await.unwrap();
    pool.send_prompt("chat-1", "hi").await.unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    pool.stop_all().await;
}

#[tokio::test]
async fn launch_failure_is_reported() {
    let failing: Launcher =
        Arc::new(|| -> Result<AgentProcess, SpawnError> { Err(SpawnError::NotFound("pi".to_string())) });
    let pool = SessionPool::new(RelayConfig::default()).with_launcher(failing);

    let err = pool.send_prompt("chat-1", "hi").await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::Rpc(RpcError::ProcessStart(SpawnError::NotFound(_)))
    ));
    assert_eq!(
        err.to_string(),
        "Agent RPC failed: Failed to start agent process: Agent binary not found: pi"
    );
}
