//! Tests for agent process spawning and control.

use std::time::{Duration, Instant};

use pi_relay::config::AgentConfig;
use pi_relay::rpc::{AgentProcess, AgentProcessBuilder, RpcError, SpawnError};

use crate::scripted_agent;

#[test]
fn builder_defaults_to_rpc_mode() {
    let args = AgentProcessBuilder::new("lmstudio").build_args();
    assert_eq!(&args[..2], ["--mode", "rpc"]);
    assert!(args.contains(&"--provider".to_string()));
    assert!(args.contains(&"lmstudio".to_string()));
    assert!(!args.contains(&"--no-session".to_string()));
}

#[test]
fn builder_from_default_config() {
    let builder = AgentProcessBuilder::from_config(&AgentConfig::default());
    let args = builder.build_args();

    assert_eq!(builder.provider(), "lmstudio");
    assert!(args.contains(&"--model".to_string()));
    assert!(args.contains(&"qwen/qwen3-coder-30b".to_string()));
    assert!(args.contains(&"--no-session".to_string()));
}

#[test]
fn builder_working_dir() {
    use std::path::PathBuf;

    let builder = AgentProcessBuilder::new("lmstudio").working_dir("/tmp/agent");
    assert_eq!(builder.get_working_dir(), Some(&PathBuf::from("/tmp/agent")));
    assert!(AgentProcessBuilder::new("lmstudio")
        .get_working_dir()
        .is_none());
}

#[tokio::test]
async fn spawn_missing_binary_is_not_found() {
    let builder = AgentProcessBuilder::new("lmstudio");
    let err = AgentProcess::spawn_with_binary("pi-relay-no-such-binary", &builder).unwrap_err();
    assert!(matches!(err, SpawnError::NotFound(ref b) if b == "pi-relay-no-such-binary"));
}

#[tokio::test]
async fn take_stdout_once() {
    let mut process = scripted_agent("cat >/dev/null");
    assert!(process.id().is_some());
    assert!(process.take_stdout().is_some());
    assert!(process.take_stdout().is_none());
    process.stop().await.unwrap();
}

#[tokio::test]
async fn write_line_reaches_agent() {
    let mut process = scripted_agent(r#"read line; printf '%s\n' "$line""#);
    let stdout = process.take_stdout().unwrap();

    process.write_line(r#"{"type":"abort"}"#).await.unwrap();

    let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stdout));
    let echoed = lines.next_line().await.unwrap().unwrap();
    assert_eq!(echoed, r#"{"type":"abort"}"#);

    process.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_stdin_and_waits() {
    let process = scripted_agent("cat >/dev/null");
    assert!(process.is_running().await);

    let status = process.stop().await.unwrap();
    assert!(status.is_some_and(|s| s.success()));
    assert!(!process.is_running().await);
}

#[tokio::test]
async fn stop_twice_on_exited_process() {
    let process = scripted_agent("exit 0");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first = process.stop().await;
    let second = process.stop().await;

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert!(!process.is_running().await);
}

#[tokio::test]
async fn write_after_stop_is_stream_closed() {
    let process = scripted_agent("cat >/dev/null");
    process.stop().await.unwrap();

    let err = process.write_line(r#"{"type":"abort"}"#).await.unwrap_err();
    assert!(matches!(err, RpcError::StreamClosed));
}

#[tokio::test]
async fn write_after_exit_is_stream_closed() {
    let process = scripted_agent("exit 3");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = process.write_line(r#"{"type":"abort"}"#).await.unwrap_err();
    assert!(matches!(err, RpcError::StreamClosed));
    process.stop().await.unwrap();
}

#[tokio::test]
async fn stop_terminates_agent_ignoring_stdin() {
    let process = scripted_agent("sleep 30").with_stop_timeout(Duration::from_millis(200));

    let started = Instant::now();
    process.stop().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!process.is_running().await);
}

#[tokio::test]
async fn stderr_is_drained_without_blocking() {
    let process = scripted_agent("i=0; while [ $i -lt 2000 ]; do echo 'noise on stderr' >&2; i=$((i+1)); done; cat >/dev/null");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(process.is_running().await);
    process.stop().await.unwrap();
}
