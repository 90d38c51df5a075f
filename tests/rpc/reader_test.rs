//! Tests for decoding the agent's stdout.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use pi_relay::rpc::{AgentEvent, EventDispatcher, EventReader, RpcEvent};
use tokio_test::io::Builder;

const START: &str = "{\"type\":\"agent_start\"}\n";
const DELTA: &str =
    "{\"type\":\"message_update\",\"assistantMessageEvent\":{\"type\":\"text_delta\",\"delta\":\"x\"}}\n";
const END: &str = "{\"type\":\"agent_end\",\"messages\":[]}\n";

#[tokio::test]
async fn malformed_lines_are_skipped() {
    // Three valid events and three malformed lines, one of them mid-stream.
    let mock = Builder::new()
        .read(START.as_bytes())
        .read(b"this is not json\n")
        .read(DELTA.as_bytes())
        .read(b"{\"no_type\":true}\n")
        .read(b"{\"type\":\"message_update\"}\n")
        .read(END.as_bytes())
        .build();

    let mut reader = EventReader::new(mock, Arc::new(EventDispatcher::new()));
    let mut kinds = Vec::new();
    while let Some(event) = reader.next_event().await {
        kinds.push(event.kind().to_string());
    }

    assert_eq!(kinds, ["agent_start", "message_update", "agent_end"]);
    assert_eq!(reader.malformed_count(), 3);
}

#[tokio::test]
async fn lines_split_across_reads_are_joined() {
    let mock = Builder::new()
        .read(b"{\"type\":\"agent_")
        .read(b"start\"}\n{\"type\":")
        .read(b"\"agent_end\",\"messages\":[]}\n")
        .build();

    let mut reader = EventReader::new(mock, Arc::new(EventDispatcher::new()));
    assert_eq!(reader.next_event().await.unwrap().kind(), "agent_start");
    assert!(reader.next_event().await.unwrap().is_terminal());
    assert!(reader.next_event().await.is_none());
}

#[tokio::test]
async fn unknown_types_are_yielded_by_name() {
    let mock = Builder::new()
        .read(b"{\"type\":\"tool_execution_start\",\"toolName\":\"bash\"}\n")
        .build();

    let mut reader = EventReader::new(mock, Arc::new(EventDispatcher::new()));
    let event = reader.next_event().await.unwrap();

    assert_eq!(event.kind(), "tool_execution_start");
    assert_eq!(event.event(), &AgentEvent::Unknown);
    assert_eq!(event.raw()["toolName"], "bash");
}

#[tokio::test]
async fn events_are_dispatched_before_they_are_yielded() {
    let dispatcher = Arc::new(EventDispatcher::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    dispatcher.on("agent_start", move |event: Arc<RpcEvent>| {
        sink.lock().unwrap().push(event.kind().to_string());
        async { Ok(()) }
    });

    let mock = Builder::new().read(START.as_bytes()).build();
    let mut reader = EventReader::new(mock, Arc::clone(&dispatcher));

    let event = reader.next_event().await.unwrap();
    assert_eq!(event.kind(), "agent_start");
    assert_eq!(*seen.lock().unwrap(), ["agent_start"]);
}

#[tokio::test]
async fn non_utf8_line_is_malformed() {
    let mock = Builder::new()
        .read(b"\xff\xfe\xfd\n")
        .read(START.as_bytes())
        .build();

    let mut reader = EventReader::new(mock, Arc::new(EventDispatcher::new()));
    assert_eq!(reader.next_event().await.unwrap().kind(), "agent_start");
    assert_eq!(reader.malformed_count(), 1);
}

#[tokio::test]
async fn into_stream_yields_all_events() {
    let mock = Builder::new()
        .read(START.as_bytes())
        .read(DELTA.as_bytes())
        .read(END.as_bytes())
        .build();

    let reader = EventReader::new(mock, Arc::new(EventDispatcher::new()));
    let events: Vec<Arc<RpcEvent>> = reader.into_stream().collect().await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[1].event().text_delta(), Some("x"));
}
