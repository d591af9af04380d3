//! Worker runtime tests over in-memory frame channels

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::{duplex, DuplexStream};
use tokio::task::JoinHandle;

use shared::{read_frame, write_frame, AccountId, TaskRequest, WorkerCommand, WorkerEvent};
use worker::traits::MockBrokerSession;
use worker::{standard_registry, Worker, WorkerError, WorkerResult};

struct Harness {
    commands: DuplexStream,
    events: DuplexStream,
    handle: JoinHandle<WorkerResult<()>>,
}

impl Harness {
    fn start(session: MockBrokerSession) -> Self {
        let (commands, worker_commands) = duplex(64 * 1024);
        let (worker_events, events) = duplex(64 * 1024);
        let worker = Worker::new(AccountId::new(), Arc::new(session), tokio_test::assert_ok!(standard_registry()));
        let handle = tokio::spawn(worker.run(worker_commands, worker_events));
        Self { commands, events, handle }
    }

    async fn send(&mut self, command: WorkerCommand) {
        write_frame(&mut self.commands, &command).await.unwrap();
    }

    async fn next_event(&mut self) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(2), read_frame(&mut self.events))
            .await
            .expect("worker event")
            .unwrap()
            .expect("stream open")
    }
}

fn open_session() -> MockBrokerSession {
    let mut session = MockBrokerSession::new();
    session.expect_open().returning(|| Ok(()));
    session
}

fn kwargs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// The first event is always Ready
#[tokio::test]
async fn test_reports_ready_first() {
    let mut harness = Harness::start(open_session());

    assert!(matches!(harness.next_event().await, WorkerEvent::Ready { .. }));
}

/// A failed session open exits before Ready
#[tokio::test]
async fn test_open_failure_ends_run() {
    let mut session = MockBrokerSession::new();
    session.expect_open().returning(|| {
        Err(WorkerError::SessionError {
            message: "bad key".to_string(),
        })
    });

    let harness = Harness::start(session);
    let result = harness.handle.await.unwrap();

    assert!(matches!(result, Err(WorkerError::SessionError { .. })));
}

/// Registered methods reach the session and their result comes back
#[tokio::test]
async fn test_executes_registered_method() {
    let mut session = open_session();
    session
        .expect_call()
        .withf(|operation, params| operation == "place_order" && params["symbol"] == "AAPL")
        .returning(|_, _| Ok(json!({"id": 9001})));

    let mut harness = Harness::start(session);
    harness.next_event().await;

    let request = TaskRequest::new(
        "trade.place_order",
        vec![json!("AAPL"), json!("BUY"), json!("LMT"), json!(5), json!(101.25)],
        Map::new(),
        Duration::from_secs(1),
    );
    let task_id = request.task_id;
    harness.send(WorkerCommand::Task(request)).await;

    match harness.next_event().await {
        WorkerEvent::TaskResult(response) => {
            assert_eq!(response.task_id, task_id);
            assert!(response.success);
            assert_eq!(response.result, Some(json!({"id": 9001})));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

/// Unknown methods fail the task, not the worker
#[tokio::test]
async fn test_unknown_method_is_a_failed_task() {
    let mut harness = Harness::start(open_session());
    harness.next_event().await;

    harness
        .send(WorkerCommand::Task(TaskRequest::new("push.subscribe", vec![], Map::new(), Duration::from_secs(1))))
        .await;

    match harness.next_event().await {
        WorkerEvent::TaskResult(response) => {
            assert!(!response.success);
            assert!(response.error.unwrap().contains("Unknown method"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    harness.send(WorkerCommand::Heartbeat { timestamp: chrono::Utc::now() }).await;
    assert!(matches!(harness.next_event().await, WorkerEvent::Heartbeat(_)));
}

/// Health checks and heartbeats report the completed task count
#[tokio::test]
async fn test_health_check_and_heartbeat_counts() {
    let mut session = open_session();
    session.expect_call().returning(|_, _| Ok(json!({"status": "open"})));

    let mut harness = Harness::start(session);
    harness.next_event().await;

    harness
        .send(WorkerCommand::Task(TaskRequest::new(
            "quote.get_market_status",
            vec![],
            kwargs(json!({"market": "US"})),
            Duration::from_secs(1),
        )))
        .await;
    harness.next_event().await;

    harness
        .send(WorkerCommand::Task(TaskRequest::new("health_check", vec![], Map::new(), Duration::from_secs(1))))
        .await;
    match harness.next_event().await {
        WorkerEvent::TaskResult(response) => {
            let report = response.result.unwrap();
            assert_eq!(report["initialized"], true);
            assert_eq!(report["task_count"], 1);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    harness.send(WorkerCommand::Heartbeat { timestamp: chrono::Utc::now() }).await;
    match harness.next_event().await {
        WorkerEvent::Heartbeat(report) => {
            assert!(report.initialized);
            assert_eq!(report.task_count, 2);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

/// Shutdown ends the loop cleanly
#[tokio::test]
async fn test_shutdown_ends_run() {
    let mut harness = Harness::start(open_session());
    harness.next_event().await;

    harness.send(WorkerCommand::Shutdown).await;
    let result = tokio::time::timeout(Duration::from_secs(2), harness.handle).await.unwrap().unwrap();

    assert!(result.is_ok());
}

/// Closing the command channel also ends the loop
#[tokio::test]
async fn test_closed_channel_ends_run() {
    let mut harness = Harness::start(open_session());
    harness.next_event().await;

    drop(harness.commands);
    let result = tokio::time::timeout(Duration::from_secs(2), harness.handle).await.unwrap().unwrap();

    assert!(result.is_ok());
}
