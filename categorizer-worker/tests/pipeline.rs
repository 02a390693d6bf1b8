use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_json_diff::assert_json_eq;
use async_trait::async_trait;
use categorizer_common::classifier::{Classifier, ClassifierConfig};
use categorizer_common::time::TimeSource;
use health::{HealthHandle, HealthRegistry};
use httpmock::prelude::*;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use categorizer_worker::broker::{
    BrokerError, Connector, Delivery, DeliveryTag, Session, Topology,
};
use categorizer_worker::worker::{
    CategorizationWorker, DeliveryOutcome, PipelineSettings, ReconnectPolicy, WorkerState,
};

const COMPLETIONS_PATH: &str = "/openai/v1/chat/completions";
const CATEGORIZED_AT: f64 = 1_700_000_000.25;

#[derive(Debug, Clone, PartialEq)]
enum Op {
    ConnectFailed,
    Connected,
    DeclareTopology(Topology),
    Consume { queue: String, prefetch: u16 },
    Publish {
        exchange: String,
        routing_key: String,
        payload: Value,
    },
    Ack(u64),
    Reject(u64),
    SettleFailed(u64),
    Close,
}

enum Scripted {
    Deliver(Vec<u8>),
    /// The broker ends the delivery stream, as on a lost connection.
    DropStream,
}

#[derive(Default)]
struct BrokerState {
    ops: Vec<Op>,
    connect_failures: usize,
    fail_publish: bool,
    failing_settlements: usize,
    script: VecDeque<Scripted>,
    next_tag: u64,
}

/// In-memory broker recording every operation. Once its script is exhausted it
/// cancels `drained`, which tests use as the worker's shutdown token.
#[derive(Clone)]
struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    drained: CancellationToken,
}

impl MemoryBroker {
    fn new(script: Vec<Scripted>) -> Self {
        let state = BrokerState {
            script: script.into(),
            ..Default::default()
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            drained: CancellationToken::new(),
        }
    }

    fn failing_connections(self, count: usize) -> Self {
        self.state.lock().unwrap().connect_failures = count;
        self
    }

    fn failing_publishes(self) -> Self {
        self.state.lock().unwrap().fail_publish = true;
        self
    }

    /// Fail the next `count` acks or rejects, as a dead channel would.
    fn failing_settlements(self, count: usize) -> Self {
        self.state.lock().unwrap().failing_settlements = count;
        self
    }

    /// Record a settlement, or its failure if one is still scripted to fail.
    fn settle(&self, tag: DeliveryTag, op: Op) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_settlements > 0 {
            state.failing_settlements -= 1;
            state.ops.push(Op::SettleFailed(tag.0));
            return Err(BrokerError::Settle {
                tag,
                reason: "channel closed".to_owned(),
            });
        }
        state.ops.push(op);
        Ok(())
    }

    fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    fn record(&self, op: Op) {
        self.state.lock().unwrap().ops.push(op);
    }

    fn published(&self) -> Vec<Value> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Publish { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }
}

struct MemorySession {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryBroker {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            state.ops.push(Op::ConnectFailed);
            return Err(BrokerError::Connect("connection refused".to_owned()));
        }
        state.ops.push(Op::Connected);

        Ok(MemorySession {
            broker: self.clone(),
        })
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        self.broker.record(Op::DeclareTopology(topology.clone()));
        Ok(())
    }

    async fn consume(&mut self, queue: &str, prefetch: u16) -> Result<(), BrokerError> {
        self.broker.record(Op::Consume {
            queue: queue.to_owned(),
            prefetch,
        });
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let next = {
            let mut state = self.broker.state.lock().unwrap();
            match state.script.pop_front() {
                Some(Scripted::Deliver(body)) => {
                    state.next_tag += 1;
                    Some(Some(Delivery {
                        tag: DeliveryTag(state.next_tag),
                        routing_key: "project.created".to_owned(),
                        redelivered: false,
                        body,
                    }))
                }
                Some(Scripted::DropStream) => Some(None),
                None => None,
            }
        };

        match next {
            Some(Some(delivery)) => Some(Ok(delivery)),
            Some(None) => None,
            None => {
                self.broker.drained.cancel();
                futures::future::pending().await
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        if self.broker.state.lock().unwrap().fail_publish {
            return Err(BrokerError::Publish("channel closed".to_owned()));
        }

        self.broker.record(Op::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: serde_json::from_slice(payload).expect("published payload is not JSON"),
        });
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.broker.settle(tag, Op::Ack(tag.0))
    }

    async fn reject(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.broker.settle(tag, Op::Reject(tag.0))
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.broker.record(Op::Close);
        Ok(())
    }
}

struct FixedTime;

impl TimeSource for FixedTime {
    fn epoch_seconds(&self) -> f64 {
        CATEGORIZED_AT
    }
}

fn topology() -> Topology {
    Topology {
        exchange: "project.events.exchange".to_owned(),
        queue: "categorization_queue".to_owned(),
        binding_keys: vec!["project.created".to_owned(), "project.updated".to_owned()],
        dead_letter_exchange: None,
    }
}

fn settings(reconnect_delay: Duration) -> PipelineSettings {
    PipelineSettings {
        topology: topology(),
        categorized_routing_key: "project.categorized".to_owned(),
        prefetch_count: 1,
        reconnect: ReconnectPolicy::new(reconnect_delay),
        heartbeat_interval: Duration::from_millis(100),
    }
}

fn classifier(server: &MockServer) -> Classifier {
    Classifier::new(ClassifierConfig {
        api_url: server.url(COMPLETIONS_PATH),
        api_key: "test-key".to_owned(),
        model: "llama-3.1-8b-instant".to_owned(),
        timeout: Duration::from_secs(2),
    })
    .expect("failed to build classifier")
}

fn completion(content: &str) -> Value {
    json!({
        "choices": [
            {"index": 0, "message": {"role": "assistant", "content": content}}
        ]
    })
}

fn project_event() -> Vec<u8> {
    json!({
        "projectId": "p1",
        "title": "API in Go",
        "description": "Build a REST API using Go and PostgreSQL",
        "eventType": "CREATED",
        "ownerId": "u42"
    })
    .to_string()
    .into_bytes()
}

async fn liveness() -> HealthHandle {
    HealthRegistry::new("readiness")
        .register("worker".to_string(), Duration::from_secs(30))
        .await
}

async fn worker(
    broker: &MemoryBroker,
    server: &MockServer,
    reconnect_delay: Duration,
) -> CategorizationWorker<MemoryBroker> {
    CategorizationWorker::new(
        broker.clone(),
        settings(reconnect_delay),
        classifier(server),
        liveness().await,
    )
    .with_timesource(FixedTime)
}

/// Run the worker until the broker script is exhausted.
async fn run_until_drained(broker: &MemoryBroker, server: &MockServer) -> WorkerState {
    let mut worker = worker(broker, server, Duration::from_millis(10)).await;

    timeout(
        Duration::from_secs(5),
        worker.connect_and_run(broker.drained.clone()),
    )
    .await
    .expect("worker did not stop");

    worker.state()
}

#[tokio::test]
async fn categorizes_and_republishes_a_project() {
    let server = MockServer::start_async().await;
    let groq = server
        .mock_async(|when, then| {
            when.method(POST)
                .path(COMPLETIONS_PATH)
                .header("authorization", "Bearer test-key");
            then.status(200).json_body(completion(
                r#"{"main_category": "Desarrollo de Software", "tags": ["Go", "PostgreSQL", "REST API"]}"#,
            ));
        })
        .await;
    let broker = MemoryBroker::new(vec![Scripted::Deliver(project_event())]);

    let state = run_until_drained(&broker, &server).await;

    assert_eq!(state, WorkerState::Stopped);
    groq.assert_hits_async(1).await;

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_json_eq!(
        published[0],
        json!({
            "projectId": "p1",
            "mainCategory": "Desarrollo de Software",
            "tags": ["Go", "PostgreSQL", "REST API"],
            "categorizedAt": CATEGORIZED_AT,
            "originalEventType": "CREATED"
        })
    );

    assert_eq!(
        broker.ops(),
        vec![
            Op::Connected,
            Op::DeclareTopology(topology()),
            Op::Consume {
                queue: "categorization_queue".to_owned(),
                prefetch: 1
            },
            Op::Publish {
                exchange: "project.events.exchange".to_owned(),
                routing_key: "project.categorized".to_owned(),
                payload: published[0].clone(),
            },
            Op::Ack(1),
            Op::Close,
        ]
    );
}

#[tokio::test]
async fn republishes_with_fallback_when_classification_fails() {
    let server = MockServer::start_async().await;
    let groq = server
        .mock_async(|when, then| {
            when.method(POST).path(COMPLETIONS_PATH);
            then.status(500).body("internal error");
        })
        .await;
    let broker = MemoryBroker::new(vec![Scripted::Deliver(project_event())]);

    run_until_drained(&broker, &server).await;

    groq.assert_hits_async(1).await;
    assert_json_eq!(
        broker.published(),
        json!([{
            "projectId": "p1",
            "mainCategory": "Other",
            "tags": [],
            "categorizedAt": CATEGORIZED_AT,
            "originalEventType": "CREATED"
        }])
    );
    assert!(broker.ops().contains(&Op::Ack(1)));
}

#[tokio::test]
async fn acks_incomplete_events_without_classifying() {
    let server = MockServer::start_async().await;
    let groq = server
        .mock_async(|when, then| {
            when.method(POST).path(COMPLETIONS_PATH);
            then.status(200).json_body(completion(
                r#"{"main_category": "Other", "tags": []}"#,
            ));
        })
        .await;
    let broker = MemoryBroker::new(vec![
        Scripted::Deliver(br#"{"projectId": "p2", "description": ""}"#.to_vec()),
        Scripted::Deliver(br#"{"title": "No id", "description": "Some work"}"#.to_vec()),
    ]);

    run_until_drained(&broker, &server).await;

    groq.assert_hits_async(0).await;
    assert!(broker.published().is_empty());

    let ops = broker.ops();
    assert!(ops.contains(&Op::Ack(1)));
    assert!(ops.contains(&Op::Ack(2)));
    assert!(!ops.iter().any(|op| matches!(op, Op::Reject(_))));
}

#[tokio::test]
async fn rejects_undecodable_deliveries() {
    let server = MockServer::start_async().await;
    let groq = server
        .mock_async(|when, then| {
            when.method(POST).path(COMPLETIONS_PATH);
            then.status(200).json_body(completion(
                r#"{"main_category": "Other", "tags": []}"#,
            ));
        })
        .await;
    let broker = MemoryBroker::new(vec![
        Scripted::Deliver(b"{definitely not json".to_vec()),
        Scripted::Deliver(br#"["p1", "API in Go"]"#.to_vec()),
        Scripted::Deliver(vec![0xc3, 0x28]),
    ]);

    let state = run_until_drained(&broker, &server).await;

    assert_eq!(state, WorkerState::Stopped);
    groq.assert_hits_async(0).await;
    assert!(broker.published().is_empty());

    let settled: Vec<Op> = broker
        .ops()
        .into_iter()
        .filter(|op| matches!(op, Op::Ack(_) | Op::Reject(_)))
        .collect();
    assert_eq!(settled, vec![Op::Reject(1), Op::Reject(2), Op::Reject(3)]);
}

#[tokio::test]
async fn rejects_when_publishing_fails() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(COMPLETIONS_PATH);
            then.status(200).json_body(completion(
                r#"{"main_category": "Soporte Administrativo", "tags": ["Excel"]}"#,
            ));
        })
        .await;
    let broker = MemoryBroker::new(vec![Scripted::Deliver(project_event())]).failing_publishes();

    run_until_drained(&broker, &server).await;

    let ops = broker.ops();
    assert!(ops.contains(&Op::Reject(1)));
    assert!(!ops.contains(&Op::Ack(1)));
}

#[tokio::test]
async fn reconnects_and_redeclares_the_same_topology() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(COMPLETIONS_PATH);
            then.status(200).json_body(completion(
                r#"{"main_category": "Marketing Digital y SEO", "tags": ["SEO"]}"#,
            ));
        })
        .await;
    let broker = MemoryBroker::new(vec![
        Scripted::DropStream,
        Scripted::Deliver(project_event()),
    ])
    .failing_connections(2);

    let state = run_until_drained(&broker, &server).await;

    assert_eq!(state, WorkerState::Stopped);

    let ops = broker.ops();
    let attempts: Vec<&Op> = ops
        .iter()
        .filter(|op| matches!(op, Op::ConnectFailed | Op::Connected))
        .collect();
    assert_eq!(
        attempts,
        vec![
            &Op::ConnectFailed,
            &Op::ConnectFailed,
            &Op::Connected,
            &Op::Connected
        ]
    );

    let declared: Vec<&Op> = ops
        .iter()
        .filter(|op| matches!(op, Op::DeclareTopology(_)))
        .collect();
    assert_eq!(
        declared,
        vec![
            &Op::DeclareTopology(topology()),
            &Op::DeclareTopology(topology())
        ]
    );

    // The lost session and the final one are both closed.
    assert_eq!(ops.iter().filter(|op| **op == Op::Close).count(), 2);
    assert_eq!(broker.published().len(), 1);
    assert!(ops.contains(&Op::Ack(1)));
}

#[tokio::test]
async fn stops_while_waiting_to_reconnect() {
    let server = MockServer::start_async().await;
    let broker = MemoryBroker::new(vec![]).failing_connections(usize::MAX);
    let mut worker = worker(&broker, &server, Duration::from_secs(60)).await;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    timeout(Duration::from_secs(5), worker.connect_and_run(shutdown))
        .await
        .expect("worker did not stop during the reconnect delay");

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(broker.ops(), vec![Op::ConnectFailed]);
}

#[tokio::test]
async fn finishes_the_delivery_in_flight_before_stopping() {
    let server = MockServer::start_async().await;
    let groq = server
        .mock_async(|when, then| {
            when.method(POST).path(COMPLETIONS_PATH);
            then.status(200)
                .delay(Duration::from_millis(500))
                .json_body(completion(
                    r#"{"main_category": "Redacción y Traducción", "tags": ["English"]}"#,
                ));
        })
        .await;
    let broker = MemoryBroker::new(vec![Scripted::Deliver(project_event())]);
    let mut worker = worker(&broker, &server, Duration::from_millis(10)).await;

    // Cancelled while the classification request is still waiting for its reply.
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    timeout(Duration::from_secs(5), worker.connect_and_run(shutdown))
        .await
        .expect("worker did not stop");

    assert_eq!(worker.state(), WorkerState::Stopped);
    groq.assert_hits_async(1).await;

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0]["mainCategory"], json!("Redacción y Traducción"));

    let ops = broker.ops();
    assert_eq!(
        ops[3..],
        [
            Op::Publish {
                exchange: "project.events.exchange".to_owned(),
                routing_key: "project.categorized".to_owned(),
                payload: published[0].clone(),
            },
            Op::Ack(1),
            Op::Close,
        ]
    );
}

#[tokio::test]
async fn reconnects_after_a_failed_ack() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(COMPLETIONS_PATH);
            then.status(200).json_body(completion(
                r#"{"main_category": "Desarrollo de Software", "tags": ["Go"]}"#,
            ));
        })
        .await;
    // The second delivery stands in for the broker redelivering the unsettled one.
    let broker = MemoryBroker::new(vec![
        Scripted::Deliver(project_event()),
        Scripted::Deliver(project_event()),
    ])
    .failing_settlements(1);

    let state = run_until_drained(&broker, &server).await;

    assert_eq!(state, WorkerState::Stopped);

    let published = broker.published();
    assert_eq!(published.len(), 2);
    let publish = Op::Publish {
        exchange: "project.events.exchange".to_owned(),
        routing_key: "project.categorized".to_owned(),
        payload: published[0].clone(),
    };
    let consume = Op::Consume {
        queue: "categorization_queue".to_owned(),
        prefetch: 1,
    };

    assert_eq!(
        broker.ops(),
        vec![
            Op::Connected,
            Op::DeclareTopology(topology()),
            consume.clone(),
            publish.clone(),
            Op::SettleFailed(1),
            Op::Close,
            Op::Connected,
            Op::DeclareTopology(topology()),
            consume,
            publish,
            Op::Ack(2),
            Op::Close,
        ]
    );
}

#[tokio::test]
async fn reconnects_after_a_failed_reject() {
    let server = MockServer::start_async().await;
    let broker = MemoryBroker::new(vec![
        Scripted::Deliver(b"{definitely not json".to_vec()),
        Scripted::Deliver(b"{definitely not json".to_vec()),
    ])
    .failing_settlements(1);

    run_until_drained(&broker, &server).await;

    let ops = broker.ops();
    assert!(broker.published().is_empty());
    assert_eq!(
        ops.iter()
            .filter(|op| matches!(op, Op::DeclareTopology(_)))
            .count(),
        2
    );
    let settled: Vec<&Op> = ops
        .iter()
        .filter(|op| matches!(op, Op::SettleFailed(_) | Op::Reject(_) | Op::Close))
        .collect();
    assert_eq!(
        settled,
        vec![&Op::SettleFailed(1), &Op::Close, &Op::Reject(2), &Op::Close]
    );
}

#[tokio::test]
async fn handle_delivery_reports_the_outcome() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(COMPLETIONS_PATH);
            then.status(200).json_body(completion(
                r#"{"main_category": "Consultoría y Negocios", "tags": ["strategy"]}"#,
            ));
        })
        .await;
    let broker = MemoryBroker::new(vec![]);
    let worker = worker(&broker, &server, Duration::from_millis(10)).await;
    let session = broker.connect().await.unwrap();

    let delivery = |tag: u64, body: &[u8]| Delivery {
        tag: DeliveryTag(tag),
        routing_key: "project.updated".to_owned(),
        redelivered: tag > 2,
        body: body.to_vec(),
    };

    assert_eq!(
        worker
            .handle_delivery(&session, delivery(1, &project_event()))
            .await
            .unwrap(),
        DeliveryOutcome::Published
    );
    assert_eq!(
        worker
            .handle_delivery(&session, delivery(2, br#"{"projectId": "p3"}"#))
            .await
            .unwrap(),
        DeliveryOutcome::Skipped
    );
    assert_eq!(
        worker
            .handle_delivery(&session, delivery(3, b"null"))
            .await
            .unwrap(),
        DeliveryOutcome::Rejected
    );

    assert_eq!(worker.state(), WorkerState::Disconnected);
    assert_eq!(
        broker.published()[0]["mainCategory"],
        json!("Consultoría y Negocios")
    );
}
