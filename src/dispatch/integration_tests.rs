#![cfg(test)]

//! End-to-end pipeline tests: submitter -> bus -> dispatcher -> pool ->
//! metadata store, with a scripted mock interpreter standing in for the
//! cluster.
//!
//! The mock understands one command per line:
//! - `raise <msg>`: exit 1 with `<msg>` on stderr
//! - `sleep <ms>`: wait
//! - `report <train> <validation>`: report results for the current run
//!
//! Anything else is ignored, so rendered Python passes through untouched.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::blob::{BlobStore, ObjectBlobStore};
use crate::bus::{MemoryBus, MessageBus, MessageKind};
use crate::cluster::{ExecutionOutcome, ScriptJob, WorkerLauncher};
use crate::config::ClusterSettings;
use crate::db::{create_connection, ensure_schema, DatabaseConfig, RunRecord, RunResult};
use crate::report::ResultReporter;
use crate::submit::{ScriptSource, Submitter};
use crate::types::{RunId, ScriptId};

const CHANNEL: &str = "train-jobs";

struct MockInterpreter {
    reporter: ResultReporter,
    executed: Mutex<Vec<(RunId, String)>>,
}

impl MockInterpreter {
    fn executed(&self) -> Vec<(RunId, String)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerLauncher for MockInterpreter {
    async fn provision(&self, _spec: &ClusterSettings) -> Result<String> {
        Ok("mock://pool".to_string())
    }

    async fn run(&self, _spec: &ClusterSettings, job: &ScriptJob) -> Result<ExecutionOutcome> {
        self.executed
            .lock()
            .unwrap()
            .push((job.run_id.clone(), job.body.clone()));

        let started_at = chrono::Utc::now();
        let run_id = job
            .env
            .iter()
            .find(|(k, _)| k == RUN_ID_ENV)
            .map(|(_, v)| RunId::new(v.as_str()))
            .expect("run id passed to the script");

        let mut exit_code = 0;
        let mut stderr = String::new();
        for line in job.body.lines() {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("raise") => {
                    exit_code = 1;
                    stderr = words.collect::<Vec<_>>().join(" ");
                    break;
                }
                Some("sleep") => {
                    let ms = words.next().and_then(|w| w.parse().ok()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                Some("report") => {
                    let mut score = || words.next().and_then(|w| w.parse::<f64>().ok());
                    let result = RunResult {
                        train_score: score(),
                        validation_score: score(),
                        train_config: Some(json!({"source": "mock"})),
                        ..Default::default()
                    };
                    self.reporter.report(&run_id, result).await?;
                }
                _ => {}
            }
        }

        Ok(ExecutionOutcome {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr,
            started_at,
            finished_at: chrono::Utc::now(),
        })
    }

    async fn release(&self, _spec: &ClusterSettings) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    store: MetadataStore,
    bus: Arc<MemoryBus>,
    pool: Arc<ResourcePool>,
    dispatcher: Arc<Dispatcher>,
    interpreter: Arc<MockInterpreter>,
    submitter: Submitter,
    shutdown: CancellationToken,
    messages: Mutex<Option<BoxStream<'static, BusMessage>>>,
    consumer: Option<JoinHandle<()>>,
}

impl Harness {
    /// Build every component. The subscription is open but nothing
    /// consumes it until [`Harness::start`].
    async fn new(max_workers: usize) -> Self {
        let db = create_connection(DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        ensure_schema(&db).await.unwrap();
        let store = MetadataStore::new(db);
        let blobs: Arc<dyn BlobStore> = Arc::new(ObjectBlobStore::in_memory("test"));
        let bus = Arc::new(MemoryBus::new());

        let interpreter = Arc::new(MockInterpreter {
            reporter: ResultReporter::new(store.clone(), blobs.clone()),
            executed: Mutex::new(Vec::new()),
        });
        let spec = ClusterSettings {
            max_workers,
            ..Default::default()
        };
        let pool = Arc::new(ResourcePool::acquire(spec, interpreter.clone()).await.unwrap());

        let ctx = Arc::new(GraphContext::new(store.clone(), blobs.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            pool.clone(),
            ctx,
            Duration::from_millis(20),
        ));

        let messages = bus.subscribe(CHANNEL).await.unwrap();
        let submitter = Submitter::new(store.clone(), blobs, bus.clone(), CHANNEL);

        Self {
            store,
            bus,
            pool,
            dispatcher,
            interpreter,
            submitter,
            shutdown: CancellationToken::new(),
            messages: Mutex::new(Some(messages)),
            consumer: None,
        }
    }

    async fn started(max_workers: usize) -> Self {
        let mut harness = Self::new(max_workers).await;
        harness.start();
        harness
    }

    fn start(&mut self) {
        let messages = self.messages.lock().unwrap().take().expect("started once");
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        self.consumer = Some(tokio::spawn(async move {
            dispatcher.run(messages, shutdown).await
        }));
    }

    async fn submit(&self, body: &str, job_config: Value) -> RunId {
        self.submitter
            .submit(
                ScriptSource::Upload {
                    file_name: "train.py".to_string(),
                    body: body.as_bytes().to_vec(),
                },
                job_config,
                json!({}),
            )
            .await
            .unwrap()
    }

    async fn wait_for(&self, run_id: &RunId, done: impl Fn(&RunRecord) -> bool) -> RunRecord {
        for _ in 0..250 {
            let run = self.store.get_run(run_id).await.unwrap().unwrap();
            if done(&run) {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {} did not reach the expected state", run_id);
    }

    async fn wait_terminal(&self, run_id: &RunId) -> RunRecord {
        self.wait_for(run_id, |run| run.status.is_terminal()).await
    }

    async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(consumer) = self.consumer.take() {
            consumer.await.unwrap();
        }
        self.dispatcher.drain(Duration::from_secs(5)).await;
        self.pool.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_submitted_job_is_queued_then_completes() {
    let mut harness = Harness::new(2).await;

    let run_id = harness.submit("print(\"ok\")", json!({"foo": 1})).await;
    assert!(uuid::Uuid::parse_str(run_id.as_str()).is_ok());
    let queued = harness.store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(queued.status, RunStatus::Queued);

    harness.start();
    let done = harness.wait_terminal(&run_id).await;
    assert_eq!(done.status, RunStatus::Completed);
    assert!(done.train_score.is_none());

    let executed = harness.interpreter.executed();
    assert_eq!(executed, vec![(run_id, "print(\"ok\")".to_string())]);

    harness.stop().await;
}

#[tokio::test]
async fn test_failing_script_marks_run_failed() {
    let harness = Harness::started(1).await;

    let run_id = harness.submit("raise ValueError boom", json!({})).await;
    let done = harness.wait_terminal(&run_id).await;
    assert_eq!(done.status, RunStatus::Failed);

    harness.stop().await;
}

#[tokio::test]
async fn test_malformed_payload_is_dropped_and_loop_survives() {
    let harness = Harness::started(1).await;

    let bystander = RunId::generate();
    harness
        .store
        .create_queued_run(&bystander, &ScriptId::new("s"))
        .await
        .unwrap();

    let missing_model = json!({
        "job_config": {"run_id": bystander.as_str(), "script_key": "s", "params": {}}
    });
    harness.bus.publish(CHANNEL, &missing_model.to_string()).await.unwrap();
    harness.bus.publish(CHANNEL, "not json at all").await.unwrap();

    let run_id = harness.submit("print(1)", json!({})).await;
    assert_eq!(harness.wait_terminal(&run_id).await.status, RunStatus::Completed);

    let untouched = harness.store.get_run(&bystander).await.unwrap().unwrap();
    assert_eq!(untouched.status, RunStatus::Queued);
    assert_eq!(harness.interpreter.executed().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_control_message_causes_no_dispatch() {
    let harness = Harness::new(1).await;

    let dispatched = harness
        .dispatcher
        .handle_message(BusMessage::control(MessageKind::Subscribe, CHANNEL))
        .unwrap();
    assert!(dispatched.is_none());
    assert_eq!(harness.dispatcher.in_flight(), 0);

    let err = harness
        .dispatcher
        .handle_message(BusMessage::payload(CHANNEL, b"{}".to_vec()))
        .unwrap_err();
    assert!(matches!(err, DispatchError::MalformedJob(_)));
    assert_eq!(harness.dispatcher.in_flight(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_concurrent_submissions_are_independent() {
    let harness = Arc::new(Harness::started(3).await);

    let mut submissions = Vec::new();
    for i in 0..12 {
        let harness = harness.clone();
        submissions.push(tokio::spawn(async move {
            let body = if i % 4 == 0 { "raise odd one out" } else { "sleep 10" };
            (i, harness.submit(body, json!({"index": i})).await)
        }));
    }

    let mut ids = HashSet::new();
    for submission in submissions {
        let (i, run_id) = submission.await.unwrap();
        let done = harness.wait_terminal(&run_id).await;
        let expected = if i % 4 == 0 { RunStatus::Failed } else { RunStatus::Completed };
        assert_eq!(done.status, expected);
        ids.insert(run_id);
    }
    assert_eq!(ids.len(), 12);
    assert_eq!(harness.interpreter.executed().len(), 12);

    let harness = Arc::try_unwrap(harness).ok().expect("no other owners");
    harness.stop().await;
}

#[tokio::test]
async fn test_script_reported_results_are_kept() {
    let harness = Harness::started(1).await;

    let run_id = harness.submit("report {{ train }} 0.75", json!({"train": 0.5})).await;
    let done = harness.wait_terminal(&run_id).await;

    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.train_score, Some(0.5));
    assert_eq!(done.validation_score, Some(0.75));
    assert_eq!(done.train_config.as_deref(), Some("{\"source\":\"mock\"}"));

    harness.stop().await;
}

#[tokio::test]
async fn test_rendering_uses_params_and_run_config() {
    let harness = Harness::started(1).await;

    let run_id = harness
        .submit("lr = {{ lr }}\nrun = '{{ run_config.run_id }}'", json!({"params": {"lr": 0.1}}))
        .await;
    harness.wait_terminal(&run_id).await;

    let (_, body) = harness.interpreter.executed().pop().unwrap();
    assert_eq!(body, format!("lr = 0.1\nrun = '{}'", run_id));

    harness.stop().await;
}

#[tokio::test]
async fn test_undefined_template_variable_fails_run() {
    let harness = Harness::started(1).await;

    let run_id = harness.submit("print({{ nope }})", json!({})).await;
    assert_eq!(harness.wait_terminal(&run_id).await.status, RunStatus::Failed);
    assert!(harness.interpreter.executed().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_conflicting_reserved_parameter_fails_run() {
    let harness = Harness::started(1).await;

    let script_run = harness.submit("print(1)", json!({})).await;
    let script_key = harness.wait_terminal(&script_run).await.script_key.unwrap();

    let run_id = RunId::generate();
    harness.store.create_queued_run(&run_id, &script_key).await.unwrap();
    let payload = json!({
        "job_config": {
            "run_id": run_id.as_str(),
            "script_key": script_key.as_str(),
            "params": {"run_config": "mine"}
        },
        "model_config": {}
    });
    harness.bus.publish(CHANNEL, &payload.to_string()).await.unwrap();

    assert_eq!(harness.wait_terminal(&run_id).await.status, RunStatus::Failed);

    harness.stop().await;
}

#[tokio::test]
async fn test_jobs_waiting_for_a_worker_stay_queued_on_close() {
    let harness = Harness::started(1).await;

    let running = harness.submit("sleep 60000", json!({})).await;
    harness
        .wait_for(&running, |run| run.status == RunStatus::Running)
        .await;

    let waiting = harness.submit("print(1)", json!({})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.pool.close().await.unwrap();
    assert_eq!(harness.wait_terminal(&running).await.status, RunStatus::Failed);

    harness.dispatcher.drain(Duration::from_secs(2)).await;
    let still_queued = harness.store.get_run(&waiting).await.unwrap().unwrap();
    assert_eq!(still_queued.status, RunStatus::Queued);

    harness.stop().await;
}

#[tokio::test]
async fn test_delete_unknown_run_is_not_found() {
    let harness = Harness::new(1).await;
    let err = harness.store.delete_run(&RunId::new("missing")).await.unwrap_err();
    assert!(err.is_not_found());
    harness.stop().await;
}
