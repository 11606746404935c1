//! Ordering tests: strict FIFO within a message group, parallelism across
//! groups, the pool concurrency bound, and default-group behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use fcr_broker::{QueueBroker, Result as BrokerResult};
use fcr_common::{BrokerReceipt, MediationType, MessagePointer, PoolConfig, Verdict, DEFAULT_GROUP};
use fcr_engine::{BatchEntry, ManagerHandle, Mediator, PoolDispatcher, RouterManager};

#[derive(Default)]
struct RecordingBroker {
    acked: Mutex<Vec<String>>,
}

impl RecordingBroker {
    fn acked_count(&self) -> usize {
        self.acked.lock().len()
    }
}

#[async_trait]
impl QueueBroker for RecordingBroker {
    fn identifier(&self) -> &str {
        "test-queue"
    }

    async fn poll(&self, _max: u32, _wait: Duration) -> BrokerResult<Vec<(BrokerReceipt, String)>> {
        Ok(Vec::new())
    }

    async fn ack(&self, receipt: &BrokerReceipt) -> BrokerResult<()> {
        self.acked.lock().push(receipt.message_id.clone());
        Ok(())
    }

    async fn nack(&self, _receipt: &BrokerReceipt, _delay_seconds: u32) -> BrokerResult<()> {
        Ok(())
    }

    async fn extend_visibility(&self, _receipt: &BrokerReceipt, _seconds: u32) -> BrokerResult<()> {
        Ok(())
    }
}

/// Delivers everything; records call order and the concurrency high-water
/// mark.
struct TracingMediator {
    delay: Duration,
    calls: Mutex<Vec<String>>,
    current: AtomicU32,
    max_concurrent: AtomicU32,
}

impl TracingMediator {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Mutex::new(Vec::new()),
            current: AtomicU32::new(0),
            max_concurrent: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn max_concurrent(&self) -> u32 {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mediator for TracingMediator {
    async fn dispatch(&self, pointer: &MessagePointer) -> Verdict {
        self.calls.lock().push(pointer.id.clone());

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
        Verdict::Delivered
    }
}

fn pointer(id: &str, group: Option<&str>) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: "P".to_string(),
        auth_token: None,
        mediation_type: MediationType::HTTP,
        mediation_target: "http://localhost:9/unused".to_string(),
        message_group_id: group.map(|g| g.to_string()),
    }
}

fn entry(p: MessagePointer) -> BatchEntry {
    let receipt = BrokerReceipt {
        queue: "test-queue".to_string(),
        message_id: format!("broker-{}", p.id),
        receipt_handle: format!("rh-{}", p.id),
    };
    BatchEntry {
        pointer: p,
        receipt,
    }
}

fn spawn_manager(mediator: Arc<TracingMediator>) -> ManagerHandle {
    RouterManager::spawn(Arc::new(move |_cfg: &PoolConfig| {
        mediator.clone() as Arc<dyn Mediator>
    }))
}

async fn deploy(manager: &ManagerHandle, concurrency: u32, isolate_default_group: bool) {
    manager
        .deploy_pool(PoolConfig {
            code: "P".to_string(),
            concurrency,
            rate_limit_per_minute: None,
            isolate_default_group,
        })
        .await
        .unwrap();
}

async fn wait_for_acks(broker: &RecordingBroker, expected: usize) {
    let started = Instant::now();
    while broker.acked_count() < expected {
        if started.elapsed() > Duration::from_secs(10) {
            panic!("timed out waiting for {expected} acks, got {}", broker.acked_count());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn positions(calls: &[String], ids: &[&str]) -> Vec<usize> {
    ids.iter()
        .map(|id| calls.iter().position(|c| c == id).expect("id dispatched"))
        .collect()
}

#[tokio::test]
async fn same_group_is_strictly_ordered() {
    let mediator = Arc::new(TracingMediator::new(Duration::from_millis(30)));
    let manager = spawn_manager(mediator.clone());
    let broker = Arc::new(RecordingBroker::default());

    // Concurrency well above one: ordering must come from the group worker,
    // not from the pool being narrow.
    deploy(&manager, 4, false).await;

    let entries: Vec<BatchEntry> = (0..5)
        .map(|i| entry(pointer(&format!("m{i}"), Some("g"))))
        .collect();
    manager
        .submit_batch(Arc::from("batch-1"), entries, broker.clone())
        .await
        .unwrap();

    wait_for_acks(&broker, 5).await;
    assert_eq!(mediator.calls(), vec!["m0", "m1", "m2", "m3", "m4"]);
}

#[tokio::test]
async fn order_is_preserved_across_batches() {
    let mediator = Arc::new(TracingMediator::new(Duration::from_millis(30)));
    let manager = spawn_manager(mediator.clone());
    let broker = Arc::new(RecordingBroker::default());

    deploy(&manager, 4, false).await;

    manager
        .submit_batch(
            Arc::from("batch-1"),
            vec![entry(pointer("m0", Some("g"))), entry(pointer("m1", Some("g")))],
            broker.clone(),
        )
        .await
        .unwrap();
    manager
        .submit_batch(
            Arc::from("batch-2"),
            vec![entry(pointer("m2", Some("g"))), entry(pointer("m3", Some("g")))],
            broker.clone(),
        )
        .await
        .unwrap();

    wait_for_acks(&broker, 4).await;
    assert_eq!(mediator.calls(), vec!["m0", "m1", "m2", "m3"]);
}

/// Two groups of two messages each against a 200 ms target and a pool of
/// two: groups run side by side, so total wall time stays under the 800 ms a
/// serial run would need, while order inside each group holds.
#[tokio::test]
async fn groups_run_in_parallel() {
    let mediator = Arc::new(TracingMediator::new(Duration::from_millis(200)));
    let manager = spawn_manager(mediator.clone());
    let broker = Arc::new(RecordingBroker::default());

    deploy(&manager, 2, false).await;

    let started = Instant::now();
    manager
        .submit_batch(
            Arc::from("batch-1"),
            vec![
                entry(pointer("g1-a", Some("g1"))),
                entry(pointer("g1-b", Some("g1"))),
                entry(pointer("g2-a", Some("g2"))),
                entry(pointer("g2-b", Some("g2"))),
            ],
            broker.clone(),
        )
        .await
        .unwrap();

    wait_for_acks(&broker, 4).await;
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(800),
        "expected parallel groups, took {elapsed:?}"
    );

    let calls = mediator.calls();
    let g1 = positions(&calls, &["g1-a", "g1-b"]);
    let g2 = positions(&calls, &["g2-a", "g2-b"]);
    assert!(g1[0] < g1[1], "g1 out of order: {calls:?}");
    assert!(g2[0] < g2[1], "g2 out of order: {calls:?}");
}

#[tokio::test]
async fn concurrency_cap_is_respected() {
    let mediator = Arc::new(TracingMediator::new(Duration::from_millis(100)));
    let manager = spawn_manager(mediator.clone());
    let broker = Arc::new(RecordingBroker::default());

    deploy(&manager, 2, false).await;

    let entries: Vec<BatchEntry> = (0..6)
        .map(|i| entry(pointer(&format!("m{i}"), Some(&format!("g{i}")))))
        .collect();
    manager
        .submit_batch(Arc::from("batch-1"), entries, broker.clone())
        .await
        .unwrap();

    wait_for_acks(&broker, 6).await;
    assert!(
        mediator.max_concurrent() <= 2,
        "pool bound exceeded: {}",
        mediator.max_concurrent()
    );
}

#[tokio::test]
async fn ungrouped_messages_share_the_default_worker() {
    let mediator = Arc::new(TracingMediator::new(Duration::from_millis(50)));
    let manager = spawn_manager(mediator.clone());
    let broker = Arc::new(RecordingBroker::default());

    deploy(&manager, 5, false).await;

    let entries: Vec<BatchEntry> = (0..3)
        .map(|i| entry(pointer(&format!("m{i}"), None)))
        .collect();
    manager
        .submit_batch(Arc::from("batch-1"), entries, broker.clone())
        .await
        .unwrap();

    wait_for_acks(&broker, 3).await;
    assert_eq!(mediator.max_concurrent(), 1);
    assert_eq!(mediator.calls(), vec!["m0", "m1", "m2"]);
}

/// The dispatch group is the key for all same-group bookkeeping, including
/// the manager's batch bounce scoping: isolated ungrouped pointers must get
/// distinct groups, shared ones collapse to the default group, and an
/// explicit group id always wins.
#[tokio::test]
async fn group_assignment_honors_default_group_isolation() {
    let mediator = Arc::new(TracingMediator::new(Duration::ZERO));
    let manager = spawn_manager(mediator.clone());

    let config = |isolate: bool| PoolConfig {
        code: "P".to_string(),
        concurrency: 2,
        rate_limit_per_minute: None,
        isolate_default_group: isolate,
    };
    let isolated = PoolDispatcher::new(
        config(true),
        mediator.clone() as Arc<dyn Mediator>,
        manager.clone(),
    );
    let shared = PoolDispatcher::new(config(false), mediator.clone() as Arc<dyn Mediator>, manager);

    let first = pointer("m0", None);
    let second = pointer("m1", None);
    let grouped = pointer("m2", Some("g"));

    assert_ne!(isolated.group_for(&first), isolated.group_for(&second));
    assert_eq!(isolated.group_for(&first).as_ref(), "m0");
    assert_eq!(isolated.group_for(&grouped).as_ref(), "g");

    assert_eq!(shared.group_for(&first), shared.group_for(&second));
    assert_eq!(shared.group_for(&first).as_ref(), DEFAULT_GROUP);
    assert_eq!(shared.group_for(&grouped).as_ref(), "g");
}

#[tokio::test]
async fn isolated_default_group_runs_ungrouped_in_parallel() {
    let mediator = Arc::new(TracingMediator::new(Duration::from_millis(200)));
    let manager = spawn_manager(mediator.clone());
    let broker = Arc::new(RecordingBroker::default());

    deploy(&manager, 5, true).await;

    let entries: Vec<BatchEntry> = (0..3)
        .map(|i| entry(pointer(&format!("m{i}"), None)))
        .collect();
    manager
        .submit_batch(Arc::from("batch-1"), entries, broker.clone())
        .await
        .unwrap();

    wait_for_acks(&broker, 3).await;
    assert!(
        mediator.max_concurrent() >= 2,
        "expected ungrouped parallelism, peak was {}",
        mediator.max_concurrent()
    );
}
