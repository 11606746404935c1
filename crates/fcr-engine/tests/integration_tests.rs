//! End-to-end scenarios: embedded SQLite broker → consumer → manager →
//! pool → HttpMediator → wiremock target, asserting the final broker state.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sqlx::Row;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fcr_broker::sqlite::SqliteBroker;
use fcr_broker::{QueueBroker, QueuePublisher};
use fcr_common::PoolConfig;
use fcr_engine::{
    spawn_visibility_extender, ConsumerConfig, HttpMediator, ManagerHandle, Mediator,
    QueueConsumer, RouterManager, VisibilityConfig,
};

struct Harness {
    manager: ManagerHandle,
    broker: Arc<SqliteBroker>,
    db: sqlx::Pool<sqlx::Sqlite>,
    shutdown: broadcast::Sender<()>,
}

impl Harness {
    async fn new(visibility_timeout_seconds: u32) -> Self {
        let db = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let broker = Arc::new(SqliteBroker::new(
            db.clone(),
            "e2e-queue",
            visibility_timeout_seconds,
        ));
        broker.init_schema().await.unwrap();

        let manager = RouterManager::spawn(Arc::new(|_cfg: &PoolConfig| {
            Arc::new(HttpMediator::new()) as Arc<dyn Mediator>
        }));
        let (shutdown, _) = broadcast::channel(1);

        Self {
            manager,
            broker,
            db,
            shutdown,
        }
    }

    async fn deploy(&self, code: &str, concurrency: u32) {
        self.manager
            .deploy_pool(PoolConfig {
                code: code.to_string(),
                concurrency,
                rate_limit_per_minute: None,
                isolate_default_group: false,
            })
            .await
            .unwrap();
    }

    /// Publish a pointer body; returns the broker message id.
    async fn publish(&self, id: &str, pool: &str, target: &str, group: Option<&str>) -> String {
        let body = serde_json::json!({
            "id": id,
            "poolCode": pool,
            "mediationType": "HTTP",
            "mediationTarget": target,
            "messageGroupId": group,
        })
        .to_string();
        self.broker.publish(&body, group).await.unwrap()
    }

    fn start_consumer(&self) -> tokio::task::JoinHandle<()> {
        let consumer = QueueConsumer::with_config(
            self.broker.clone() as Arc<dyn QueueBroker>,
            self.manager.clone(),
            ConsumerConfig {
                wait: Duration::from_millis(200),
                ..Default::default()
            },
        );
        consumer.spawn(&self.shutdown)
    }

    async fn remaining(&self) -> i64 {
        sqlx::query("SELECT COUNT(*) AS count FROM broker_messages")
            .fetch_one(&self.db)
            .await
            .unwrap()
            .get("count")
    }

    async fn exists(&self, broker_message_id: &str) -> bool {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM broker_messages WHERE message_id = ?")
            .bind(broker_message_id)
            .fetch_one(&self.db)
            .await
            .unwrap()
            .get("count");
        count > 0
    }

    /// Seconds until the message becomes visible again, if it was nacked
    /// (receipt cleared, hidden in the future).
    async fn nack_delay(&self, broker_message_id: &str) -> Option<i64> {
        let row = sqlx::query(
            "SELECT visible_at, receipt_handle FROM broker_messages WHERE message_id = ?",
        )
        .bind(broker_message_id)
        .fetch_optional(&self.db)
        .await
        .unwrap()?;

        let handle: Option<String> = row.get("receipt_handle");
        if handle.is_some() {
            return None;
        }
        let visible_at: i64 = row.get("visible_at");
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let delay = visible_at - now;
        (delay > 0).then_some(delay)
    }

    async fn wait_remaining(&self, expected: i64, what: &str) {
        let started = Instant::now();
        while self.remaining().await != expected {
            if started.elapsed() > WAIT_DEADLINE {
                panic!("timed out waiting for: {what}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_all_nacked(&self, broker_message_ids: &[&str], what: &str) {
        let started = Instant::now();
        'outer: loop {
            for id in broker_message_ids {
                if self.nack_delay(id).await.is_none() {
                    if started.elapsed() > WAIT_DEADLINE {
                        panic!("timed out waiting for: {what}");
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue 'outer;
                }
            }
            return;
        }
    }

    async fn wait_gone(&self, broker_message_id: &str, what: &str) {
        let started = Instant::now();
        while self.exists(broker_message_id).await {
            if started.elapsed() > WAIT_DEADLINE {
                panic!("timed out waiting for: {what}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

const WAIT_DEADLINE: Duration = Duration::from_secs(8);

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

/// Happy path: one pointer through the full pipeline, one ack, no nacks.
#[tokio::test]
async fn happy_path_single_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(120).await;
    h.deploy("P", 2).await;
    h.publish("A", "P", &format!("{}/ok", server.uri()), None).await;
    let _consumer = h.start_consumer();

    h.wait_remaining(0, "A acked").await;
    assert_eq!(h.manager.in_flight_count().await.unwrap(), 0);
}

/// A 500 on the first message of a batch+group nacks the whole group run
/// without further target calls.
#[tokio::test]
async fn cascade_within_batch_group() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(120).await;
    h.deploy("P", 1).await;
    let target = format!("{}/hook", server.uri());
    let a = h.publish("A", "P", &target, Some("g")).await;
    let b = h.publish("B", "P", &target, Some("g")).await;
    let c = h.publish("C", "P", &target, Some("g")).await;
    let _consumer = h.start_consumer();

    h.wait_all_nacked(&[&a, &b, &c], "all three nacked").await;

    for id in [&a, &b, &c] {
        let delay = h.nack_delay(id).await.unwrap();
        assert!((5..=10).contains(&delay), "unexpected nack delay {delay}");
    }
    assert_eq!(request_count(&server).await, 1);
}

/// Two groups, pool concurrency two: wall time beats the 800 ms a serial
/// run of four 200 ms calls would need, and each group stays ordered.
#[tokio::test]
async fn groups_dispatch_in_parallel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(4)
        .mount(&server)
        .await;

    let h = Harness::new(120).await;
    h.deploy("P", 2).await;
    let target = format!("{}/slow", server.uri());
    h.publish("g1-a", "P", &target, Some("g1")).await;
    h.publish("g1-b", "P", &target, Some("g1")).await;
    h.publish("g2-a", "P", &target, Some("g2")).await;
    h.publish("g2-b", "P", &target, Some("g2")).await;

    let started = Instant::now();
    let _consumer = h.start_consumer();

    h.wait_remaining(0, "all acked").await;
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(800),
        "expected parallel groups, took {elapsed:?}"
    );

    let order: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["messageId"].as_str().unwrap().to_string()
        })
        .collect();
    let position = |id: &str| order.iter().position(|o| o == id).unwrap();
    assert!(position("g1-a") < position("g1-b"), "g1 out of order: {order:?}");
    assert!(position("g2-a") < position("g2-b"), "g2 out of order: {order:?}");
}

/// 429 with Retry-After: the rejected message is nacked with the header's
/// delay and the rest of its batch+group cascades.
#[tokio::test]
async fn rate_limited_target_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/limited"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "45"))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(120).await;
    h.deploy("P", 1).await;
    let target = format!("{}/limited", server.uri());
    let a = h.publish("A", "P", &target, Some("g")).await;
    let b = h.publish("B", "P", &target, Some("g")).await;
    let _consumer = h.start_consumer();

    h.wait_all_nacked(&[&a, &b], "both nacked").await;

    let delay_a = h.nack_delay(&a).await.unwrap();
    assert!((40..=45).contains(&delay_a), "Retry-After not honored: {delay_a}");
    let delay_b = h.nack_delay(&b).await.unwrap();
    assert!((5..=10).contains(&delay_b), "cascade delay wrong: {delay_b}");
    assert_eq!(request_count(&server).await, 1);
}

/// A pointer for an undeployed pool is nacked with a ten-second delay and
/// never tracked.
#[tokio::test]
async fn unknown_pool_is_nacked() {
    let h = Harness::new(120).await;
    h.deploy("P", 1).await;
    let z = h.publish("zzz", "Z", "http://localhost:9/unused", None).await;
    let _consumer = h.start_consumer();

    h.wait_all_nacked(&[&z], "unknown-pool nack").await;

    let delay = h.nack_delay(&z).await.unwrap();
    assert!((7..=10).contains(&delay), "unexpected delay {delay}");
    assert_eq!(h.manager.in_flight_count().await.unwrap(), 0);
    assert!(h.exists(&z).await);
}

/// Undeploy while a dispatch is running: the in-flight message finishes
/// naturally, the queued one bounces, and a re-added pool accepts new work.
#[tokio::test]
async fn reconfigure_mid_flight() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = Harness::new(120).await;
    h.deploy("P", 1).await;
    let slow = format!("{}/slow", server.uri());
    let m1 = h.publish("M1", "P", &slow, Some("g")).await;
    let m2 = h.publish("M2", "P", &slow, Some("g")).await;
    let _consumer = h.start_consumer();

    // M1 is mid-dispatch, M2 queued behind it.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.manager.undeploy_pool("P").await.unwrap());

    h.wait_gone(&m1, "M1 finished naturally").await;
    h.wait_all_nacked(&[&m2], "M2 bounced").await;
    let delay = h.nack_delay(&m2).await.unwrap();
    assert!((3..=5).contains(&delay), "drain delay wrong: {delay}");

    // Re-adding the pool accepts new messages.
    h.deploy("P", 1).await;
    let m3 = h.publish("M3", "P", &format!("{}/ok", server.uri()), Some("g2")).await;
    h.wait_gone(&m3, "M3 accepted by re-added pool").await;
}

/// Redelivery of an in-flight message (short visibility budget) is absorbed
/// by dedup and the refreshed receipt still acks cleanly: one target call,
/// one terminal broker operation.
#[tokio::test]
async fn redelivery_of_in_flight_message_is_deduplicated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1500)))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(1).await;
    h.deploy("P", 1).await;
    h.publish("A", "P", &format!("{}/slow", server.uri()), None).await;
    let _consumer = h.start_consumer();

    h.wait_remaining(0, "A acked").await;
    assert_eq!(request_count(&server).await, 1);
}

/// With the extender running, a dispatch that outlives the visibility
/// budget is never redelivered at all.
#[tokio::test]
async fn visibility_extension_prevents_redelivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1500)))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(1).await;
    spawn_visibility_extender(
        h.manager.clone(),
        &h.shutdown,
        VisibilityConfig {
            interval: Duration::from_millis(300),
            extend_to_seconds: 60,
        },
    );
    h.deploy("P", 1).await;
    h.publish("A", "P", &format!("{}/slow", server.uri()), None).await;
    let _consumer = h.start_consumer();

    h.wait_remaining(0, "A acked").await;
    assert_eq!(request_count(&server).await, 1);
}

/// A body that is not a pointer is nacked without delay and does not block
/// the rest of the batch.
#[tokio::test]
async fn malformed_body_does_not_block_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = Harness::new(120).await;
    h.deploy("P", 2).await;
    let garbage = h.broker.publish("definitely not json", None).await.unwrap();
    let a = h.publish("A", "P", &format!("{}/ok", server.uri()), None).await;
    let _consumer = h.start_consumer();

    h.wait_gone(&a, "A acked").await;
    assert!(h.exists(&garbage).await, "malformed body left for redelivery");

    let _ = h.shutdown.send(());
}
