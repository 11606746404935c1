//! FlowCatalyst message router server.
//!
//! Wires the engine together: a manager actor, a broker factory covering the
//! embedded SQLite queue and SQS, the config syncer (when a config URL is
//! set), the visibility extender, and signal-driven shutdown. Without a
//! config URL the server runs in embedded mode with one default pool and one
//! local queue.

mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::signal;
use tracing::info;

use fcr_broker::{sqlite::SqliteBroker, sqs::SqsBroker, QueueBroker};
use fcr_common::{PoolConfig, QueueDefinition};
use fcr_engine::{
    spawn_config_sync_task, spawn_visibility_extender, BrokerFactory, ConfigSyncer, ConsumerConfig,
    EngineError, HttpMediator, HttpMediatorConfig, ManagerHandle, QueueConsumer, RouterManager,
    ShutdownCoordinator, SyncConfig, VisibilityConfig,
};

use settings::Settings;

/// Pool used in embedded mode when no config service is configured.
const EMBEDDED_POOL: &str = "DEFAULT";
const EMBEDDED_QUEUE: &str = "fcr-default";

/// Backend selector carried in a queue definition's `brokerDescriptor`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BrokerDescriptor {
    Sqs {
        #[serde(rename = "queueUrl")]
        queue_url: String,
    },
    Sqlite {
        #[serde(default)]
        queue: Option<String>,
    },
}

struct ServerBrokerFactory {
    sqlite_pool: sqlx::Pool<sqlx::Sqlite>,
    visibility_timeout_seconds: u32,
    sqs_client: aws_sdk_sqs::Client,
}

#[async_trait]
impl BrokerFactory for ServerBrokerFactory {
    async fn create(
        &self,
        definition: &QueueDefinition,
    ) -> fcr_engine::Result<Arc<dyn QueueBroker>> {
        let descriptor: BrokerDescriptor =
            serde_json::from_value(definition.broker_descriptor.clone()).map_err(|e| {
                EngineError::Config(format!(
                    "queue [{}] has an invalid broker descriptor: {}",
                    definition.identifier, e
                ))
            })?;

        match descriptor {
            BrokerDescriptor::Sqs { queue_url } => {
                Ok(Arc::new(SqsBroker::new(self.sqs_client.clone(), queue_url)))
            }
            BrokerDescriptor::Sqlite { queue } => {
                let broker = SqliteBroker::new(
                    self.sqlite_pool.clone(),
                    queue.unwrap_or_else(|| definition.identifier.clone()),
                    self.visibility_timeout_seconds,
                );
                broker.init_schema().await.map_err(EngineError::Broker)?;
                Ok(Arc::new(broker))
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fcr_common::logging::init_logging();

    let settings = Settings::load()?;
    info!(
        sync_enabled = settings.sync.enabled(),
        embedded_database = %settings.embedded.database,
        "starting FlowCatalyst message router"
    );

    let manager = spawn_manager(&settings);

    let sqlite_pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect(&format!("sqlite:{}?mode=rwc", settings.embedded.database))
        .await
        .context("opening embedded queue database")?;

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let factory = Arc::new(ServerBrokerFactory {
        sqlite_pool,
        visibility_timeout_seconds: settings.embedded.visibility_timeout_seconds,
        sqs_client: aws_sdk_sqs::Client::new(&aws_config),
    });

    let mut coordinator = ShutdownCoordinator::new(manager.clone());
    let shutdown_tx = coordinator.shutdown_signal();

    spawn_visibility_extender(manager.clone(), &shutdown_tx, VisibilityConfig::default());

    if settings.sync.enabled() {
        let sync_config = SyncConfig::new(settings.sync.config_url.clone())
            .with_interval(settings.sync.interval());
        let syncer = Arc::new(ConfigSyncer::new(sync_config, manager.clone(), factory.clone()));

        syncer
            .initial_sync()
            .await
            .context("initial configuration sync failed")?;
        spawn_config_sync_task(syncer.clone(), &shutdown_tx);
        coordinator = coordinator.with_syncer(syncer);
    } else {
        info!(
            pool = EMBEDDED_POOL,
            queue = EMBEDDED_QUEUE,
            "no config URL set, running in embedded mode"
        );
        let handle = deploy_embedded(&manager, factory.as_ref(), &shutdown_tx).await?;
        coordinator.register_consumer(handle);
    }

    wait_for_signal().await;
    coordinator.shutdown().await;
    Ok(())
}

fn spawn_manager(settings: &Settings) -> ManagerHandle {
    let mediator_config = HttpMediatorConfig {
        timeout: Duration::from_secs(settings.mediator.timeout_seconds),
        connect_timeout: Duration::from_secs(settings.mediator.connect_timeout_seconds),
        ..Default::default()
    };

    RouterManager::spawn(Arc::new(move |pool: &PoolConfig| {
        info!(pool_code = %pool.code, "building mediator");
        Arc::new(HttpMediator::with_config(mediator_config.clone())) as Arc<dyn fcr_engine::Mediator>
    }))
}

async fn deploy_embedded(
    manager: &ManagerHandle,
    factory: &ServerBrokerFactory,
    shutdown_tx: &tokio::sync::broadcast::Sender<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    manager
        .deploy_pool(PoolConfig {
            code: EMBEDDED_POOL.to_string(),
            concurrency: 20,
            rate_limit_per_minute: None,
            isolate_default_group: false,
        })
        .await?;

    let definition = QueueDefinition {
        identifier: EMBEDDED_QUEUE.to_string(),
        broker_descriptor: serde_json::json!({ "type": "sqlite" }),
    };
    let broker = factory.create(&definition).await?;

    let consumer = QueueConsumer::with_config(broker, manager.clone(), ConsumerConfig::default());
    Ok(consumer.spawn(shutdown_tx))
}

async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received ctrl-c"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received ctrl-c");
    }
}
