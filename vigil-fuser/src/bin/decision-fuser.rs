//! Decision-fuser binary.
//!
//! Consumes both verdict queues, derives enforcement actions and publishes
//! them (plus saved-action audit records) back to the broker.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser as _;
use eyre::Context as _;
use vigil_broker::amqp::{AmqpBroker, AmqpConfig};
use vigil_common::Environment;
use vigil_common::profile::ConfigProfile;
use vigil_fuser::{DecisionFuser, config::FuserConfig};
use vigil_storage::ObjectStoreService;
use vigil_storage::s3::S3ObjectStore;

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    vigil_common::observability::init_tracing()?;
    vigil_fuser::metrics::describe_metrics();

    let config = FuserConfig::parse();
    tracing::info!("starting decision fuser with config: {config:#?}");

    let profile = ConfigProfile::load(config.profile_path.as_deref(), config.profile.as_deref())
        .context("while loading deployment profile")?;

    tracing::info!("init object store..");
    let aws_config = match config.environment {
        Environment::Prod => aws_config::load_from_env().await,
        Environment::Dev => {
            vigil_storage::s3::dev_sdk_config(config.environment, &config.storage_endpoint).await
        }
    };
    let force_path_style = matches!(config.environment, Environment::Dev);
    let store: ObjectStoreService = Arc::new(
        S3ObjectStore::init(&aws_config, &profile.storage, force_path_style)
            .await
            .context("while initializing object store")?,
    );

    tracing::info!("init broker..");
    let broker = Arc::new(
        AmqpBroker::connect(AmqpConfig {
            uri: config.amqp_uri.clone(),
            max_retries: config.amqp_max_retries,
            retry_delay: config.amqp_retry_delay,
            prefetch_count: 1,
        })
        .await
        .context("while connecting to broker")?,
    );

    let fuser = DecisionFuser::new(broker, store);
    fuser
        .declare_topology()
        .await
        .context("while declaring broker topology")?;

    let (cancellation_token, is_graceful_shutdown) =
        vigil_common::shutdown::spawn_shutdown_task(vigil_common::shutdown::default_shutdown_signal());

    let consumers = tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            let _drop_guard = cancellation_token.clone().drop_guard();
            if let Err(err) = fuser.run(cancellation_token).await {
                tracing::error!("decision fuser failed: {err:?}");
            }
        }
    });

    tracing::info!("decision fuser started - waiting for shutdown...");
    cancellation_token.cancelled().await;

    let max_wait = config.max_wait_time_shutdown;
    tracing::info!("waiting for shutdown of services (max wait time {max_wait:?})..");
    match tokio::time::timeout(max_wait, consumers).await {
        Ok(_) => tracing::info!("successfully finished shutdown in time"),
        Err(_) => {
            is_graceful_shutdown.store(false, Ordering::Relaxed);
            tracing::warn!("could not finish shutdown in time")
        }
    }

    tracing::info!("good night!");
    if is_graceful_shutdown.load(Ordering::Relaxed) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
