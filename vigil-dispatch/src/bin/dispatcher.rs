//! Dispatcher binary.
//!
//! Consumes `clients_data` and fans envelopes out to the pipeline queues of
//! the active profile, round-robin.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser as _;
use eyre::Context as _;
use vigil_broker::amqp::{AmqpBroker, AmqpConfig};
use vigil_common::profile::ConfigProfile;
use vigil_dispatch::{Dispatcher, config::DispatcherConfig};

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    vigil_common::observability::init_tracing()?;
    vigil_dispatch::metrics::describe_metrics();

    let config = DispatcherConfig::parse();
    tracing::info!("starting dispatcher with config: {config:#?}");

    let profile = ConfigProfile::load(config.profile_path.as_deref(), config.profile.as_deref())
        .context("while loading deployment profile")?;
    tracing::info!(
        "profile '{}': {} pipeline(s), {} clients max per pipeline",
        profile.name,
        profile.pipeline.total_pipelines,
        profile.pipeline.max_clients_per_pipeline
    );

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

    let dispatcher = Dispatcher::new(
        broker,
        profile.pipeline.total_pipelines,
        profile.pipeline.max_clients_per_pipeline,
    );
    dispatcher
        .declare_topology()
        .await
        .context("while declaring broker topology")?;

    let (cancellation_token, is_graceful_shutdown) =
        vigil_common::shutdown::spawn_shutdown_task(vigil_common::shutdown::default_shutdown_signal());

    let consumer = tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            let _drop_guard = cancellation_token.clone().drop_guard();
            if let Err(err) = dispatcher.run(cancellation_token).await {
                tracing::error!("dispatcher consumer failed: {err:?}");
            }
        }
    });

    tracing::info!("dispatcher started - waiting for shutdown...");
    cancellation_token.cancelled().await;

    let max_wait = config.max_wait_time_shutdown;
    tracing::info!("waiting for shutdown of services (max wait time {max_wait:?})..");
    match tokio::time::timeout(max_wait, consumer).await {
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
