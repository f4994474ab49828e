//! Pipeline-worker binary.
//!
//! Owns one pipeline id: consumes its two branch queues, runs the models
//! through the detection service and publishes verdicts.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser as _;
use eyre::Context as _;
use vigil_broker::amqp::{AmqpBroker, AmqpConfig};
use vigil_common::Environment;
use vigil_common::profile::ConfigProfile;
use vigil_common::users::UserDirectory;
use vigil_models::ModelSignature;
use vigil_models::embedding_cache::EmbeddingCache;
use vigil_models::http::{HttpModelConfig, HttpModelRunner};
use vigil_pipeline::{FaceBranch, PipelineWorker, config::PipelineWorkerConfig};
use vigil_storage::ObjectStoreService;
use vigil_storage::s3::S3ObjectStore;
use vigil_types::PipelineId;

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    vigil_common::observability::init_tracing()?;
    vigil_pipeline::metrics::describe_metrics();
    vigil_models::metrics::describe_metrics();

    let config = PipelineWorkerConfig::parse();
    tracing::info!("starting pipeline worker with config: {config:#?}");

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

    let runner = Arc::new(
        HttpModelRunner::new(HttpModelConfig {
            base_url: config.model_service_url.clone(),
            timeout: config.model_service_timeout,
            ..Default::default()
        })
        .context("while building model runner")?,
    );
    let signature = ModelSignature::derive(
        &config.recognition_model,
        &config.recognition_weights,
        config.recognition_metric,
    );
    tracing::info!("model signature: {signature}");
    let cache = EmbeddingCache::new(
        Arc::new(UserDirectory::new(&config.users_db_path)),
        store.clone(),
        runner.clone(),
        runner.clone(),
        signature,
        config.embedding_namespace.clone(),
        config.reference_crop,
    );

    let worker = PipelineWorker::new(
        PipelineId::new(config.pipeline_id),
        broker,
        store,
        FaceBranch {
            detector: runner.clone(),
            embedder: runner.clone(),
            spoof: runner.clone(),
            cache,
            metric: config.recognition_metric,
            recognition_threshold: config.recognition_threshold,
            spoof_threshold: config.spoof_threshold,
        },
        runner,
    );

    // a worker with broken models must not start consuming
    worker.warmup().await.context("while warming up models")?;
    worker
        .declare_topology(profile.pipeline.max_clients_per_pipeline)
        .await
        .context("while declaring broker topology")?;

    let (cancellation_token, is_graceful_shutdown) =
        vigil_common::shutdown::spawn_shutdown_task(vigil_common::shutdown::default_shutdown_signal());

    let branches = tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            let _drop_guard = cancellation_token.clone().drop_guard();
            if let Err(err) = worker.run(cancellation_token).await {
                tracing::error!("pipeline worker failed: {err:?}");
            }
        }
    });

    tracing::info!("pipeline worker started - waiting for shutdown...");
    cancellation_token.cancelled().await;

    let max_wait = config.max_wait_time_shutdown;
    tracing::info!("waiting for shutdown of services (max wait time {max_wait:?})..");
    match tokio::time::timeout(max_wait, branches).await {
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
