//! Server-manager binary.
//!
//! Persists saved-action snapshots, serves the admin HTTP surface and
//! mirrors the client-status snapshot to JSON files.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser as _;
use eyre::Context as _;
use vigil_broker::amqp::{AmqpBroker, AmqpConfig};
use vigil_common::Environment;
use vigil_common::health::StartedServices;
use vigil_common::profile::ConfigProfile;
use vigil_common::users::UserDirectory;
use vigil_manager::admin::AdminState;
use vigil_manager::config::ManagerConfig;
use vigil_manager::file_ops::{FileOpsConfig, file_ops_task};
use vigil_manager::saved_actions::SavedActionWriter;
use vigil_status::{RedisStatusStore, StatusStore as _, StatusStoreService};
use vigil_storage::ObjectStoreService;
use vigil_storage::s3::S3ObjectStore;

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    vigil_common::observability::init_tracing()?;
    vigil_manager::metrics::describe_metrics();

    let config = ManagerConfig::parse();
    tracing::info!("starting server manager with config: {config:#?}");

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

    tracing::info!("init status store..");
    let status: StatusStoreService = Arc::new(
        RedisStatusStore::connect(&config.redis_url)
            .await
            .context("while connecting to the status store")?,
    );
    status
        .prime()
        .await
        .context("while priming the status snapshot")?;

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

    let writer = SavedActionWriter::new(broker, store, config.data_dir.clone());
    writer
        .declare_topology()
        .await
        .context("while declaring broker topology")?;

    let (cancellation_token, is_graceful_shutdown) =
        vigil_common::shutdown::spawn_shutdown_task(vigil_common::shutdown::default_shutdown_signal());

    let started_services = StartedServices::default();

    let writer_started = started_services.new_service();
    let writer_task = tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            let _drop_guard = cancellation_token.clone().drop_guard();
            writer_started.store(true, Ordering::Relaxed);
            if let Err(err) = writer.run(cancellation_token).await {
                tracing::error!("saved-action writer failed: {err:?}");
            }
        }
    });

    let file_ops_started = started_services.new_service();
    let file_ops = tokio::spawn({
        let status = status.clone();
        let users = Arc::new(UserDirectory::new(&config.users_db_path));
        let file_ops_config = FileOpsConfig {
            interval: config.snapshot_interval,
            output_dir: config.data_dir.join("Server_Data"),
        };
        let cancellation_token = cancellation_token.clone();
        async move {
            file_ops_started.store(true, Ordering::Relaxed);
            file_ops_task(status, users, file_ops_config, cancellation_token).await;
        }
    });

    let router = vigil_manager::admin::routes(
        AdminState {
            status,
            server_name: config.server_name.clone(),
        },
        &config.admin_origin,
    )
    .context("while building admin routes")?
    .merge(vigil_common::health::routes(started_services.clone()));

    tracing::info!("binding admin server to {}", config.admin_bind_addr);
    let tcp_listener = tokio::net::TcpListener::bind(config.admin_bind_addr)
        .await
        .context("while binding tcp-listener")?;

    let axum_cancel_token = cancellation_token.clone();
    let server = tokio::spawn(async move {
        let axum_shutdown_signal = axum_cancel_token.clone();
        let axum_result = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move { axum_shutdown_signal.cancelled().await })
            .await;
        tracing::info!("admin server shutdown");
        if let Err(err) = axum_result {
            tracing::error!("got error from axum: {err:?}");
        }
        axum_cancel_token.cancel();
    });

    tracing::info!("everything started successfully - now waiting for shutdown...");
    cancellation_token.cancelled().await;

    let max_wait = config.max_wait_time_shutdown;
    tracing::info!("waiting for shutdown of services (max wait time {max_wait:?})..");
    match tokio::time::timeout(max_wait, async move {
        tokio::join!(server, writer_task, file_ops)
    })
    .await
    {
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
