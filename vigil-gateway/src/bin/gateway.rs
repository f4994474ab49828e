//! Gateway binary.
//!
//! Serves the client-facing WebSocket endpoint, off-loads frames to object
//! storage, publishes envelopes to the broker and fans incoming actions
//! back out to the right sockets.

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
use vigil_gateway::{GatewayState, SessionRegistry, config::GatewayConfig};
use vigil_ratelimit::RateLimiter;
use vigil_status::{RedisStatusStore, StatusStore as _, StatusStoreService};
use vigil_storage::ObjectStoreService;
use vigil_storage::s3::S3ObjectStore;

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    vigil_common::observability::init_tracing()?;
    vigil_gateway::metrics::describe_metrics();
    vigil_ratelimit::describe_metrics();

    let config = GatewayConfig::parse();
    tracing::info!("starting gateway with config: {config:#?}");

    let profile = ConfigProfile::load(config.profile_path.as_deref(), config.profile.as_deref())
        .context("while loading deployment profile")?;
    tracing::info!(
        "profile '{}': capacity {} client(s)",
        profile.name,
        profile.pipeline.total_capacity
    );

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
    let broker: vigil_broker::BrokerService = broker;
    vigil_gateway::declare_topology(&broker)
        .await
        .context("while declaring broker topology")?;

    let rate_limiter = Arc::new(RateLimiter::new(profile.rate_limiter()));
    let state = GatewayState {
        broker,
        store,
        status,
        users: Arc::new(UserDirectory::new(&config.users_db_path)),
        rate_limiter: Arc::clone(&rate_limiter),
        registry: SessionRegistry::default(),
        session_permits: Arc::new(tokio::sync::Semaphore::new(
            profile.pipeline.total_capacity as usize,
        )),
        message_timeout: config.message_timeout,
        max_message_size: config.max_message_size,
    };

    let (cancellation_token, is_graceful_shutdown) =
        vigil_common::shutdown::spawn_shutdown_task(vigil_common::shutdown::default_shutdown_signal());

    let started_services = StartedServices::default();
    let consumer_started = started_services.new_service();
    let action_consumer = tokio::spawn({
        let state = state.clone();
        let cancellation_token = cancellation_token.clone();
        async move {
            let _drop_guard = cancellation_token.clone().drop_guard();
            consumer_started.store(true, Ordering::Relaxed);
            if let Err(err) =
                vigil_gateway::actions::action_consumer_task(state, cancellation_token).await
            {
                tracing::error!("action consumer failed: {err:?}");
            }
        }
    });

    let router = vigil_gateway::routes(state)
        .merge(vigil_common::health::routes(started_services.clone()));

    tracing::info!("binding to {}", config.bind_addr);
    let tcp_listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("while binding tcp-listener")?;

    let axum_cancel_token = cancellation_token.clone();
    let server = tokio::spawn(async move {
        tracing::info!(
            "gateway listening on {}",
            tcp_listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or(String::from("invalid addr"))
        );
        let axum_shutdown_signal = axum_cancel_token.clone();
        let axum_result = axum::serve(
            tcp_listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async move { axum_shutdown_signal.cancelled().await })
        .await;
        tracing::info!("axum server shutdown");
        if let Err(err) = axum_result {
            tracing::error!("got error from axum: {err:?}");
        }
        // cancel in case axum encountered an error so the rest shuts down
        axum_cancel_token.cancel();
    });

    tracing::info!("everything started successfully - now waiting for shutdown...");
    cancellation_token.cancelled().await;
    rate_limiter.shutdown();

    let max_wait = config.max_wait_time_shutdown;
    tracing::info!("waiting for shutdown of services (max wait time {max_wait:?})..");
    match tokio::time::timeout(max_wait, async move {
        tokio::join!(server, action_consumer)
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
