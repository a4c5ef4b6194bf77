use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::anyhow;
use chrono::TimeDelta;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use thermowatt_bridge::{
    api::{self, handlers::AppState},
    bridge::{start_push_channels, Bridge, LocalCommandHandler, PushSettings},
    clock::{Clock, SystemClock},
    config::{Config, StatusMode},
    dispatcher::DispatcherSettings,
    error::BootError,
    mqtt::{local_options, MqttBroker},
    registry::DeviceRegistry,
    store::StateStore,
    thermowatt::{transport::ReqwestTransport, Credentials, ThermowattClient},
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const LOCAL_CLIENT_ID: &str = "thermowatt_bridge";

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env (ignore error if file absent, env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "Bridge stopped");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), BootError> {
    let config = Config::from_env().map_err(BootError::Config)?;
    let shutdown = CancellationToken::new();

    // Persisted install id, tokens and device map
    let store = StateStore::open(&config.state_path).await;

    let transport = ReqwestTransport::new(
        &config.thermowatt_base_url,
        HTTP_TIMEOUT,
        config.thermowatt_insecure_tls,
    )
    .map_err(|e| BootError::Config(e.into()))?;
    let client = ThermowattClient::new(
        Arc::new(transport),
        store.clone(),
        Credentials {
            email: config.thermowatt_email.clone(),
            password: config.thermowatt_password.clone(),
        },
    );
    let registry = DeviceRegistry::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Local broker connection
    let credentials = config
        .mqtt_credentials
        .as_ref()
        .map(|(user, password)| (user.as_str(), password.as_str()));
    let (local, local_loop) = MqttBroker::new(
        "local",
        local_options(LOCAL_CLIENT_ID, &config.mqtt_host, config.mqtt_port, credentials),
    );

    let bridge = Arc::new(Bridge::new(
        client.clone(),
        registry.clone(),
        local.clone(),
        clock.clone(),
        DispatcherSettings {
            cooldown: TimeDelta::seconds(config.cooldown_secs as i64),
            holiday_buffer: TimeDelta::seconds(config.holiday_cooldown_buffer_secs as i64),
            policy: config.injection_policy,
        },
    ));

    let mut tasks = vec![tokio::spawn(local.clone().run(
        local_loop,
        Arc::new(LocalCommandHandler(bridge.clone())),
        shutdown.clone(),
    ))];

    local
        .wait_connected(BROKER_CONNECT_TIMEOUT)
        .await
        .map_err(BootError::LocalBroker)?;
    info!(host = %config.mqtt_host, port = config.mqtt_port, "Local broker connected");

    // Login, discovery, descriptors, command subscriptions
    bridge.boot().await?;

    // Status relay
    match config.status_mode {
        StatusMode::Pull => {
            let interval = Duration::from_secs(config.poll_interval_secs);
            tasks.push(tokio::spawn(
                bridge.relay().clone().run_pull(interval, shutdown.clone()),
            ));
        }
        StatusMode::Push => {
            let push = config
                .push
                .as_ref()
                .ok_or_else(|| BootError::PushChannel(anyhow!("push mode without AWS_IOT settings")))?;
            let settings = PushSettings {
                host: push.host.clone(),
                port: push.port,
                ca_path: push.ca_path.clone(),
                cert_path: push.cert_path.clone(),
                key_path: push.key_path.clone(),
                connect_timeout: BROKER_CONNECT_TIMEOUT,
            };
            let channels = start_push_channels(bridge.clone(), &settings, shutdown.clone())
                .await
                .map_err(BootError::PushChannel)?;
            tasks.extend(channels);
        }
    }

    // Operator API
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await.map_err(BootError::Api)?;
    info!(addr = %addr, "Operator API listening");

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let state = AppState {
        registry,
        client,
        clock,
    };
    let api_shutdown = shutdown.clone();
    if let Err(e) = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
        .await
    {
        error!(error = %e, "Operator API failed");
        shutdown.cancel();
    }

    for task in tasks {
        let _ = task.await;
    }
    bridge.shutdown().await;
    info!("Bridge stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
