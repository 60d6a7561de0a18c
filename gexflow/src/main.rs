use std::sync::Arc;
use std::time::Duration;
use std::{env, process, str::FromStr};

use analytics_engine::{AnalyticsEngine, AnalyticsStore};
use broker_client::auth::{AuthError, TokenSource};
use broker_client::{
    BrokerClient, MarketDataSource, PRODUCTION_BASE_URL, PRODUCTION_TOKEN_URL, SANDBOX_BASE_URL,
    SANDBOX_TOKEN_URL,
};
use core_types::config::AppConfig;
use core_types::status::ServiceStatusHandle;
use engine_api::{Engine, EngineError};
use ingestion_engine::{IngestionEngine, SnapshotWriter};
use log::{error, info};
use storage::Store;
use thiserror::Error;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        error!("gexflow failed: {err}");
        process::exit(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ingest,
    Analytics,
    All,
}

impl FromStr for Mode {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "ingest" => Ok(Mode::Ingest),
            "analytics" => Ok(Mode::Analytics),
            "all" => Ok(Mode::All),
            _ => Err(AppError::Usage),
        }
    }
}

fn run() -> Result<(), AppError> {
    let mode = match env::args().nth(1) {
        Some(arg) => Mode::from_str(&arg)?,
        None => Mode::All,
    };
    let cfg = AppConfig::load()?;

    // Small runtime for async setup and signal waiting; the engines own
    // their runtimes.
    let boot = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let store = boot.block_on(Store::connect(&cfg))?;

    // The maintenance sweep runs in every mode.
    let maintenance_rt = tokio::runtime::Runtime::new()?;
    let _maintenance = {
        let _guard = maintenance_rt.enter();
        store.spawn_maintenance_loop(cfg.data_retention_days, MAINTENANCE_INTERVAL)
    };

    let mut engines: Vec<Box<dyn Engine>> = Vec::new();
    let mut statuses: Vec<ServiceStatusHandle> = Vec::new();

    if matches!(mode, Mode::Ingest | Mode::All) {
        cfg.require_credentials()?;
        let http = reqwest::Client::new();
        let (base_url, token_url) = if cfg.broker_use_sandbox {
            (SANDBOX_BASE_URL, SANDBOX_TOKEN_URL)
        } else {
            (PRODUCTION_BASE_URL, PRODUCTION_TOKEN_URL)
        };
        info!("broker environment: {base_url}");
        let tokens = Arc::new(TokenSource::new(
            http.clone(),
            token_url,
            cfg.broker_client_id.clone(),
            cfg.broker_client_secret.clone(),
            cfg.broker_refresh_token.clone(),
            cfg.broker_retry_policy(),
        )?);
        let client: Arc<dyn MarketDataSource> = Arc::new(BrokerClient::new(
            http,
            base_url,
            tokens,
            cfg.broker_retry_policy(),
            Duration::from_secs(cfg.api_request_timeout),
        ));
        let writer: Arc<dyn SnapshotWriter> = Arc::new(store.clone());
        let ingest = IngestionEngine::new(client, writer, cfg.clone());
        statuses.push(ingest.status());
        ingest.start()?;
        engines.push(Box::new(ingest));
    }

    if matches!(mode, Mode::Analytics | Mode::All) {
        let reader: Arc<dyn AnalyticsStore> = Arc::new(store.clone());
        let analytics = AnalyticsEngine::new(reader, cfg.clone());
        statuses.push(analytics.status());
        analytics.start()?;
        engines.push(Box::new(analytics));
    }

    info!(
        "gexflow running in {mode:?} mode for {} ({} engine(s))",
        cfg.underlying,
        engines.len()
    );

    // First signal starts the cooperative drain; a second one forces exit.
    boot.block_on(shutdown_signal());
    info!("shutdown signal received, draining");

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let stopper = std::thread::spawn(move || {
        for engine in engines {
            if let Err(err) = engine.stop() {
                error!("engine stop failed: {err}");
            }
        }
        let _ = done_tx.send(());
    });
    let forced = boot.block_on(async {
        tokio::select! {
            _ = shutdown_signal() => true,
            _ = done_rx => false,
        }
    });
    if forced {
        error!("second signal received, forcing exit");
        process::exit(1);
    }
    let _ = stopper.join();

    for status in &statuses {
        let snap = status.snapshot();
        if snap.error_counts.is_empty() {
            info!("{}: clean shutdown", snap.name);
        } else {
            info!("{}: error counts {:?}", snap.name, snap.error_counts);
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error("usage: gexflow [ingest|analytics|all]")]
    Usage,
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Store(#[from] storage::StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
