use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use biogas_bridge::bus::{self, Publisher};
use biogas_bridge::calibration::Calibrator;
use biogas_bridge::config::{Config, StoreConfig};
use biogas_bridge::correlation::Correlation;
use biogas_bridge::handlers::{self, AppState};
use biogas_bridge::pipeline::Pipeline;
use biogas_common::metrics::setup_metrics_recorder;
use biogas_common::pgstore::PgStore;
use biogas_common::reststore::RestStore;
use biogas_common::store::{MemoryStore, Store, StoreBackend};

const SUPERVISOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn create_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    let timeout = config.store_timeout.0;

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Postgres => Arc::new(
            PgStore::new(&config.store_url, config.max_pg_connections, timeout)
                .wrap_err("failed to create postgres store")?,
        ),
        StoreBackend::Rest => Arc::new(
            RestStore::new(&config.store_url, config.store_key.as_deref(), timeout)
                .wrap_err("failed to create rest store")?,
        ),
        StoreBackend::Memory => {
            warn!("using in-memory store: records grow without bound and are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    Ok(store)
}

async fn shutdown(mut term: Signal, mut interrupt: Signal) {
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    }
}

async fn listen(app: Router, bind: String, term: Signal, interrupt: Signal) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("failed to bind {bind}"))?;
    info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(term, interrupt))
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    let topics = config.topics();

    let store = create_store(&config.store)?;
    let correlation = Arc::new(Correlation::new());

    let inbound_topics = topics.inbound().map(str::to_owned).to_vec();
    let (bus, supervisor, inbound) =
        bus::connect(&config.mqtt, inbound_topics, config.publish_timeout.0)
            .wrap_err("invalid mqtt configuration")?;
    let publisher: Arc<dyn Publisher> = Arc::new(bus.clone());

    let supervisor = tokio::spawn(supervisor.run());
    tokio::spawn(Pipeline::new(store.clone(), correlation.clone(), topics.clone()).run(inbound));
    tokio::spawn(bus::heartbeat(
        bus.subscribe_state(),
        config.heartbeat_interval.0,
    ));

    let calibrator = Calibrator::new(
        correlation.clone(),
        publisher.clone(),
        store,
        topics.clone(),
        config.calibration_timeout.0,
    );
    let state = AppState {
        calibrator,
        correlation,
        publisher,
        topics,
        store_backend: config.store.store_backend,
        broker: bus.broker().to_owned(),
    };

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };
    let app = handlers::app(state, recorder_handle);

    let term = signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
    let interrupt = signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;
    let served = listen(app, config.bind(), term, interrupt).await;

    info!("shutting down");
    if let Err(err) = bus.disconnect().await {
        warn!("failed to request mqtt disconnect: {}", err);
    }
    if tokio::time::timeout(SUPERVISOR_SHUTDOWN_TIMEOUT, supervisor)
        .await
        .is_err()
    {
        error!("mqtt supervisor did not stop in time");
    }

    served
}
