use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use mentat_orchestrator::api::{self, AppState};
use mentat_orchestrator::config::Config;
use mentat_orchestrator::driver::{DriverSet, RedisTaskDriver};
use mentat_orchestrator::event_log::EventLog;
use mentat_orchestrator::fanout::WsHub;
use mentat_orchestrator::manager::RunManager;
use mentat_orchestrator::store::{MemoryRunStore, RedisRunStore, RunStore};
use mentat_orchestrator::types::RunMode;

/// External workers get five minutes to answer a queued task.
const REDIS_RESULT_WAIT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mentat_orchestrator=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(runstore = %config.runstore, bind = %config.bind, "starting orchestrator");

    let events = EventLog::new(config.retention());

    let store: Arc<dyn RunStore> = match config.runstore {
        RunMode::Memory => Arc::new(MemoryRunStore::new()),
        RunMode::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .expect("validated by Config::from_env");
            Arc::new(
                RedisRunStore::connect(url)
                    .await
                    .context("connecting to redis store")?,
            )
        }
        #[cfg(feature = "kubernetes")]
        RunMode::K8s => Arc::new(
            mentat_orchestrator::store::KubeRunStore::connect(&config.k8s_namespace)
                .await
                .context("connecting to kubernetes")?,
        ),
        #[cfg(not(feature = "kubernetes"))]
        RunMode::K8s => anyhow::bail!("this build does not include kubernetes support"),
    };

    let mut drivers = DriverSet::new();
    if let Some(url) = config.redis_url.as_deref() {
        drivers = drivers.with_redis(Arc::new(
            RedisTaskDriver::connect(url, REDIS_RESULT_WAIT)
                .await
                .context("connecting redis task driver")?,
        ));
    }
    #[cfg(feature = "kubernetes")]
    if config.runstore == RunMode::K8s {
        drivers = drivers.with_k8s(Arc::new(
            mentat_orchestrator::driver::KubeJobDriver::connect(&config.k8s_namespace)
                .await
                .context("connecting kubernetes job driver")?,
        ));
    }

    let manager = RunManager::new(store, Arc::clone(&events), Arc::new(drivers), config.manager());
    let hub = WsHub::spawn(Arc::clone(&events));

    if let Some(ttl) = config.run_ttl() {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ttl.min(Duration::from_secs(60)));
            loop {
                tick.tick().await;
                match manager.purge_finished(ttl).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(purged, "purged expired runs"),
                    Err(err) => tracing::warn!(error = %err, "run purge sweep failed"),
                }
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = api::router(AppState {
        manager,
        hub,
        sse_heartbeat: config.sse_heartbeat(),
    })
    .layer(TraceLayer::new_for_http())
    .layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!("control plane listening on http://{}", config.bind);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("serving control plane")?;

    Ok(())
}
