use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tokio::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use entitlement_engine::config;
use entitlement_engine::entitlements::{
    scheduler, EntitlementEngine, PgEntitlementStore, PlanCatalog, SystemClock,
};
use entitlement_engine::routes::api_routes;

async fn root() -> &'static str {
    "Entitlement Engine API"
}

fn load_catalog() -> anyhow::Result<PlanCatalog> {
    let catalog = match config::PLAN_CATALOG_PATH.as_ref() {
        Some(path) => PlanCatalog::from_path(path)
            .with_context(|| format!("loading plan catalog from {}", path.display()))?,
        None => PlanCatalog::builtin(),
    };
    match config::fallback_plan_override() {
        Some(fallback) => Ok(catalog.with_fallback_plan(fallback)?),
        None => Ok(catalog),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();

    let catalog = Arc::new(load_catalog()?);
    tracing::info!(
        plans = catalog.plans().count(),
        fallback = catalog.fallback_plan().map(|plan| plan.id.as_str()),
        "plan catalog loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error.into());
        }
    }

    let store = Arc::new(PgEntitlementStore::new(pool.clone()));
    let engine = EntitlementEngine::new(
        store,
        catalog,
        Arc::new(SystemClock),
        config::engine_settings(),
    );

    scheduler::spawn(
        engine.clone(),
        Duration::from_secs(*config::MAINTENANCE_SCAN_INTERVAL_SECS),
    );

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(engine));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid BIND_ADDRESS/BIND_PORT")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
