use std::sync::Arc;
use survey_node::api;
use survey_node::cluster::LocalCluster;
use survey_node::config::Config;
use survey_node::db;
use survey_node::errors::ApiError;
use survey_node::provider::{AcceptAll, DataLoader, Neutralizer, RandomLoader};
use survey_node::state::{AppState, ProofKeys};
use survey_node::verification::Ledger;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let config = Config::from_env()?;

    // Ledger and range keys live under the data directory (ignored by git).
    std::fs::create_dir_all(&config.data_dir).map_err(|_| ApiError::Internal)?;

    let db_path = config.data_dir.join("ledger.sqlite");
    let db_url = format!("sqlite:{}?mode=rwc", db_path.to_string_lossy());

    let db = db::connect(&db_url).await?;
    db::init_schema(&db).await?;

    // Synthetic data: every provider gets its own reproducible stream.
    let per_node = config.cluster.providers_per_node;
    let mut loaders: Vec<Vec<Arc<dyn DataLoader>>> = Vec::with_capacity(config.cluster.computing_nodes);
    for i in 0..config.cluster.computing_nodes {
        let mut row = Vec::with_capacity(per_node);
        for j in 0..per_node {
            let loader = RandomLoader::new(0, config.value_max, config.rows_per_provider, (i * per_node + j) as u64)
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            row.push(Arc::new(loader) as Arc<dyn DataLoader>);
        }
        loaders.push(row);
    }

    let cluster = LocalCluster::start(
        &config.cluster,
        Ledger::new(db.clone()),
        ProofKeys::new(Some(config.data_dir.clone())),
        |i, j| (loaders[i][j].clone(), Arc::new(AcceptAll) as Arc<dyn Neutralizer>),
    );
    let client = cluster.client("querier").await?;

    let addr = config.addr.clone();
    let state = AppState::new(db, config, cluster, client);

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|_| ApiError::Internal)?;

    tracing::info!(%addr, "survey node listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .map_err(|_| ApiError::Internal)?;

    Ok(())
}
