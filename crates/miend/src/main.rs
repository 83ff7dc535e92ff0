use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr,
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        threshold = config.similarity_threshold,
        "miend starting"
    );

    // Models load on the engine thread; /status reports `loading` until done.
    let engine = engine::spawn(engine::ModelPaths {
        detector: config.detector_model_path(),
        embedder: config.embedder_model_path(),
    });

    let store = Arc::new(mien_core::VectorStore::open(&config.db_path));

    http::serve(
        http::AppState {
            engine,
            store,
            threshold: config.similarity_threshold,
        },
        config.listen_addr,
    )
    .await
}
