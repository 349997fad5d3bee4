//! # localkb server binary
//!
//! Starts the knowledge-base chat server: opens the SQLite store, runs
//! migrations, connects the engine, and serves the HTTP API.
//!
//! ```bash
//! localkb --port 8081 --model models/qwen2.5-1.5b-q4.gguf --db data/knowledge.db
//! ```
//!
//! Relative `--model`/`--db` paths are resolved against the working
//! directory, then the executable's directory, then a macOS app-bundle
//! `Resources` sibling, so the same binary works in development and
//! packaged layouts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use localkb::config::{Config, RetrievalConfig};
use localkb::engine::{EngineHandle, HttpEngine};
use localkb::ingest::KnowledgeBase;
use localkb::search::Retriever;
use localkb::server::{router, AppState};
use localkb::{db, migrate};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Local-first knowledge-base chat server.
#[derive(Parser)]
#[command(
    name = "localkb",
    about = "Local knowledge-base chat: ingest documents, hybrid retrieval, streaming completions",
    version
)]
struct Cli {
    /// HTTP listen port.
    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Model identifier (GGUF path or served model name).
    #[arg(long, default_value = "models/model.gguf")]
    model: String,

    /// SQLite database path.
    #[arg(long, default_value = "data/knowledge.db")]
    db: String,

    /// Base URL of the OpenAI-compatible engine endpoint.
    #[arg(long, default_value = "http://127.0.0.1:8080/v1")]
    engine_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let model = resolve_model(&cli.model);
    let db_path = resolve_path(Path::new(&cli.db));
    info!("model: {model}");
    info!("database: {}", db_path.display());

    let config = Config {
        port: cli.port,
        model: model.clone(),
        db_path: db_path.clone(),
        engine_url: cli.engine_url.clone(),
        retrieval: RetrievalConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    let pool = db::connect(&config.db_path).await?;
    migrate::run_migrations(&pool).await?;

    // The blocking HTTP client must be built off the async runtime.
    let engine_url = config.engine_url.clone();
    let engine = tokio::task::spawn_blocking(move || HttpEngine::new(&engine_url, &model))
        .await
        .context("engine setup task failed")??;
    let engine = EngineHandle::new(Box::new(engine));

    let kb = KnowledgeBase::new(pool.clone(), engine.clone());
    let retriever = Arc::new(Retriever::new(
        pool.clone(),
        engine.clone(),
        config.retrieval.clone(),
    ));

    let state = AppState {
        pool,
        engine: engine.clone(),
        kb: kb.clone(),
        retriever,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!("listening on http://localhost:{}", config.port);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");

    // Cancel background ingestion first, then give in-flight requests a
    // bounded window to finish.
    kb.close();
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(joined) => {
            joined.context("server task")??;
        }
        Err(_) => warn!("graceful shutdown timed out after {SHUTDOWN_GRACE:?}"),
    }

    // Engine last: in-flight requests are done or abandoned by now.
    let _ = engine
        .with_locked(|e| {
            e.close();
            Ok(())
        })
        .await;

    Ok(())
}

/// Resolve a possibly-relative path against the working directory, the
/// executable directory, and a macOS `Resources` sibling, in that order.
/// Unresolvable paths are returned as-is and fail (or are created)
/// later.
fn resolve_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    if path.exists() {
        return path.to_path_buf();
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let beside_exe = exe_dir.join(path);
            if beside_exe.exists() {
                return beside_exe;
            }
            let in_resources = exe_dir.join("..").join("Resources").join(path);
            if in_resources.exists() {
                return in_resources;
            }
        }
    }
    path.to_path_buf()
}

/// Resolve the model argument; when the named file is missing, fall back
/// to the first `.gguf` found in the conventional model directories.
fn resolve_model(model: &str) -> String {
    let resolved = resolve_path(Path::new(model));
    if resolved.exists() {
        return resolved.to_string_lossy().into_owned();
    }

    let mut search_dirs = vec![PathBuf::from("models")];
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            search_dirs.push(exe_dir.join("models"));
            search_dirs.push(exe_dir.join("..").join("Resources").join("models"));
        }
    }
    for dir in search_dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "gguf") {
                info!("auto-detected model: {}", path.display());
                return path.to_string_lossy().into_owned();
            }
        }
    }

    warn!("model not found at {model}; continuing with it as an identifier");
    model.to_string()
}
