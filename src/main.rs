//! certforge server binary.
//!
//! Configuration comes from the environment: `DATA_DIR`, `DB_PATH`, `HOST`,
//! `PORT`, `LOG_LEVEL`. Exit code is non-zero only on unrecoverable startup
//! failure.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;

use certforge::acme::ChallengeValidator;
use certforge::server::AppContext;
use certforge::storage::Store;

struct Config {
    data_dir: PathBuf,
    db_path: PathBuf,
    host: String,
    port: u16,
}

fn load_config() -> anyhow::Result<Config> {
    let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));
    let db_path = std::env::var("DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("certforge.sqlite"));
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port = match std::env::var("PORT") {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("PORT {raw:?} is not a valid port number"))?,
        Err(_) => 8420,
    };
    Ok(Config {
        data_dir,
        db_path,
        host,
        port,
    })
}

fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    let raw = std::env::var("LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_default();
    match raw.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn init_logging(data_dir: &Path) -> anyhow::Result<()> {
    let level = resolve_log_level();

    #[cfg(debug_assertions)]
    {
        let _ = data_dir;
        let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
    }

    #[cfg(not(debug_assertions))]
    {
        let log_dir = data_dir.join("logs");
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("creating log directory {:?}", log_dir))?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "certforge");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // The guard must live until process exit; leak it on purpose.
        std::mem::forget(guard);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(non_blocking)
            .try_init();
    }

    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = load_config()?;
    init_logging(&config.data_dir)?;
    tracing::info!("certforge v{} starting", certforge::VERSION);

    let store = Arc::new(
        Store::open(&config.db_path, &config.data_dir).context("opening persistence store")?,
    );

    let base_url = format!("http://{}:{}", config.host, config.port);
    let ctx = AppContext::new(Arc::clone(&store), base_url);

    // Single background validator; re-arms pending challenges from the store.
    ctx.validator.recover_pending().await?;
    tokio::spawn(Arc::<ChallengeValidator>::clone(&ctx.validator).run());

    certforge::server::run(ctx, &config.host, config.port).await
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
