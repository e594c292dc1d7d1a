// Load question templates from a seed file into the database.
//
// Usage: groupquiz-seed [path]
// Without a path, the file named by `[seed] questions_path` is used.

use std::path::PathBuf;

use anyhow::Context;
use groupquiz_bot::config;
use groupquiz_core::seed;
use groupquiz_core::Database;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("groupquiz_core=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = config::load_config().context("failed to load configuration")?;
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&config.questions_path));

    let templates = seed::load_seed_file(&path)
        .with_context(|| format!("failed to load questions from {}", path.display()))?;
    info!("Validated {} questions from {}", templates.len(), path.display());

    let db = Database::open(&config.db_path).context("failed to open database")?;
    let count = seed::seed_store(&db, &templates).context("failed to store questions")?;

    println!("Loaded {count} questions into {}", config.db_path);
    Ok(())
}
