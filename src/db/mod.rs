//! Database module: pool setup, row mapping and SQL repositories.
//!
//! - `model`: row -> entity mapping shared by the repositories.
//! - `repo`: books and their images.
//! - `jobs`: image processing jobs.
//! - `analysis`: analysis jobs and stored valuations.
//!
//! Callers import from `moxon_worker::db`; the repository functions are
//! re-exported here.

pub mod analysis;
pub mod jobs;
pub mod model;
pub mod repo;

pub use analysis::*;
pub use jobs::*;
pub use repo::*;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let url = expand_home(database_url);
    if let Some(path) = sqlite_file_path(&url) {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let opts = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid database url {}", database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Expand a leading `~/` in the path part of a SQLite URL.
fn expand_home(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite://~/") else {
        return url.to_string();
    };
    match std::env::var("HOME") {
        Ok(home) => format!("sqlite://{}/{}", home.trim_end_matches('/'), rest),
        Err(_) => url.to_string(),
    }
}

/// File path behind a `sqlite:` URL; `None` for in-memory and other schemes.
fn sqlite_file_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("sqlite:")?;
    if rest.starts_with(":memory") {
        return None;
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let path = rest.split_once('?').map(|(p, _)| p).unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}
