//! SQLite pool setup and schema migrations.

use anyhow::Result;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};
use tracing::{debug, info};

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Open the pool, creating the database file (and its directory) when missing.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    if let Some(path) = resolve_db_path(database_url) {
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                info!("created database directory {}", parent.display());
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = split_statements(INIT_SQL);

    info!("running {} migration statements", statements.len());

    for stmt in statements {
        debug!("executing migration SQL: {}", stmt);
        sqlx::query(&stmt).execute(db).await?;
    }
    Ok(())
}

/// Split a script into statements. `--` comments are dropped first so a `;`
/// inside one cannot cut a statement short.
fn split_statements(sql: &str) -> Vec<String> {
    let code = sql
        .lines()
        .map(|line| line.find("--").map_or(line, |idx| &line[..idx]))
        .collect::<Vec<_>>()
        .join("\n");
    code.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Filesystem path of a SQLite database URL, or `None` for in-memory databases.
///
/// Accepts `sqlite://path`, `sqlite:path`, `file:path` and bare paths, with or
/// without a `?query` suffix.
pub fn resolve_db_path(database_url: &str) -> Option<String> {
    let without_scheme = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let without_file = without_scheme
        .strip_prefix("file:")
        .unwrap_or(without_scheme);
    let path = without_file
        .split_once('?')
        .map_or(without_file, |(path, _)| path);

    if path.is_empty() || path == ":memory:" || database_url.contains("mode=memory") {
        return None;
    }
    Some(path.to_string())
}
