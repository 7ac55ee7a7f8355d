//! SQLite initialization: connection pragmas and the ledger schema.

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use tracing::{debug, info};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Tables the ledger schema creates.
pub const LEDGER_TABLES: [&str; 4] = ["closed_lots", "ledger_state", "raw_trades", "trade_metrics"];

/// Applied to every pooled connection. A ledger write waits up to the busy
/// timeout for a concurrent writer; the version check then decides the winner.
const CONNECTION_PRAGMAS: [&str; 3] = [
    "PRAGMA foreign_keys = ON",
    "PRAGMA busy_timeout = 5000",
    "PRAGMA synchronous = NORMAL",
];

/// Open (creating if needed) the ledger database at `db_path` and apply the schema.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .after_connect(|conn, _meta| Box::pin(async move { configure_connection(conn).await }))
        .connect(&format!("sqlite:{}?mode=rwc", db_path))
        .await?;

    apply_schema(&pool).await?;

    info!(path = %db_path, "Ledger database ready");
    Ok(pool)
}

/// Every statement is `CREATE ... IF NOT EXISTS`, so this is safe to re-run.
async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements: Vec<&str> = SCHEMA_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut tx = pool.begin().await?;
    for statement in &statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    debug!(statements = statements.len(), "Applied ledger schema");
    Ok(())
}

async fn configure_connection(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for pragma in CONNECTION_PRAGMAS {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }

    // journal_mode reports the mode actually in effect.
    let row = sqlx::query("PRAGMA journal_mode = WAL")
        .fetch_one(&mut *conn)
        .await?;
    let journal_mode: String = row.get(0);
    debug!(journal_mode = %journal_mode, "Configured SQLite connection");
    Ok(())
}
