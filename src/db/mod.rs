use anyhow::{Context, Result};
use std::path::Path;
use tokio_rusqlite::Connection;

pub mod history;

pub use history::{HistoryRecord, HistoryStore, RunLogEntry, SourceIdentity};

/// Open the history database at `path`, creating it and its parent folders.
pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open history database {}", path.display()))?;
    apply_schema(&conn).await?;
    Ok(conn)
}

/// Throwaway database, used by tests and dry runs.
pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;
    Ok(())
}
