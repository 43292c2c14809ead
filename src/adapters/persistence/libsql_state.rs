//! libsql-backed application state. Implements AppStatePort.
//!
//! Snapshot = SQL dump of every user table as `REPLACE INTO` statements, read inside one
//! transaction so the dump is consistent. Restore deletes all rows and replays the dump inside
//! one write transaction; any error rolls back and leaves the previous rows intact.
//! Schema (CREATE TABLE) is owned by the application's migrations and is not part of the dump.

use crate::domain::DomainError;
use crate::ports::AppStatePort;
use libsql::{Database, Value};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tables that belong to the engine or to migrations, not to user data.
const LIST_TABLES: &str = r#"
SELECT name FROM sqlite_master
WHERE type = 'table'
  AND name NOT LIKE 'sqlite_%'
  AND name NOT LIKE 'libsql_%'
  AND name != 'migrations'
ORDER BY name"#;

pub struct LibsqlAppState {
    db: Database,
    db_path: PathBuf,
    /// Readers share; a restore excludes everyone.
    guard: RwLock<()>,
    migrating: Arc<AtomicBool>,
}

/// Held while the application migrates its schema. Snapshots and restores are refused meanwhile.
pub struct MigrationGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for MigrationGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl LibsqlAppState {
    /// Open an existing database. A missing file is `SourceUnavailable`.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, DomainError> {
        let db_path = db_path.as_ref();
        if !db_path.is_file() {
            return Err(DomainError::SourceUnavailable(format!(
                "database {} does not exist",
                db_path.display()
            )));
        }
        Self::build(db_path).await
    }

    /// Open the database, creating an empty one (and its directory) if needed.
    pub async fn create(db_path: impl AsRef<Path>) -> Result<Self, DomainError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::build(db_path).await
    }

    async fn build(db_path: &Path) -> Result<Self, DomainError> {
        let path_str = db_path.to_string_lossy();
        let db = libsql::Builder::new_local(path_str.as_ref())
            .build()
            .await
            .map_err(|e| DomainError::SourceUnavailable(e.to_string()))?;
        info!(path = %db_path.display(), "application database opened");
        Ok(Self {
            db,
            db_path: db_path.to_path_buf(),
            guard: RwLock::new(()),
            migrating: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn begin_migration(&self) -> MigrationGuard {
        self.migrating.store(true, Ordering::SeqCst);
        MigrationGuard {
            flag: Arc::clone(&self.migrating),
        }
    }

    fn check_available(&self) -> Result<libsql::Connection, DomainError> {
        if self.migrating.load(Ordering::SeqCst) {
            return Err(DomainError::SourceUnavailable(
                "schema migration in progress".into(),
            ));
        }
        if !self.db_path.is_file() {
            return Err(DomainError::SourceUnavailable(format!(
                "database {} is gone",
                self.db_path.display()
            )));
        }
        self.db
            .connect()
            .map_err(|e| DomainError::SourceUnavailable(e.to_string()))
    }
}

async fn user_tables(conn: &libsql::Connection) -> Result<Vec<String>, DomainError> {
    let mut rows = conn.query(LIST_TABLES, ()).await.map_err(state_err)?;
    let mut tables = Vec::new();
    while let Some(row) = rows.next().await.map_err(state_err)? {
        tables.push(row.get::<String>(0).map_err(state_err)?);
    }
    Ok(tables)
}

async fn dump_table(
    conn: &libsql::Connection,
    table: &str,
    out: &mut String,
) -> Result<usize, DomainError> {
    let mut rows = conn
        .query(&format!("SELECT * FROM {}", quote_ident(table)), ())
        .await
        .map_err(state_err)?;
    let columns: Vec<String> = (0..rows.column_count())
        .map(|i| quote_ident(rows.column_name(i).unwrap_or_default()))
        .collect();
    let insert = format!(
        "REPLACE INTO {} ({}) VALUES (",
        quote_ident(table),
        columns.join(", ")
    );

    let mut count = 0usize;
    while let Some(row) = rows.next().await.map_err(state_err)? {
        out.push_str(&insert);
        for i in 0..columns.len() {
            if i > 0 {
                out.push_str(", ");
            }
            let value = row.get_value(i as i32).map_err(state_err)?;
            push_literal(out, &value);
        }
        out.push_str(");\n");
        count += 1;
    }
    Ok(count)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn push_literal(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Integer(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Real(r) if r.is_finite() => {
            let _ = write!(out, "{:?}", r);
        }
        Value::Real(_) => out.push_str("NULL"),
        Value::Text(s) => {
            out.push('\'');
            out.push_str(&s.replace('\'', "''"));
            out.push('\'');
        }
        Value::Blob(b) => {
            out.push_str("X'");
            out.push_str(&hex::encode(b));
            out.push('\'');
        }
    }
}

fn state_err(e: libsql::Error) -> DomainError {
    DomainError::State(e.to_string())
}

#[async_trait::async_trait]
impl AppStatePort for LibsqlAppState {
    async fn read_snapshot(&self) -> Result<Vec<u8>, DomainError> {
        let _read = self.guard.read().await;
        let conn = self.check_available()?;
        let tx = conn.transaction().await.map_err(state_err)?;

        let mut dump = String::new();
        let mut total = 0usize;
        for table in user_tables(&tx).await? {
            let n = dump_table(&tx, &table, &mut dump).await?;
            debug!(table = %table, rows = n, "table dumped");
            total += n;
        }
        tx.rollback().await.map_err(state_err)?;

        info!(rows = total, bytes = dump.len(), "database snapshot read");
        Ok(dump.into_bytes())
    }

    async fn write_snapshot(&self, payload: &[u8]) -> Result<(), DomainError> {
        let sql = std::str::from_utf8(payload)
            .map_err(|e| DomainError::State(format!("snapshot is not UTF-8: {}", e)))?;
        let _write = self.guard.write().await;
        let conn = self.check_available()?;
        let tx = conn.transaction().await.map_err(state_err)?;

        let mut batch = String::from("PRAGMA defer_foreign_keys = ON;\n");
        for table in user_tables(&tx).await? {
            let _ = writeln!(batch, "DELETE FROM {};", quote_ident(&table));
        }
        batch.push_str(sql);

        match tx.execute_batch(&batch).await {
            Ok(_) => {
                tx.commit().await.map_err(state_err)?;
                info!(bytes = payload.len(), "database state replaced");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "restore failed; rolling back");
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "rollback reported an error");
                }
                Err(state_err(e))
            }
        }
    }
}
