// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned schema initializer.
//!
//! Applies an ordered list of named SQL scripts to the local store exactly
//! once each. Applied names are kept in the `schema_migrations` ledger, which
//! is consulted before anything else touches the store.
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync::schema::{Migration, SchemaInitializer};
//! use offline_sync::storage::SqlStore;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = SqlStore::in_memory().await.unwrap();
//! let report = SchemaInitializer::run(&store, &Migration::builtin()).await.unwrap();
//! assert_eq!(report.applied.len(), 3);
//!
//! // Second run is a no-op
//! let report = SchemaInitializer::run(&store, &Migration::builtin()).await.unwrap();
//! assert!(report.applied.is_empty());
//! # }
//! ```
//!
//! # Atomicity
//!
//! Statements of one script run one after another, not inside a single
//! transaction. A crash partway through leaves the ledger row unwritten, so the
//! whole script runs again from its first statement on the next start; scripts
//! use `IF NOT EXISTS` so re-running the leading statements is harmless.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::metrics;
use crate::storage::{RowExt, SqlStore, StorageError};

/// Ledger table name.
pub const LEDGER_TABLE: &str = "schema_migrations";

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (\
    name TEXT PRIMARY KEY, \
    applied_at TEXT NOT NULL)";

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration '{name}' failed at statement {index}: {source}")]
    Statement {
        name: String,
        index: usize,
        #[source]
        source: StorageError,
    },
    #[error("Migration '{0}' is listed more than once")]
    Duplicate(String),
    #[error("Cannot read migration scripts: {0}")]
    Io(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One named migration script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub name: String,
    pub body: String,
}

impl Migration {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    /// The scripts shipped with the crate, in application order.
    #[must_use]
    pub fn builtin() -> Vec<Migration> {
        vec![
            Migration::new(
                "0001_reference_cache",
                include_str!("../../migrations/0001_reference_cache.sql"),
            ),
            Migration::new(
                "0002_local_records",
                include_str!("../../migrations/0002_local_records.sql"),
            ),
            Migration::new(
                "0003_sync_cursors",
                include_str!("../../migrations/0003_sync_cursors.sql"),
            ),
        ]
    }

    /// Load every `*.sql` file in `dir`, ordered by file name.
    ///
    /// The migration name is the file stem (`0004_add_notes.sql` → `0004_add_notes`).
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Migration>, MigrationError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| MigrationError::Io(format!("{}: {}", dir.display(), e)))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| MigrationError::Io(e.to_string()))?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
                paths.push(path);
            }
        }
        paths.sort();

        paths
            .into_iter()
            .map(|path| {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let body = std::fs::read_to_string(&path)
                    .map_err(|e| MigrationError::Io(format!("{}: {}", path.display(), e)))?;
                Ok(Migration { name, body })
            })
            .collect()
    }

    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        split_statements(&self.body)
    }
}

/// Split a script on `;` outside quoted strings, dropping `--` comments and
/// empty statements.
#[must_use]
pub fn split_statements(body: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    // A doubled quote is an escaped quote, stay inside the literal
                    if chars.peek() == Some(&q) {
                        if let Some(next) = chars.next() {
                            current.push(next);
                        }
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    for skipped in chars.by_ref() {
                        if skipped == '\n' {
                            current.push('\n');
                            break;
                        }
                    }
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// Outcome of one initializer run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Names applied by this run, in order.
    pub applied: Vec<String>,
    /// Names already present in the ledger.
    pub skipped: usize,
}

pub struct SchemaInitializer;

impl SchemaInitializer {
    /// Apply every migration absent from the ledger, in list order.
    ///
    /// Stops at the first failing statement; that migration is not recorded.
    #[tracing::instrument(skip_all, fields(migrations = migrations.len()))]
    pub async fn run(store: &SqlStore, migrations: &[Migration]) -> Result<MigrationReport, MigrationError> {
        let mut seen = HashSet::new();
        for migration in migrations {
            if !seen.insert(migration.name.as_str()) {
                return Err(MigrationError::Duplicate(migration.name.clone()));
            }
        }

        store.execute(LEDGER_DDL, &[]).await?;
        let done: HashSet<String> = Self::applied(store).await?.into_iter().collect();

        let mut report = MigrationReport::default();
        for migration in migrations {
            if done.contains(&migration.name) {
                report.skipped += 1;
                continue;
            }

            let statements = migration.statements();
            info!(name = %migration.name, statements = statements.len(), "Applying migration");

            for (index, statement) in statements.iter().enumerate() {
                if let Err(source) = store.execute(statement, &[]).await {
                    error!(name = %migration.name, index, error = %source, "Migration statement failed");
                    metrics::record_migration(&migration.name, false);
                    return Err(MigrationError::Statement {
                        name: migration.name.clone(),
                        index,
                        source,
                    });
                }
            }

            store
                .execute(
                    "INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)",
                    &[json!(migration.name), json!(Utc::now().to_rfc3339())],
                )
                .await?;
            metrics::record_migration(&migration.name, true);
            report.applied.push(migration.name.clone());
        }

        if report.applied.is_empty() {
            info!(skipped = report.skipped, "Schema up to date");
        } else {
            info!(applied = report.applied.len(), skipped = report.skipped, "Schema migrated");
        }
        Ok(report)
    }

    /// Names recorded in the ledger, oldest first.
    pub async fn applied(store: &SqlStore) -> Result<Vec<String>, MigrationError> {
        let rows = match store
            .query_sql("SELECT name FROM schema_migrations ORDER BY applied_at, name", &[])
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Migration ledger unreadable");
                return Err(e.into());
            }
        };
        rows.iter()
            .map(|row| row.str_col("name").map_err(MigrationError::from))
            .collect()
    }
}
