//! Counter-tracked schema migrations for the libSQL backend.
//!
//! `db_metadata` holds a single `migrations` row: the index of the last
//! applied entry in `MIGRATIONS`, or -1 for a fresh store. `run_migrations()`
//! applies every later entry in one transaction together with the counter
//! update, so a store is either fully migrated or untouched.
//! Entries are append-only: never reorder or edit a released one.

use libsql::{Connection, params};
use tracing::info;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new steps to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        name: "create_scheduled",
        sql: r#"
            CREATE TABLE scheduled (
                idem_key TEXT NOT NULL PRIMARY KEY,
                job_key TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                to_name TEXT,
                from_addr TEXT,
                from_name TEXT,
                reply_to TEXT,
                title TEXT NOT NULL,
                html_body TEXT NOT NULL,
                text_body TEXT NOT NULL,
                attachments BLOB,
                send_at BIGINT NOT NULL,
                state TEXT NOT NULL DEFAULT 'unsent',
                try_count INT NOT NULL DEFAULT 0
            );
        "#,
    },
    Migration {
        name: "add_mail_domain",
        sql: "ALTER TABLE scheduled ADD COLUMN mail_domain TEXT;",
    },
    Migration {
        name: "add_subscription_key",
        sql: "ALTER TABLE scheduled ADD COLUMN sub TEXT;",
    },
    Migration {
        name: "add_missive_key",
        sql: "ALTER TABLE scheduled ADD COLUMN missive TEXT;",
    },
    Migration {
        name: "index_due_jobs",
        sql: "CREATE INDEX IF NOT EXISTS idx_scheduled_due ON scheduled(state, send_at);",
    },
    Migration {
        name: "index_grouping_keys",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_scheduled_job_key ON scheduled(job_key);
            CREATE INDEX IF NOT EXISTS idx_scheduled_sub ON scheduled(sub);
            CREATE INDEX IF NOT EXISTS idx_scheduled_missive ON scheduled(missive);
        "#,
    },
];

/// Number of known migration steps.
pub fn migration_count() -> usize {
    MIGRATIONS.len()
}

/// Bring the store up to the latest schema. Returns the applied counter.
///
/// Fails without touching the schema if the stored counter is ahead of the
/// known migrations (the file belongs to a newer release).
pub async fn run_migrations(conn: &Connection) -> Result<i64, DatabaseError> {
    ensure_metadata(conn).await?;

    let current = current_version(conn).await?;
    let target = MIGRATIONS.len() as i64 - 1;
    info!(current, "Current migration");

    if current > target {
        return Err(DatabaseError::Migration(format!(
            "Saved migration {current} > known migrations {target}"
        )));
    }
    if current == target {
        return Ok(current);
    }

    let tx = conn
        .transaction()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to begin migration: {e}")))?;

    match apply_pending(&tx, current, target).await {
        Ok(()) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Migration(format!("Failed to commit migrations: {e}")))?;
        }
        Err(e) => {
            let _ = tx.rollback().await;
            return Err(e);
        }
    }

    info!(from = current, to = target, "Rolled database forward");
    Ok(target)
}

async fn apply_pending(conn: &Connection, current: i64, target: i64) -> Result<(), DatabaseError> {
    for (index, migration) in MIGRATIONS.iter().enumerate() {
        let index = index as i64;
        if index <= current {
            continue;
        }

        info!(index, name = migration.name, "Applying migration");
        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "Migration {index} ({}) failed: {e}",
                migration.name
            ))
        })?;
    }

    conn.execute(
        "UPDATE db_metadata SET value = ?1 WHERE key = 'migrations'",
        params![target.to_string()],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration {target}: {e}")))?;

    Ok(())
}

/// Create and seed `db_metadata` on a store that has never been initialized.
async fn ensure_metadata(conn: &Connection) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='db_metadata'",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to check metadata table: {e}")))?;

    let exists = match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read metadata check: {e}")))?
    {
        Some(row) => {
            let count: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse metadata check: {e}"))
            })?;
            count > 0
        }
        None => false,
    };
    drop(rows);

    if exists {
        return Ok(());
    }

    conn.execute_batch(
        "CREATE TABLE db_metadata (key TEXT NOT NULL PRIMARY KEY, value TEXT);
         INSERT INTO db_metadata (key, value) VALUES ('migrations', '-1');",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create db_metadata: {e}")))?;

    info!("Initialized migration metadata");
    Ok(())
}

/// Read the stored migration counter.
pub async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT value FROM db_metadata WHERE key = 'migrations'", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration counter: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration counter: {e}")))?
        .ok_or_else(|| DatabaseError::Migration("Migration counter row is missing".into()))?;

    let value = row
        .get_value(0)
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration counter: {e}")))?;

    match value {
        libsql::Value::Integer(n) => Ok(n),
        libsql::Value::Text(s) => s.trim().parse().map_err(|_| {
            DatabaseError::Migration(format!("Migration counter is not a number: {s}"))
        }),
        other => Err(DatabaseError::Migration(format!(
            "Unexpected migration counter value: {other:?}"
        ))),
    }
}
