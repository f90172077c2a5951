//! Session-store schema migrations.
//!
//! An ordered list applied under the instance startup barrier, inside one
//! transaction, and recorded in `migration_ledger`. Entries are append-only:
//! never re-run, never reordered.

use crate::Result;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

pub struct Migration {
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_initial",
        statements: &[
            "CREATE TABLE chat_sessions (
                id TEXT PRIMARY KEY,
                workspace_id TEXT,
                task_id TEXT,
                topic TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                message_count INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL,
                ended_at INTEGER
            )",
            "CREATE TABLE chat_messages (
                id TEXT NOT NULL,
                session_id TEXT NOT NULL REFERENCES chat_sessions(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_metadata TEXT,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, id)
            )",
            "CREATE TABLE do_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        ],
    },
    Migration {
        name: "0002_activity_events",
        statements: &[
            "CREATE TABLE activity_events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                actor_type TEXT NOT NULL,
                actor_id TEXT,
                workspace_id TEXT,
                session_id TEXT,
                task_id TEXT,
                payload TEXT,
                created_at INTEGER NOT NULL
            )",
            "CREATE INDEX idx_activity_created ON activity_events(created_at)",
        ],
    },
    Migration {
        name: "0003_idle_cleanup_schedules",
        statements: &[
            "CREATE TABLE idle_cleanup_schedules (
                session_id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                task_id TEXT,
                cleanup_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
        ],
    },
    Migration {
        name: "0004_agent_completion",
        statements: &[
            "ALTER TABLE chat_sessions ADD COLUMN agent_completed_at INTEGER",
            "ALTER TABLE chat_sessions ADD COLUMN suspended_at INTEGER",
        ],
    },
    Migration {
        name: "0005_message_session_index",
        statements: &[
            "CREATE INDEX idx_messages_session_created ON chat_messages(session_id, created_at)",
        ],
    },
];

/// Apply every unapplied migration, oldest first.
pub async fn apply_migrations(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migration_ledger (
            name TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;

    let applied: Vec<String> = sqlx::query("SELECT name FROM migration_ledger")
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get("name"))
        .collect();

    for migration in MIGRATIONS {
        if applied.iter().any(|name| name == migration.name) {
            debug!("Migration {} already applied", migration.name);
            continue;
        }
        info!("Applying session-store migration {}", migration.name);
        for statement in migration.statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO migration_ledger (name, applied_at) VALUES (?1, ?2)")
            .bind(migration.name)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}
