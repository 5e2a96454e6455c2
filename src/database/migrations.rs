//! # Database Migration System
//!
//! Applies the embedded schema with version tracking. Several daemons may start at once,
//! so the whole run happens under a PostgreSQL advisory lock:
//!
//! ```sql
//! SELECT pg_advisory_lock(7340912285561020)
//! -- apply outstanding migrations, record versions
//! SELECT pg_advisory_unlock(7340912285561020)
//! ```
//!
//! Migration files live in `migrations/` and follow `YYYYMMDDHHMMSS_description.sql`. They
//! are compiled into the binary, so the daemon does not depend on its working directory.

use sqlx::{PgPool, Row};
use std::collections::HashSet;
use tracing::info;

/// A single embedded migration
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version timestamp (YYYYMMDDHHMMSS format)
    pub version: &'static str,
    pub name: &'static str,
    pub sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: "20261018000000",
    name: "create refresh tables",
    sql: include_str!("../../migrations/20261018000000_create_refresh_tables.sql"),
}];

/// Lock key: hash of "planning_refresh_schema"
const LOCK_KEY: i64 = 7_340_912_285_561_020;

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Apply every outstanding migration in version order
    pub async fn run_all(pool: &PgPool) -> Result<(), sqlx::Error> {
        // Session-level lock: hold one connection for the whole run
        let mut conn = pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = Self::run_outstanding(&mut conn).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result
    }

    pub fn embedded() -> &'static [Migration] {
        MIGRATIONS
    }

    async fn run_outstanding(conn: &mut sqlx::PgConnection) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS planning_refresh_schema_migrations (
                version VARCHAR(14) PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(&mut *conn)
        .await?;

        let applied: HashSet<String> =
            sqlx::query("SELECT version FROM planning_refresh_schema_migrations")
                .fetch_all(&mut *conn)
                .await?
                .into_iter()
                .map(|row| row.get::<String, _>("version"))
                .collect();

        for migration in MIGRATIONS {
            if applied.contains(migration.version) {
                continue;
            }
            info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            sqlx::raw_sql(migration.sql).execute(&mut *conn).await?;
            sqlx::query("INSERT INTO planning_refresh_schema_migrations (version) VALUES ($1)")
                .bind(migration.version)
                .execute(&mut *conn)
                .await?;
        }

        Ok(())
    }
}
