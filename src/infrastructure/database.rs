use crate::config::{DatabaseConfig, RetryPolicy};
use crate::entities::files;
use crate::utils::retry::retry_connect;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Schema};
use std::time::Duration;
use tracing::info;

pub async fn setup_database(
    config: &DatabaseConfig,
    retry: RetryPolicy,
) -> anyhow::Result<DatabaseConnection> {
    info!("📂 Database: {}", config.url.split('@').next_back().unwrap_or(""));

    let mut opt = ConnectOptions::new(&config.url);
    opt.max_connections(config.max_connections)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = retry_connect(retry, "Database", || Database::connect(opt.clone())).await?;

    info!("✅ Database connected successfully");

    run_migrations(&db).await?;

    Ok(db)
}

/// PostgreSQL gets the versioned SQL migrations; other backends (SQLite in
/// tests and local runs) get the table derived from the entity.
pub async fn run_migrations(db: &DatabaseConnection) -> anyhow::Result<()> {
    let builder = db.get_database_backend();

    if builder == DatabaseBackend::Postgres {
        info!("🔄 Running SQLx migrations for PostgreSQL...");
        sqlx::migrate!("./migrations")
            .run(db.get_postgres_connection_pool())
            .await?;
        return Ok(());
    }

    info!("🔄 Running SeaORM auto-migrations...");
    let schema = Schema::new(builder);
    let stmt = schema
        .create_table_from_entity(files::Entity)
        .if_not_exists()
        .to_owned();
    db.execute(builder.build(&stmt)).await?;
    info!("   - Table 'files' checked/created");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[tokio::test]
    async fn test_sqlite_migrations_are_idempotent() {
        let config = AppConfig::development();
        let db = setup_database(&config.database, config.retry).await.unwrap();
        run_migrations(&db).await.unwrap();
        assert_eq!(db.get_database_backend(), DatabaseBackend::Sqlite);
    }
}
