use anyhow::{Context, Result};
use portyo_migration::Migrator;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::info;

/// 建立连接池并把 `custom_domain_entity` 迁移到最新
pub async fn init_db(database_url: &str, max_connections: u32) -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(database_url.to_string());
    options
        .max_connections(max_connections.max(2))
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .sqlx_logging(false);

    let db = Database::connect(options)
        .await
        .context("connecting to DATABASE_URL")?;

    let pending = Migrator::get_pending_migrations(&db).await?;
    if !pending.is_empty() {
        info!(count = pending.len(), "applying custom domain migrations");
    }
    Migrator::up(&db, None).await.context("running migrations")?;
    Ok(db)
}
