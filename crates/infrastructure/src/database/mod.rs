pub mod sqlite;

pub use sqlite::SqliteTaskRepository;

use anyhow::{Context, Result};
use mediaflow_config::DatabaseConfig;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// 数据库连接池管理
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("连接数据库: {}", config.url);

        let options = SqliteConnectOptions::from_str(&config.url)
            .context("解析数据库URL失败")?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await
            .context("连接数据库失败")?;

        let manager = Self { pool };
        if config.run_migrations {
            manager.migrate().await?;
        }

        info!("数据库连接成功");
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("运行数据库迁移失败")?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
