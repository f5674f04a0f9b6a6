use crate::config::Config;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::{error, info};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Create the PostgreSQL pool and verify it with a round trip
pub async fn init_pool(config: &Config) -> Result<Pool<Postgres>, sqlx::Error> {
    let database_url = config.database_url.as_deref().unwrap_or_default();

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(1)
        // Timeout for acquiring a connection from the pool
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    match tokio::time::timeout(
        Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(&pool),
    )
    .await
    {
        Ok(Ok(_)) => {
            info!(
                max_connections = config.db_max_connections,
                "Database pool created and verified"
            );
            Ok(pool)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Database connection verification failed");
            Err(e)
        }
        Err(_) => {
            error!("Database connection verification timeout");
            Err(sqlx::Error::PoolTimedOut)
        }
    }
}
