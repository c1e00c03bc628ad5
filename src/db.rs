use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Alias kept so service signatures stay stable if the pool type ever
/// changes.
pub type DbPool = DatabaseConnection;

/// Pool tuning lifted out of [`AppConfig`] into the units sea-orm wants.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub statement_timeout: Option<Duration>,
}

impl From<&AppConfig> for PoolSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
            statement_timeout: cfg.db_statement_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl PoolSettings {
    fn connect_options(&self) -> ConnectOptions {
        let mut opt = ConnectOptions::new(self.url.clone());
        opt.max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .connect_timeout(self.connect_timeout)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
            .sqlx_logging(true);
        // TODO: set statement_timeout once sea-orm's ConnectOptions exposes it
        let _ = self.statement_timeout;
        opt
    }
}

/// Opens the connection pool described by the application config.
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let settings = PoolSettings::from(cfg);
    debug!(?settings, "Opening database pool");
    gauge!(
        "tradebook_db.max_connections",
        settings.max_connections as f64
    );

    let pool = Database::connect(settings.connect_options())
        .await
        .map_err(|e| {
            error!("Could not open the database pool: {}", e);
            ServiceError::DatabaseError(e)
        })?;

    info!(
        max_connections = settings.max_connections,
        "Database pool ready"
    );
    Ok(pool)
}

/// Brings the schema up to date with the embedded migrator.
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    info!("Applying pending migrations");
    let started = Instant::now();

    match crate::migrator::Migrator::up(pool, None).await {
        Ok(()) => {
            info!("Migrations applied in {:?}", started.elapsed());
            Ok(())
        }
        Err(e) => {
            error!("Migration run failed after {:?}: {}", started.elapsed(), e);
            Err(ServiceError::DatabaseError(e))
        }
    }
}

/// Pings the database, recording round-trip latency on success and a
/// failure counter otherwise.
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    let started = Instant::now();

    match pool.ping().await {
        Ok(()) => {
            let elapsed = started.elapsed();
            debug!("Database ping answered in {:?}", elapsed);
            gauge!(
                "tradebook_db.connection_latency",
                elapsed.as_millis() as f64
            );
            Ok(())
        }
        Err(e) => {
            error!("Database ping failed after {:?}: {}", started.elapsed(), e);
            counter!("tradebook_db.connection_failures", 1);
            Err(ServiceError::DatabaseError(e))
        }
    }
}

/// Shuts the pool down, waiting for checked-out connections to return.
pub async fn close_pool(pool: DbPool) -> Result<(), ServiceError> {
    info!("Draining database pool");
    pool.close().await.map_err(ServiceError::DatabaseError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_settings_follow_the_app_config() {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            0,
            "development".into(),
        );
        cfg.db_max_connections = 7;
        cfg.db_min_connections = 3;
        cfg.db_statement_timeout_secs = Some(12);

        let settings = PoolSettings::from(&cfg);
        assert_eq!(settings.url, "sqlite::memory:");
        assert_eq!(settings.max_connections, 7);
        assert_eq!(settings.min_connections, 3);
        assert_eq!(
            settings.connect_timeout,
            Duration::from_secs(cfg.db_connect_timeout_secs)
        );
        assert_eq!(settings.statement_timeout, Some(Duration::from_secs(12)));
    }
}
