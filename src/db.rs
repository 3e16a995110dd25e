use crate::config::AppConfig;
use crate::error::LoadError;
use log::LevelFilter;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, Executor, PgPool};

/// Connection options for the configured database. Statement logging is off;
/// every insert would otherwise be logged.
pub fn connect_options(config: &AppConfig) -> Result<PgConnectOptions, LoadError> {
    let options = PgConnectOptions::new()
        .host(&config.db_address)
        .port(config.port()?)
        .username(&config.db_user)
        .password(&config.db_pass)
        .database(&config.db_name)
        .application_name("bulkload")
        .log_statements(LevelFilter::Off);

    Ok(options)
}

/// Pool sizing derived from the configuration.
///
/// There is no idle cap in the pool, so `db_max_idle_conns` becomes the
/// number of connections kept open while idle.
pub fn pool_options(config: &AppConfig) -> PgPoolOptions {
    let options = PgPoolOptions::new()
        .max_connections(config.db_max_open_conns)
        .min_connections(config.db_max_idle_conns.min(config.db_max_open_conns))
        .acquire_timeout(config.acquire_timeout());

    if config.synchronous_commit {
        return options;
    }

    options.after_connect(|conn, _meta| {
        Box::pin(async move {
            // Each insert commits on its own; skip the WAL flush wait.
            conn.execute("SET synchronous_commit = 'off'").await?;
            Ok(())
        })
    })
}

/// Open the shared pool and make sure the server is reachable.
pub async fn open_pool(config: &AppConfig) -> Result<PgPool, LoadError> {
    let pool = pool_options(config)
        .connect_with(connect_options(config)?)
        .await?;

    log::info!(
        "connected to {} (max {} connections, {} kept idle)",
        config.redacted_url(),
        config.db_max_open_conns,
        config.db_max_idle_conns
    );

    Ok(pool)
}
