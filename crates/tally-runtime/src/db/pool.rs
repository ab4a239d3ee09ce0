use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use tally_core::config::DatabaseConfig;
use tally_core::error::{Result, TallyError};

/// Connection to the target database.
#[derive(Clone)]
pub struct Database {
    primary: PgPool,
    config: DatabaseConfig,
}

impl Database {
    /// Create a new database connection from configuration.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let options = Self::connect_options(config)?;
        let primary = Self::pool_options(config)
            .connect_with(options)
            .await
            .map_err(|e| TallyError::Config(format!("Failed to connect to database: {}", e)))?;

        Ok(Self {
            primary,
            config: config.clone(),
        })
    }

    /// Parse the configured URL.
    fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
        PgConnectOptions::from_str(&config.url)
            .map_err(|e| TallyError::Config(format!("Invalid database URL: {}", e)))
    }

    fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.pool_size.max(1))
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
    }

    /// Open a separate pool whose sessions resolve unqualified names in `schema`.
    ///
    /// Reuses the base connection's host, credentials and database. Sessions
    /// also get the configured statement timeout, which the primary pool does
    /// not carry.
    pub async fn scoped_pool(&self, schema: &str) -> sqlx::Result<PgPool> {
        let options = ledger_session_options(&self.primary.connect_options(), schema, &self.config);

        Self::pool_options(&self.config)
            .connect_with(options)
            .await
    }

    /// Get the primary pool.
    pub fn primary(&self) -> &PgPool {
        &self.primary
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        self.primary.close().await;
    }
}

/// Session settings for a ledger connection: `search_path` pinned to
/// `schema` plus the statement timeout. Any `search_path` already present on
/// `base` is overridden since the later `-c` setting wins.
fn ledger_session_options(
    base: &PgConnectOptions,
    schema: &str,
    config: &DatabaseConfig,
) -> PgConnectOptions {
    let mut settings = vec![("search_path", search_path_value(schema))];
    if config.statement_timeout_secs > 0 {
        settings.push((
            "statement_timeout",
            format!("{}s", config.statement_timeout_secs),
        ));
    }
    base.clone().options(settings)
}

/// `search_path` value naming exactly one schema.
///
/// The server splits the startup options string on whitespace, so spaces
/// and backslashes are backslash-escaped on top of identifier quoting.
fn search_path_value(schema: &str) -> String {
    let quoted = format!("\"{}\"", schema.replace('"', "\"\""));
    let mut escaped = String::with_capacity(quoted.len());
    for c in quoted.chars() {
        if c == '\\' || c.is_whitespace() {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
