//! Explicit database provisioning for ledger integration tests.
//!
//! Only `TEST_DATABASE_URL` is consulted, never `DATABASE_URL`, so tests can't
//! wander into a real target database. Tests that need Postgres call
//! [`TestDatabase::try_from_env`] and return early when it yields `None`.

use sqlx::PgPool;

use crate::error::{Result, TallyError};

/// Environment variable naming the server used by integration tests.
pub const TEST_DATABASE_URL_VAR: &str = "TEST_DATABASE_URL";

/// Handle on the test server's maintenance database.
pub struct TestDatabase {
    pool: PgPool,
    url: String,
}

impl TestDatabase {
    /// Connect to database at the given URL.
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(url)
            .await
            .map_err(|e| TallyError::Config(format!("Failed to connect test database: {}", e)))?;

        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    /// Connect using `TEST_DATABASE_URL`, or `None` when it is not set.
    pub async fn try_from_env() -> Result<Option<Self>> {
        match std::env::var(TEST_DATABASE_URL_VAR) {
            Ok(url) if !url.is_empty() => Ok(Some(Self::from_url(&url).await?)),
            _ => {
                tracing::warn!("{} not set, skipping database test", TEST_DATABASE_URL_VAR);
                Ok(None)
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Creates a dedicated database for a single test.
    pub async fn isolated(&self, test_name: &str) -> Result<IsolatedTestDb> {
        // UUID suffix keeps parallel tests apart
        let db_name = format!(
            "tally_test_{}_{}",
            sanitize_db_name(test_name),
            uuid::Uuid::new_v4().simple()
        );

        sqlx::query(&format!("CREATE DATABASE \"{}\"", db_name))
            .execute(&self.pool)
            .await
            .map_err(|e| TallyError::Config(format!("Failed to create test database: {}", e)))?;

        Ok(IsolatedTestDb {
            url: replace_db_name(&self.url, &db_name),
            db_name,
            base_url: self.url.clone(),
        })
    }
}

/// A database that exists for the lifetime of a single test.
pub struct IsolatedTestDb {
    url: String,
    db_name: String,
    base_url: String,
}

impl IsolatedTestDb {
    /// Connection URL of the isolated database.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Drop the database. Connections to it are terminated first.
    pub async fn cleanup(self) -> Result<()> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.base_url)
            .await
            .map_err(|e| TallyError::Config(format!("Failed to connect test database: {}", e)))?;

        let _ = sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1",
        )
        .bind(&self.db_name)
        .execute(&pool)
        .await;

        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\"", self.db_name))
            .execute(&pool)
            .await
            .map_err(|e| TallyError::Config(format!("Failed to drop test database: {}", e)))?;

        pool.close().await;
        Ok(())
    }
}

/// Sanitize a test name for use in a database name.
fn sanitize_db_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(24)
        .collect()
}

/// Replace the database name in a connection URL.
fn replace_db_name(url: &str, new_db: &str) -> String {
    let (base, query) = match url.find('?') {
        Some(idx) => (&url[..idx], &url[idx..]),
        None => (url, ""),
    };
    let scheme_end = base.find("://").map(|i| i + 3).unwrap_or(0);
    match base[scheme_end..].rfind('/') {
        Some(idx) => format!("{}/{}{}", &base[..scheme_end + idx], new_db, query),
        None => format!("{}/{}{}", base, new_db, query),
    }
}
