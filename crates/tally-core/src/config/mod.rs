mod database;

pub use database::DatabaseConfig;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TallyError};
use crate::revision::resolve_namespace;

/// Root configuration, usually read from `tally.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyConfig {
    /// Database configuration.
    pub database: DatabaseConfig,

    /// Revision ledger configuration.
    #[serde(default)]
    pub revisions: RevisionsConfig,

    /// Migration files configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

impl TallyConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TallyError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);

        toml::from_str(&content)
            .map_err(|e| TallyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Configuration with defaults for everything but the database URL.
    pub fn default_with_database_url(url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: url.to_string(),
                ..Default::default()
            },
            revisions: RevisionsConfig::default(),
            migrations: MigrationsConfig::default(),
        }
    }
}

/// Where the revision ledger lives.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RevisionsConfig {
    /// Schema holding the revision table. Empty selects the default.
    #[serde(default)]
    pub schema: String,
}

impl RevisionsConfig {
    /// The effective schema name, with the default applied.
    pub fn namespace(&self) -> Result<String> {
        resolve_namespace(&self.schema)
    }
}

/// Migration files configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding `*.sql` migration files.
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
