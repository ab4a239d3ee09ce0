mod apply;
mod init;
mod status;

pub use apply::ApplyCommand;
pub use init::InitCommand;
pub use status::StatusCommand;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tally_core::config::TallyConfig;
use tally_core::revision::LedgerContext;
use tally_runtime::{Database, PgRevisions};

/// tally - migration revision ledger
#[derive(Parser)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration file path.
    #[arg(short, long, default_value = "tally.toml", global = true)]
    pub config: String,

    /// Schema holding the revision table (overrides config).
    #[arg(short, long, global = true)]
    pub schema: Option<String>,

    /// Migrations directory path (overrides config).
    #[arg(short, long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create the revision schema and table.
    Init(InitCommand),

    /// Compare recorded revisions with migration files.
    Status(StatusCommand),

    /// Apply pending migrations, recording each one.
    Apply(ApplyCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        init_tracing(self.global.verbose);

        match self.command {
            Commands::Init(cmd) => cmd.execute(&self.global).await,
            Commands::Status(cmd) => cmd.execute(&self.global).await,
            Commands::Apply(cmd) => cmd.execute(&self.global).await,
        }
    }
}

fn init_tracing(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.to_string()))
        .with_target(false)
        .init();
}

/// Load configuration, preferring the config file and falling back to
/// `DATABASE_URL` when there is none. Command-line overrides are applied.
pub fn load_config(global: &GlobalArgs) -> Result<TallyConfig> {
    dotenvy::dotenv().ok();

    let config_path = Path::new(&global.config);
    let mut config = if config_path.exists() {
        TallyConfig::from_file(config_path)?
    } else {
        let url = std::env::var("DATABASE_URL").with_context(|| {
            format!(
                "Configuration file not found: {}\nCreate it or set DATABASE_URL.",
                global.config
            )
        })?;
        debug!("No {} found, using DATABASE_URL", global.config);
        TallyConfig::default_with_database_url(&url)
    };

    if let Some(schema) = &global.schema {
        config.revisions.schema = schema.clone();
    }
    if let Some(dir) = &global.migrations_dir {
        config.migrations.dir = dir.clone();
    }

    Ok(config)
}

/// An open connection to the target database and its ledger.
pub struct Session {
    pub config: TallyConfig,
    pub db: Database,
    pub ledger: PgRevisions,
    pub cx: LedgerContext,
}

impl Session {
    pub async fn open(global: &GlobalArgs) -> Result<Self> {
        let config = load_config(global)?;
        let db = Database::from_config(&config.database).await?;
        let ledger = PgRevisions::connect(&db, &config.revisions.namespace()?).await?;

        Ok(Self {
            config,
            db,
            ledger,
            cx: LedgerContext::with_cancellation(cancel_on_ctrl_c()),
        })
    }

    pub async fn close(self) {
        self.ledger.pool().close().await;
        self.db.close().await;
    }
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn global(config: &Path) -> GlobalArgs {
        GlobalArgs {
            config: config.to_string_lossy().into_owned(),
            schema: None,
            migrations_dir: None,
            verbose: false,
        }
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tally", "status", "--schema", "audit", "-v"]).unwrap();
        assert_eq!(cli.global.schema.as_deref(), Some("audit"));
        assert!(cli.global.verbose);
        assert!(matches!(cli.command, Commands::Status(_)));
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tally.toml");
        fs::write(
            &path,
            "[database]\nurl = \"postgres://localhost/app\"\n\n[revisions]\nschema = \"from_file\"\n",
        )
        .unwrap();

        let mut args = global(&path);
        let config = load_config(&args).unwrap();
        assert_eq!(config.revisions.schema, "from_file");

        args.schema = Some("from_flag".into());
        args.migrations_dir = Some(PathBuf::from("sql"));
        let config = load_config(&args).unwrap();
        assert_eq!(config.revisions.schema, "from_flag");
        assert_eq!(config.migrations.dir, PathBuf::from("sql"));
    }
}
