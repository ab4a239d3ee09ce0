use anyhow::Result;
use clap::Parser;
use console::style;

use tally_runtime::migrations::load_migrations_from_dir;
use tally_runtime::MigrationExecutor;

use super::{GlobalArgs, Session};

/// Apply pending migrations, recording each one.
#[derive(Parser, Debug)]
pub struct ApplyCommand {}

impl ApplyCommand {
    pub async fn execute(self, global: &GlobalArgs) -> Result<()> {
        let session = Session::open(global).await?;
        let dir = session.config.migrations.dir.clone();
        let files = load_migrations_from_dir(&dir)?;

        println!();
        println!(
            "  {} Migrations in {}",
            style("tally").bold().cyan(),
            style(dir.display()).cyan()
        );
        println!();

        if files.is_empty() {
            println!("  {} No migrations found", style("ℹ").blue());
            session.close().await;
            return Ok(());
        }

        let Session { db, ledger, cx, .. } = session;
        let executor = MigrationExecutor::new(ledger, db.primary().clone());

        println!("  {} Applying pending migrations...", style("→").dim());
        let result = executor.apply(&cx, &files).await;

        executor.ledger().pool().close().await;
        db.close().await;

        let applied = result?;
        if applied.is_empty() {
            println!("  {} Already up to date", style("✓").green());
        } else {
            for version in &applied {
                println!("  {} Applied: {}", style("✓").green(), version);
            }
        }
        println!();
        Ok(())
    }
}
