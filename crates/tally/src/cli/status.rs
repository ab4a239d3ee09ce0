use anyhow::Result;
use clap::Parser;
use console::style;

use tally_core::revision::{ExecutionState, Revision, RevisionReadWriter};
use tally_runtime::migrations::{load_migrations_from_dir, MigrationStatus};
use tally_runtime::MigrationExecutor;

use super::{GlobalArgs, Session};

/// Compare recorded revisions with migration files.
#[derive(Parser, Debug)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn execute(self, global: &GlobalArgs) -> Result<()> {
        let session = Session::open(global).await?;
        let files = load_migrations_from_dir(&session.config.migrations.dir)?;

        let Session {
            config: _,
            db,
            ledger,
            cx,
        } = session;
        let namespace = ledger.namespace().to_string();
        let executor = MigrationExecutor::new(ledger, db.primary().clone());
        let status = executor.status(&cx, &files).await?;

        println!();
        println!(
            "  {} Revisions in {}",
            style("tally").bold().cyan(),
            style(&namespace).cyan()
        );
        println!();
        print_status(&status);

        executor.ledger().pool().close().await;
        db.close().await;
        Ok(())
    }
}

fn print_status(status: &MigrationStatus) {
    if status.applied.is_empty()
        && status.pending.is_empty()
        && status.failed.is_empty()
        && status.drifted.is_empty()
        && status.unknown.is_empty()
    {
        println!("  {} No migrations found", style("ℹ").blue());
        println!();
        return;
    }

    if !status.applied.is_empty() {
        println!("  {} Applied:", style("✓").green());
        for rev in &status.applied {
            print_revision(rev);
        }
    }

    if !status.failed.is_empty() {
        println!("  {} Failed or interrupted:", style("✗").red());
        for rev in &status.failed {
            print_revision(rev);
        }
    }

    if !status.drifted.is_empty() {
        println!("  {} Modified after apply:", style("!").yellow());
        for drift in &status.drifted {
            println!(
                "    {} {} {} → {}",
                style("→").dim(),
                style(&drift.version).yellow(),
                style(short_hash(&drift.recorded)).dim(),
                style(short_hash(&drift.current)).dim()
            );
        }
    }

    if !status.pending.is_empty() {
        println!("  {} Pending:", style("○").yellow());
        for version in &status.pending {
            println!("    {} {}", style("→").dim(), style(version).yellow());
        }
    }

    if !status.unknown.is_empty() {
        println!("  {} Recorded but missing on disk:", style("?").dim());
        for rev in &status.unknown {
            print_revision(rev);
        }
    }

    println!();
    println!(
        "  {} {} applied, {} pending, {} failed, {} modified",
        style("ℹ").blue(),
        status.applied.len(),
        status.pending.len(),
        status.failed.len(),
        status.drifted.len()
    );
    println!();
}

fn print_revision(rev: &Revision) {
    let state = match rev.execution_state {
        ExecutionState::Ok => style(rev.execution_state.as_str()).green(),
        ExecutionState::Error => style(rev.execution_state.as_str()).red(),
        _ => style(rev.execution_state.as_str()).yellow(),
    };
    println!(
        "    {} {} [{}] {} ({} ms)",
        style("→").dim(),
        style(&rev.version).cyan(),
        state,
        style(rev.executed_at.format("%Y-%m-%d %H:%M:%S")).dim(),
        rev.execution_time.as_millis()
    );
    if let Some(error) = rev.meta.get("error").and_then(|v| v.as_str()) {
        println!("      {}", style(error).red());
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
