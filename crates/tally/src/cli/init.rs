use anyhow::Result;
use clap::Parser;
use console::style;

use tally_core::revision::RevisionReadWriter;

use super::{GlobalArgs, Session};

/// Create the revision schema and table.
#[derive(Parser, Debug)]
pub struct InitCommand {}

impl InitCommand {
    pub async fn execute(self, global: &GlobalArgs) -> Result<()> {
        let session = Session::open(global).await?;

        session.ledger.init(&session.cx).await?;
        println!(
            "  {} Revision table ready in schema {}",
            style("✓").green(),
            style(session.ledger.namespace()).cyan()
        );

        session.close().await;
        Ok(())
    }
}
