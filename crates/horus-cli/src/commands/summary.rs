use chrono::NaiveDate;
use clap::Subcommand;
use horus_core::storage::summaries::list_summaries;
use horus_core::Config;

use super::{cancel_on_ctrl_c, open_store, orchestrator, parse_date, print_json, CmdResult};

#[derive(Subcommand)]
pub enum SummaryAction {
    /// List summaries between two dates (inclusive)
    List {
        #[arg(value_parser = parse_date)]
        from: NaiveDate,
        #[arg(value_parser = parse_date)]
        to: NaiveDate,
    },
    /// Recompute summaries with the current rules
    Rebuild {
        #[arg(value_parser = parse_date)]
        from: NaiveDate,
        #[arg(value_parser = parse_date)]
        to: NaiveDate,
    },
}

pub async fn run(action: SummaryAction) -> CmdResult {
    let config = Config::load()?;
    match action {
        SummaryAction::List { from, to } => {
            let store = open_store(&config)?;
            print_json(&list_summaries(&store, from, to).await?)?;
        }
        SummaryAction::Rebuild { from, to } => {
            let outcome = orchestrator(&config)?
                .rebuild_summaries(from, to, None, cancel_on_ctrl_c())
                .await?;
            print_json(&outcome)?;
            if outcome.cancelled {
                return Err("rebuild cancelled".into());
            }
        }
    }
    Ok(())
}
