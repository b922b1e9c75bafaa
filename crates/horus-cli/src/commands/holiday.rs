use chrono::NaiveDate;
use clap::Subcommand;
use horus_core::storage::holidays::{add_holiday, list_holidays};
use horus_core::Config;

use super::{open_store, parse_date, print_json, CmdResult};

#[derive(Subcommand)]
pub enum HolidayAction {
    /// Add a holiday, or rename an existing one
    Add {
        #[arg(value_parser = parse_date)]
        date: NaiveDate,
        /// Optional label
        name: Option<String>,
    },
    /// List holidays
    List,
}

pub async fn run(action: HolidayAction) -> CmdResult {
    let config = Config::load()?;
    let store = open_store(&config)?;
    match action {
        HolidayAction::Add { date, name } => {
            add_holiday(&store, date, name.as_deref()).await?;
            println!("ok");
        }
        HolidayAction::List => print_json(&list_holidays(&store).await?)?,
    }
    Ok(())
}
