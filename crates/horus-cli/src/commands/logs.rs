use chrono::NaiveDate;
use clap::Subcommand;
use horus_core::storage::punches::{count_punches, query_punches, PunchQuery, PunchSort};
use horus_core::Config;

use super::{open_store, parse_date, print_json, CmdResult};

fn parse_sort(s: &str) -> Result<PunchSort, String> {
    PunchSort::parse(s).ok_or_else(|| format!("unknown sort column '{s}' (timestamp, user, device)"))
}

#[derive(Subcommand)]
pub enum LogsAction {
    /// List stored punches
    List {
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,
        /// Only this device
        #[arg(long)]
        device: Option<String>,
        /// Only this device user id
        #[arg(long)]
        user: Option<String>,
        #[arg(long, value_parser = parse_sort, default_value = "timestamp")]
        sort: PunchSort,
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Count stored punches
    Count {
        #[arg(long)]
        device: Option<String>,
    },
}

pub async fn run(action: LogsAction) -> CmdResult {
    let config = Config::load()?;
    let store = open_store(&config)?;
    match action {
        LogsAction::List {
            from,
            to,
            device,
            user,
            sort,
            desc,
            limit,
            offset,
        } => {
            let query = PunchQuery {
                date_from: from,
                date_to: to,
                device_id: device,
                device_user_id: user,
                sort,
                descending: desc,
                limit,
                offset,
            };
            print_json(&query_punches(&store, &query).await?)?;
        }
        LogsAction::Count { device } => {
            println!("{}", count_punches(&store, device.as_deref()).await?);
        }
    }
    Ok(())
}
