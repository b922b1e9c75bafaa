use clap::Subcommand;
use horus_core::storage::settings::{delete_setting, get_setting, load_rule_set, set_setting};
use horus_core::Config;

use super::{open_store, print_json, CmdResult};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key (e.g. "sync.latest_overlap_days", "device.timeout_ms")
        key: String,
    },
    /// Set a config value
    Set {
        /// Config key
        key: String,
        /// New value
        value: String,
    },
    /// List all config values
    List,
    /// Reset config to defaults
    Reset,
    /// Show the attendance rules in effect (config plus stored overrides)
    Rules,
    /// Store a rule override in the database (e.g. "late_grace_period" "10")
    SetRule {
        key: String,
        value: String,
    },
}

pub async fn run(action: ConfigAction) -> CmdResult {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            match config.get(&key) {
                Some(value) => println!("{value}"),
                None => return Err(format!("unknown key: {key}").into()),
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            println!("ok");
        }
        ConfigAction::List => {
            print_json(&Config::load()?)?;
        }
        ConfigAction::Reset => {
            Config::default().save()?;
            println!("config reset to defaults");
        }
        ConfigAction::Rules => {
            let config = Config::load()?;
            let store = open_store(&config)?;
            print_json(&load_rule_set(&store, &config.rules).await?)?;
        }
        ConfigAction::SetRule { key, value } => {
            let config = Config::load()?;
            let store = open_store(&config)?;
            let previous = get_setting(&store, &key).await?;
            set_setting(&store, &key, &value).await?;
            // Reject values the rule set cannot use.
            if let Err(e) = load_rule_set(&store, &config.rules).await {
                match previous {
                    Some(old) => set_setting(&store, &key, &old).await?,
                    None => delete_setting(&store, &key).await?,
                }
                return Err(e.into());
            }
            println!("ok");
        }
    }
    Ok(())
}
