use chrono::NaiveDate;
use clap::{Subcommand, ValueEnum};
use horus_core::{Config, SyncMode, SyncOptions, SyncOutcome, SyncProgress, SyncResult};
use tokio::sync::mpsc;

use super::{cancel_on_ctrl_c, orchestrator, parse_date, print_json, CmdResult};

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    All,
    Latest,
    Range,
}

#[derive(Subcommand)]
pub enum SyncAction {
    /// Sync one device
    Run {
        /// Device id
        device_id: String,
        #[arg(long, value_enum, default_value = "all")]
        mode: ModeArg,
        /// First date for `--mode range`
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,
        /// Last date for `--mode range`
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,
        /// Do not print progress
        #[arg(long)]
        quiet: bool,
    },
    /// Sync every device marked for automatic sync
    Auto {
        #[arg(long, value_enum, default_value = "latest")]
        mode: ModeArg,
        #[arg(long)]
        quiet: bool,
    },
}

fn sync_mode(mode: ModeArg, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<SyncMode, String> {
    match mode {
        ModeArg::All => Ok(SyncMode::All),
        ModeArg::Latest => Ok(SyncMode::Latest),
        ModeArg::Range => match (from, to) {
            (Some(start), Some(end)) => Ok(SyncMode::Range { start, end }),
            _ => Err("--mode range needs --from and --to".to_string()),
        },
    }
}

fn progress_printer(
    mut rx: mpsc::Receiver<SyncProgress>,
    quiet: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if quiet {
                continue;
            }
            let device = if event.device_id.is_empty() { "-" } else { event.device_id.as_str() };
            if event.total > 0 {
                eprintln!(
                    "[{device}] {}: {} ({}/{})",
                    event.phase, event.message, event.current, event.total
                );
            } else {
                eprintln!("[{device}] {}: {}", event.phase, event.message);
            }
        }
    })
}

fn check(result: &SyncResult) -> CmdResult {
    match result.outcome {
        SyncOutcome::Failed => Err(format!(
            "sync of {} failed: {}",
            result.device_id,
            result.errors.join("; ")
        )
        .into()),
        SyncOutcome::Cancelled => Err(format!("sync of {} cancelled", result.device_id).into()),
        SyncOutcome::Completed => Ok(()),
    }
}

pub async fn run(action: SyncAction) -> CmdResult {
    let config = Config::load()?;
    let orch = orchestrator(&config)?;
    let cancel = cancel_on_ctrl_c();
    let (tx, rx) = orch.progress_channel();

    match action {
        SyncAction::Run {
            device_id,
            mode,
            from,
            to,
            quiet,
        } => {
            let mode = sync_mode(mode, from, to)?;
            let printer = progress_printer(rx, quiet);
            let result = orch
                .start_sync(&device_id, SyncOptions::new(mode), Some(tx), cancel)
                .await?;
            let _ = printer.await;
            print_json(&result)?;
            check(&result)?;
        }
        SyncAction::Auto { mode, quiet } => {
            let mode = sync_mode(mode, None, None)?;
            let printer = progress_printer(rx, quiet);
            let results = orch
                .sync_all_auto(SyncOptions::new(mode), Some(tx), cancel)
                .await?;
            let _ = printer.await;
            print_json(&results)?;
            for result in &results {
                check(result)?;
            }
        }
    }
    Ok(())
}
