use clap::Subcommand;
use horus_core::storage::devices::{list_devices, upsert_device, Device, DeviceSyncMode};
use horus_core::Config;

use super::{open_store, orchestrator, print_json, CmdResult};

#[derive(Subcommand)]
pub enum DeviceAction {
    /// Register a device or update an existing one
    Add {
        /// Device id
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// IPv4 address
        #[arg(long)]
        ip: String,
        #[arg(long, default_value_t = 4370)]
        port: u16,
        /// Numeric communication key
        #[arg(long)]
        comm_key: Option<String>,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Include in `sync auto`
        #[arg(long)]
        auto: bool,
    },
    /// List registered devices
    List,
    /// Connect, read device info and disconnect
    Test {
        /// Device id
        id: String,
    },
    /// Show serial number, firmware and record counts
    Info {
        /// Device id
        id: String,
    },
}

pub async fn run(action: DeviceAction) -> CmdResult {
    let config = Config::load()?;
    match action {
        DeviceAction::Add {
            id,
            name,
            ip,
            port,
            comm_key,
            timezone,
            auto,
        } => {
            let store = open_store(&config)?;
            let mut device = Device::new(id, name, ip);
            device.port = port;
            device.comm_key = comm_key.unwrap_or_default();
            device.timezone = timezone;
            device.sync_mode = if auto {
                DeviceSyncMode::Auto
            } else {
                DeviceSyncMode::Manual
            };
            horus_core::device::validate_config(&device.connection_config(config.device.timeout_ms))?;
            upsert_device(&store, &device).await?;
            println!("ok");
        }
        DeviceAction::List => {
            let store = open_store(&config)?;
            print_json(&list_devices(&store).await?)?;
        }
        DeviceAction::Test { id } => {
            let result = orchestrator(&config)?.test_connection(&id).await?;
            print_json(&result)?;
            if !result.success {
                return Err(result
                    .error
                    .unwrap_or_else(|| "connection test failed".to_string())
                    .into());
            }
        }
        DeviceAction::Info { id } => {
            print_json(&orchestrator(&config)?.device_info(&id).await?)?;
        }
    }
    Ok(())
}
