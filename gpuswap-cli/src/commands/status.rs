//! `gpuswap status` command

use super::report_error;
use colored::Colorize;
use gpuswap_core::orchestrator::DeviceStatus;
use gpuswap_core::{ExitStatus, Orchestrator};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ADDRESS")]
    address: String,
    #[tabled(rename = "VENDOR")]
    vendor: String,
    #[tabled(rename = "DRIVER")]
    driver: String,
    #[tabled(rename = "ORIGINAL")]
    original: String,
    #[tabled(rename = "PRESENT")]
    present: String,
}

impl From<DeviceStatus> for DeviceRow {
    fn from(device: DeviceStatus) -> Self {
        let original = match device.original {
            Some(Some(driver)) => driver,
            Some(None) => "(none)".to_string(),
            None => "-".to_string(),
        };
        Self {
            address: device.address.to_string(),
            vendor: device.vendor.map_or_else(|| "-".to_string(), |v| v.to_string()),
            driver: device.driver.unwrap_or_else(|| "-".to_string()),
            original,
            present: if device.present {
                "yes".green().to_string()
            } else {
                "no".red().to_string()
            },
        }
    }
}

/// Show ledger and live bindings.
pub fn status(orchestrator: &Orchestrator) -> ExitStatus {
    let report = match orchestrator.status() {
        Ok(report) => report,
        Err(e) => {
            report_error(&e);
            return ExitStatus::Failure;
        }
    };

    let mode = if report.isolated { "isolated".yellow() } else { "host".green() };
    println!("Mode:   {}", mode.bold());
    println!("Ledger: {}", report.ledger_path.display());

    if report.devices.is_empty() {
        println!("No devices recorded or configured");
        return ExitStatus::Success;
    }

    let rows: Vec<DeviceRow> = report.devices.into_iter().map(DeviceRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::modern());

    println!("{}", table);

    ExitStatus::Success
}
