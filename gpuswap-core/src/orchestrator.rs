//! The two top-level operations: acquire devices for isolation and release
//! them back to the host.
//!
//! # Acquire
//!
//! 1. Validate and resolve every device
//! 2. Refuse if the ledger says devices are already isolated (unless forced)
//! 3. Load the isolation driver
//! 4. Evict holders of the union of device nodes
//! 5. For each device in order: record its driver, then rebind it
//! 6. Grant the consumer access to the VFIO group nodes
//!
//! # Release
//!
//! Every ledger record is attempted once. The ledger is deleted only if all of
//! them come back; otherwise it is left in place for a retry.

use crate::config::Config;
use crate::context::{CancelFlag, ExecutionContext};
use crate::error::{Result, SwapError};
use crate::evict::{Consent, EvictionPolicy, Evictor, Freed, ProcessTable, Procfs, TimedPrompt};
use crate::ledger::{TransferLedger, TransferRecord};
use crate::service::{restart_companion, ServiceManager, Systemd};
use crate::vfio::address::validate_all;
use crate::vfio::group::{grant_access, group_node_paths};
use crate::vfio::vendor::expected_driver;
use crate::vfio::{
    ConsumerIdentity, DeviceControl, DeviceDescriptor, DeviceRegistry, Direction, PciAddress,
    RebindEngine, RebindOutcome, RebindPolicy, SysfsControl, Vendor,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{error, info, instrument, warn};

/// Overall result handed back to the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    pub fn is_success(self) -> bool {
        self == ExitStatus::Success
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => std::process::ExitCode::SUCCESS,
            ExitStatus::Failure => std::process::ExitCode::FAILURE,
        }
    }
}

/// Plain values the orchestrator needs from configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub isolation_driver: String,
    pub ledger_path: PathBuf,
    pub consumer: ConsumerIdentity,
    pub companion_service: Option<String>,
    pub restart_service_on_acquire: bool,
    /// Used when no devices are given, and for forced release without a ledger.
    pub default_devices: Vec<String>,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            isolation_driver: config.isolation_driver.clone(),
            ledger_path: config.ledger_path.clone(),
            consumer: config.consumer(),
            companion_service: config.companion_service.clone(),
            restart_service_on_acquire: config.restart_service_on_acquire,
            default_devices: config.devices.clone(),
        }
    }
}

/// Poll budgets for both engines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Policies {
    pub rebind: RebindPolicy,
    pub eviction: EvictionPolicy,
}

impl Policies {
    pub fn immediate() -> Self {
        Self { rebind: RebindPolicy::immediate(), eviction: EvictionPolicy::immediate() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireReport {
    /// Devices now on the isolation driver, in order.
    pub devices: Vec<PciAddress>,
    pub freed: Freed,
    pub group_nodes: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub address: PciAddress,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub restored: Vec<(PciAddress, RebindOutcome)>,
    pub failed: Vec<DeviceFailure>,
    pub ledger_cleared: bool,
}

/// Live state of one device for `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub address: PciAddress,
    pub present: bool,
    pub vendor: Option<Vendor>,
    pub driver: Option<String>,
    /// Driver recorded in the ledger, if the device is in it.
    pub original: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub ledger_path: PathBuf,
    pub isolated: bool,
    pub devices: Vec<DeviceStatus>,
}

/// Sequences validation, eviction, rebinding and the ledger.
pub struct Orchestrator {
    registry: DeviceRegistry,
    control: Box<dyn DeviceControl>,
    processes: Box<dyn ProcessTable>,
    consent: Box<dyn Consent>,
    services: Box<dyn ServiceManager>,
    settings: Settings,
    policies: Policies,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new(
        registry: DeviceRegistry,
        control: Box<dyn DeviceControl>,
        processes: Box<dyn ProcessTable>,
        consent: Box<dyn Consent>,
        services: Box<dyn ServiceManager>,
        settings: Settings,
    ) -> Self {
        Self {
            registry,
            control,
            processes,
            consent,
            services,
            settings,
            policies: Policies::default(),
            cancel: CancelFlag::new(),
        }
    }

    /// Wire up the real sysfs, procfs, terminal prompt and systemd.
    pub fn system(config: &Config) -> Self {
        let registry = DeviceRegistry::new(&config.sysfs_root, &config.dev_root);
        Self::new(
            registry.clone(),
            Box::new(SysfsControl::new(registry)),
            Box::new(Procfs::new(&config.proc_root)),
            Box::new(TimedPrompt::new(config.consent_timeout())),
            Box::new(Systemd),
            Settings::from_config(config),
        )
    }

    pub fn with_policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!("Cancelled; leaving ledger and device state as they are. Run release to recover");
            return Err(SwapError::Cancelled);
        }
        Ok(())
    }

    fn resolve_devices(&self, specs: &[String]) -> Result<Vec<DeviceDescriptor>> {
        let specs = if specs.is_empty() { &self.settings.default_devices[..] } else { specs };
        if specs.is_empty() {
            return Err(SwapError::InvalidConfig {
                reason: "no devices given on the command line or in the config".to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        let addresses: Vec<PciAddress> =
            validate_all(specs)?.into_iter().filter(|a| seen.insert(a.clone())).collect();
        addresses.iter().map(|a| self.registry.resolve(a)).collect()
    }

    /// Move devices from their host drivers to the isolation driver.
    #[instrument(skip(self, ctx), fields(dry_run = ctx.dry_run))]
    pub fn acquire_for_isolation(&self, specs: &[String], ctx: &ExecutionContext) -> ExitStatus {
        match self.try_acquire(specs, ctx) {
            Ok(report) => {
                info!(devices = ?report.devices, "Devices ready for passthrough");
                ExitStatus::Success
            }
            Err(e) => {
                error!(error = %e, "Acquire failed");
                ExitStatus::Failure
            }
        }
    }

    pub fn try_acquire(&self, specs: &[String], ctx: &ExecutionContext) -> Result<AcquireReport> {
        let devices = self.resolve_devices(specs)?;
        let ledger_path = &self.settings.ledger_path;
        let isolation = self.settings.isolation_driver.as_str();

        let already_active = TransferLedger::is_active(ledger_path)?;
        if already_active && !ctx.force {
            return Err(SwapError::AlreadyIsolated { path: ledger_path.clone() });
        }

        let mut nodes = BTreeSet::new();
        for device in &devices {
            info!(
                address = %device.address,
                device = %device.display_name(),
                driver = ?device.driver,
                expected = ?expected_driver(device.vendor),
                nodes = device.nodes.len(),
                "Acquiring device"
            );
            if device.is_boot_vga {
                warn!(
                    address = %device.address,
                    "Device is the boot VGA device; the console may go dark"
                );
            }
            nodes.extend(device.nodes.iter().cloned());
        }

        if ctx.dry_run {
            if !self.control.driver_available(isolation) {
                info!(driver = %isolation, "[dry-run] Would load isolation driver");
            }
        } else {
            self.control.load_driver(isolation)?;
        }

        self.check_cancel()?;
        let evictor =
            Evictor::new(self.processes.as_ref(), self.consent.as_ref(), self.policies.eviction);
        let freed = evictor.evict(&nodes, ctx)?;

        self.check_cancel()?;
        let mut ledger = if ctx.dry_run || already_active {
            TransferLedger::open(ledger_path)?
        } else {
            TransferLedger::initialize_empty(ledger_path)?
        };

        let engine = RebindEngine::new(self.control.as_ref(), self.policies.rebind);
        let mut acquired = Vec::with_capacity(devices.len());

        for device in &devices {
            self.check_cancel()?;
            let address = &device.address;
            let current = self.control.current_driver(address)?;

            if current.as_deref() == Some(isolation) && ledger.get(address).is_none() {
                info!(address = %address, "Device already on isolation driver; not recording");
            } else if ctx.dry_run {
                info!(
                    address = %address,
                    driver = ?current,
                    "[dry-run] Would record original driver"
                );
            } else {
                ledger.append(TransferRecord::new(address.clone(), current))?;
            }

            if let Err(e) = engine.rebind(address, Some(isolation), Direction::ToIsolation, ctx) {
                let remaining: Vec<String> = devices
                    .iter()
                    .skip_while(|d| &d.address != address)
                    .skip(1)
                    .map(|d| d.address.to_string())
                    .collect();
                error!(
                    address = %address,
                    error = %e,
                    skipped = ?remaining,
                    ledger = %ledger.path().display(),
                    "Rebind failed; run release to restore recorded devices"
                );
                return Err(e);
            }
            acquired.push(address.clone());
        }

        let group_nodes =
            group_node_paths(&self.registry, &acquired, &self.policies.rebind.bind_forward, ctx)?;
        grant_access(&group_nodes, &self.settings.consumer, ctx)?;

        if self.settings.restart_service_on_acquire {
            restart_companion(
                self.services.as_ref(),
                self.settings.companion_service.as_deref(),
                ctx,
            );
        }

        Ok(AcquireReport { devices: acquired, freed, group_nodes })
    }

    /// Return every recorded device to its original driver.
    #[instrument(skip(self, ctx), fields(dry_run = ctx.dry_run))]
    pub fn release_to_host(&self, ctx: &ExecutionContext) -> ExitStatus {
        match self.try_release(ctx) {
            Ok(report) if report.failed.is_empty() => {
                info!(devices = report.restored.len(), "Devices returned to host");
                ExitStatus::Success
            }
            Ok(report) => {
                let devices: Vec<String> =
                    report.failed.iter().map(|f| f.address.to_string()).collect();
                let err = SwapError::ReleaseIncomplete { devices };
                error!(
                    error = %err,
                    ledger = %self.settings.ledger_path.display(),
                    "Ledger preserved for retry"
                );
                ExitStatus::Failure
            }
            Err(e) => {
                error!(error = %e, "Release failed");
                ExitStatus::Failure
            }
        }
    }

    pub fn try_release(&self, ctx: &ExecutionContext) -> Result<ReleaseReport> {
        let ledger = TransferLedger::open(&self.settings.ledger_path)?;

        let from_ledger = !ledger.is_empty();
        let records: Vec<TransferRecord> = if from_ledger {
            ledger.records().to_vec()
        } else if ctx.force {
            warn!("No ledger records; re-probing configured devices still on the isolation driver");
            validate_all(&self.settings.default_devices[..])?
                .into_iter()
                .map(|address| TransferRecord::new(address, None))
                .collect()
        } else {
            return Err(SwapError::NothingToRestore { path: ledger.path().to_path_buf() });
        };

        let engine = RebindEngine::new(self.control.as_ref(), self.policies.rebind);
        let mut report = ReleaseReport::default();

        for record in &records {
            self.check_cancel()?;
            let address = &record.address;
            info!(address = %address, original = ?record.driver, "Releasing device");

            let result = if self.registry.exists(address) {
                self.restore(&engine, record, ctx)
            } else {
                Err(SwapError::DeviceNotFound { address: address.to_string() })
            };

            match result {
                Ok(outcome) => report.restored.push((address.clone(), outcome)),
                Err(e) => {
                    error!(address = %address, error = %e, "Failed to release device");
                    report
                        .failed
                        .push(DeviceFailure { address: address.clone(), reason: e.to_string() });
                }
            }
        }

        if !report.failed.is_empty() {
            return Ok(report);
        }

        if ctx.dry_run {
            info!(path = %ledger.path().display(), "[dry-run] Would clear ledger");
        } else if from_ledger {
            ledger.clear()?;
            report.ledger_cleared = true;
        }

        restart_companion(self.services.as_ref(), self.settings.companion_service.as_deref(), ctx);
        Ok(report)
    }

    /// Move one device off the isolation driver. A device already on some
    /// host driver is left alone; only an unbound device or one still on the
    /// isolation driver is rebound.
    fn restore(
        &self,
        engine: &RebindEngine<'_>,
        record: &TransferRecord,
        ctx: &ExecutionContext,
    ) -> Result<RebindOutcome> {
        let address = &record.address;
        let current = self.control.current_driver(address)?;

        match (current, record.driver.as_deref()) {
            (Some(current), _) if current == self.settings.isolation_driver => {}
            (Some(current), Some(expected)) if current == expected => {
                info!(address = %address, driver = %current, "Device already bound");
                return Ok(RebindOutcome::AlreadyBound(current));
            }
            (Some(current), Some(expected)) => {
                warn!(
                    address = %address,
                    expected = %expected,
                    actual = %current,
                    "Device is on a different host driver than recorded; leaving it"
                );
                return Ok(RebindOutcome::BoundOther {
                    expected: expected.to_string(),
                    actual: current,
                });
            }
            (Some(current), None) => {
                info!(
                    address = %address,
                    driver = %current,
                    "Device not on isolation driver; leaving it"
                );
                return Ok(RebindOutcome::AlreadyBound(current));
            }
            (None, None) => {
                info!(
                    address = %address,
                    "Device unbound and no original driver recorded; leaving it"
                );
                return Ok(RebindOutcome::Unbound);
            }
            (None, Some(_)) => {}
        }

        engine.rebind(address, record.driver.as_deref(), Direction::ToHost, ctx)
    }

    /// Ledger contents joined with live device state.
    pub fn status(&self) -> Result<StatusReport> {
        let ledger = TransferLedger::open(&self.settings.ledger_path)?;

        let mut addresses: Vec<PciAddress> =
            ledger.records().iter().map(|r| r.address.clone()).collect();
        for spec in &self.settings.default_devices {
            if let Ok(address) = PciAddress::parse(spec) {
                if !addresses.contains(&address) {
                    addresses.push(address);
                }
            }
        }

        let devices = addresses
            .into_iter()
            .map(|address| {
                let descriptor = self.registry.resolve(&address).ok();
                DeviceStatus {
                    present: descriptor.is_some(),
                    vendor: descriptor.as_ref().map(|d| d.vendor),
                    driver: descriptor.and_then(|d| d.driver),
                    original: ledger.get(&address).map(|r| r.driver.clone()),
                    address,
                }
            })
            .collect();

        Ok(StatusReport {
            ledger_path: ledger.path().to_path_buf(),
            isolated: !ledger.is_empty(),
            devices,
        })
    }
}
