//! Integration tests for acquire/release.
//!
//! These tests run the orchestrator end to end against a fabricated sysfs and
//! /dev tree in a temp directory. A fake kernel implements `DeviceControl` by
//! rewriting the `driver` symlinks, so registry reads and control writes see
//! the same state.

use gpuswap_core::error::{Result, SwapError};
use gpuswap_core::evict::{Consent, ProcessTable, SignalKind};
use gpuswap_core::orchestrator::{ExitStatus, Orchestrator, Policies, Settings};
use gpuswap_core::service::ServiceManager;
use gpuswap_core::vfio::{
    ConsumerIdentity, DeviceControl, DeviceRegistry, PciAddress, RebindOutcome,
};
use gpuswap_core::{CancelFlag, ExecutionContext};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

const GPU: &str = "0000:01:00.0";
const AUDIO: &str = "0000:01:00.1";

/// Temp sysfs + /dev tree.
struct Machine {
    tmp: TempDir,
}

impl Machine {
    fn new() -> Self {
        let machine = Self { tmp: TempDir::new().unwrap() };
        fs::create_dir_all(machine.sys().join("bus/pci/devices")).unwrap();
        fs::create_dir_all(machine.dev().join("vfio")).unwrap();
        machine
    }

    fn sys(&self) -> PathBuf {
        self.tmp.path().join("sys")
    }

    fn dev(&self) -> PathBuf {
        self.tmp.path().join("dev")
    }

    fn ledger(&self) -> PathBuf {
        self.tmp.path().join("state/ledger")
    }

    fn add_driver(&self, name: &str) {
        fs::create_dir_all(self.sys().join("bus/pci/drivers").join(name)).unwrap();
    }

    fn add_device(&self, addr: &str, vendor: &str, driver: Option<&str>, group: &str) {
        let dev = self.sys().join("bus/pci/devices").join(addr);
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("vendor"), format!("0x{vendor}\n")).unwrap();
        fs::write(dev.join("device"), "0x2204\n").unwrap();
        let group_dir = self.sys().join("kernel/iommu_groups").join(group);
        fs::create_dir_all(&group_dir).unwrap();
        symlink(&group_dir, dev.join("iommu_group")).unwrap();
        if let Some(driver) = driver {
            self.add_driver(driver);
            symlink(self.sys().join("bus/pci/drivers").join(driver), dev.join("driver")).unwrap();
        }
    }

    fn add_node(&self, name: &str) -> PathBuf {
        let path = self.dev().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "").unwrap();
        path
    }

    fn driver_of(&self, addr: &str) -> Option<String> {
        let registry = DeviceRegistry::new(self.sys(), self.dev());
        registry.current_driver(&PciAddress::parse(addr).unwrap())
    }
}

/// Direct binds succeed for host drivers only; vfio-pci needs the override
/// plus a probe, like the real thing.
#[derive(Clone)]
struct FakeKernel {
    sys: PathBuf,
    dev: PathBuf,
    bindable: Rc<Vec<&'static str>>,
    probe_default: Rc<HashMap<&'static str, &'static str>>,
    loadable: Rc<Vec<&'static str>>,
    writes: Rc<RefCell<Vec<String>>>,
}

impl FakeKernel {
    fn new(machine: &Machine) -> Self {
        Self {
            sys: machine.sys(),
            dev: machine.dev(),
            bindable: Rc::new(vec!["nvidia", "snd_hda_intel", "amdgpu"]),
            probe_default: Rc::new(HashMap::from([(GPU, "nvidia"), (AUDIO, "snd_hda_intel")])),
            loadable: Rc::new(vec!["vfio-pci"]),
            writes: Rc::default(),
        }
    }

    fn writes(&self) -> Vec<String> {
        self.writes.borrow().clone()
    }

    fn device(&self, addr: &PciAddress) -> PathBuf {
        self.sys.join("bus/pci/devices").join(addr.as_str())
    }

    fn attach(&self, driver: &str, addr: &PciAddress) -> bool {
        let driver_dir = self.sys.join("bus/pci/drivers").join(driver);
        if !driver_dir.exists() {
            return false;
        }
        let _ = fs::remove_file(self.device(addr).join("driver"));
        symlink(&driver_dir, self.device(addr).join("driver")).unwrap();
        if driver == "vfio-pci" {
            let group = fs::read_link(self.device(addr).join("iommu_group")).unwrap();
            fs::write(self.dev.join("vfio").join(group.file_name().unwrap()), "").unwrap();
        }
        true
    }
}

impl DeviceControl for FakeKernel {
    fn current_driver(&self, address: &PciAddress) -> Result<Option<String>> {
        if !self.device(address).exists() {
            return Err(SwapError::DeviceNotFound { address: address.to_string() });
        }
        Ok(fs::read_link(self.device(address).join("driver"))
            .ok()
            .and_then(|t| t.file_name().map(|n| n.to_string_lossy().to_string())))
    }

    fn unbind(&self, address: &PciAddress) -> Result<()> {
        self.writes.borrow_mut().push(format!("unbind {address}"));
        let _ = fs::remove_file(self.device(address).join("driver"));
        Ok(())
    }

    fn set_override(&self, address: &PciAddress, driver: Option<&str>) -> Result<()> {
        self.writes.borrow_mut().push(format!("override {address} {}", driver.unwrap_or("-")));
        fs::write(self.device(address).join("driver_override"), driver.unwrap_or("")).unwrap();
        Ok(())
    }

    fn bind(&self, driver: &str, address: &PciAddress) -> Result<()> {
        self.writes.borrow_mut().push(format!("bind {driver} {address}"));
        if self.bindable.contains(&driver) && self.attach(driver, address) {
            Ok(())
        } else {
            Err(SwapError::Internal("No such device".into()))
        }
    }

    fn probe(&self, address: &PciAddress) -> Result<()> {
        self.writes.borrow_mut().push(format!("probe {address}"));
        let hint = fs::read_to_string(self.device(address).join("driver_override"))
            .unwrap_or_default();
        let hint = hint.trim();
        if !hint.is_empty() {
            self.attach(hint, address);
        } else if let Some(default) = self.probe_default.get(address.as_str()) {
            self.attach(default, address);
        }
        Ok(())
    }

    fn load_driver(&self, driver: &str) -> Result<()> {
        self.writes.borrow_mut().push(format!("load {driver}"));
        if self.loadable.contains(&driver) {
            fs::create_dir_all(self.sys.join("bus/pci/drivers").join(driver)).unwrap();
            Ok(())
        } else {
            Err(SwapError::DriverUnavailable { driver: driver.into(), hint: String::new() })
        }
    }

    fn driver_available(&self, driver: &str) -> bool {
        self.sys.join("bus/pci/drivers").join(driver).exists()
    }
}

/// Holders exit on the first signal unless `stubborn`.
#[derive(Clone, Default)]
struct FakeProcesses {
    holders: Rc<RefCell<Vec<(u32, String)>>>,
    stubborn: bool,
    signals: Rc<RefCell<Vec<String>>>,
}

impl FakeProcesses {
    fn holding(holders: &[(u32, &str)]) -> Self {
        let procs = Self::default();
        procs.holders.replace(holders.iter().map(|(p, n)| (*p, n.to_string())).collect());
        procs
    }
}

impl ProcessTable for FakeProcesses {
    fn holders(&self, _nodes: &BTreeSet<PathBuf>) -> Result<Vec<u32>> {
        Ok(self.holders.borrow().iter().map(|(p, _)| *p).collect())
    }
    fn name(&self, pid: u32) -> Option<String> {
        self.holders.borrow().iter().find(|(p, _)| *p == pid).map(|(_, n)| n.clone())
    }
    fn signal_pid(&self, pid: u32, signal: SignalKind) -> Result<()> {
        self.signals.borrow_mut().push(format!("{signal:?} {pid}"));
        if !self.stubborn {
            self.holders.borrow_mut().retain(|(p, _)| *p != pid);
        }
        Ok(())
    }
    fn signal_name(&self, name: &str, signal: SignalKind) -> Result<usize> {
        self.signals.borrow_mut().push(format!("{signal:?} {name}"));
        Ok(0)
    }
}

struct Yes;

impl Consent for Yes {
    fn confirm(&self, _question: &str) -> bool {
        true
    }
}

#[derive(Clone, Default)]
struct Services(Rc<RefCell<Vec<String>>>);

impl ServiceManager for Services {
    fn restart_if_present(&self, service: &str) -> Result<bool> {
        self.0.borrow_mut().push(service.to_string());
        Ok(true)
    }
}

struct Harness {
    machine: Machine,
    kernel: FakeKernel,
    procs: FakeProcesses,
    services: Services,
    orchestrator: Orchestrator,
}

fn settings(machine: &Machine, default_devices: &[&str]) -> Settings {
    Settings {
        isolation_driver: "vfio-pci".into(),
        ledger_path: machine.ledger(),
        consumer: ConsumerIdentity::default(),
        companion_service: Some("nvidia-persistenced".into()),
        restart_service_on_acquire: false,
        default_devices: default_devices.iter().map(|s| s.to_string()).collect(),
    }
}

fn orchestrator(
    machine: &Machine,
    control: impl DeviceControl + 'static,
    procs: &FakeProcesses,
    services: &Services,
    default_devices: &[&str],
) -> Orchestrator {
    Orchestrator::new(
        DeviceRegistry::new(machine.sys(), machine.dev()),
        Box::new(control),
        Box::new(procs.clone()),
        Box::new(Yes),
        Box::new(services.clone()),
        settings(machine, default_devices),
    )
    .with_policies(Policies::immediate())
}

fn harness_with(machine: Machine, procs: FakeProcesses, default_devices: &[&str]) -> Harness {
    let kernel = FakeKernel::new(&machine);
    let services = Services::default();
    let orchestrator = orchestrator(&machine, kernel.clone(), &procs, &services, default_devices);
    Harness { machine, kernel, procs, services, orchestrator }
}

fn nvidia_machine() -> Machine {
    let machine = Machine::new();
    machine.add_device(GPU, "10de", Some("nvidia"), "14");
    machine.add_node("nvidia0");
    machine.add_node("nvidiactl");
    machine
}

fn live() -> ExecutionContext {
    ExecutionContext { assume_yes: true, ..Default::default() }
}

fn specs(addrs: &[&str]) -> Vec<String> {
    addrs.iter().map(|s| s.to_string()).collect()
}

fn mode(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[test]
fn test_acquire_then_release_round_trip() {
    let h = harness_with(nvidia_machine(), FakeProcesses::default(), &[]);

    let status = h.orchestrator.acquire_for_isolation(&specs(&["01:00.0"]), &live());
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(fs::read_to_string(h.machine.ledger()).unwrap(), "0000:01:00.0,nvidia\n");
    assert_eq!(mode(&h.machine.ledger()), 0o600);
    assert_eq!(h.machine.driver_of(GPU).as_deref(), Some("vfio-pci"));
    assert_eq!(mode(&h.machine.dev().join("vfio/14")), 0o660);
    assert!(h.services.0.borrow().is_empty());

    let status = h.orchestrator.release_to_host(&live());
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(h.machine.driver_of(GPU).as_deref(), Some("nvidia"));
    assert!(!h.machine.ledger().exists());
    assert_eq!(*h.services.0.borrow(), vec!["nvidia-persistenced"]);

    assert_eq!(
        h.kernel.writes(),
        vec![
            "load vfio-pci",
            "unbind 0000:01:00.0",
            "override 0000:01:00.0 -",
            "bind vfio-pci 0000:01:00.0",
            "override 0000:01:00.0 vfio-pci",
            "probe 0000:01:00.0",
            "unbind 0000:01:00.0",
            "override 0000:01:00.0 -",
            "bind nvidia 0000:01:00.0",
        ]
    );
}

#[test]
fn test_gpu_and_audio_share_group() {
    let machine = nvidia_machine();
    machine.add_device(AUDIO, "10de", Some("snd_hda_intel"), "14");
    let h = harness_with(machine, FakeProcesses::default(), &[GPU, AUDIO]);

    let report = h.orchestrator.try_acquire(&[], &live()).unwrap();
    assert_eq!(report.devices.len(), 2);
    assert_eq!(report.group_nodes, vec![h.machine.dev().join("vfio/14")]);
    assert_eq!(
        fs::read_to_string(h.machine.ledger()).unwrap(),
        "0000:01:00.0,nvidia\n0000:01:00.1,snd_hda_intel\n"
    );

    let report = h.orchestrator.try_release(&live()).unwrap();
    assert!(report.failed.is_empty());
    assert!(report.ledger_cleared);
    assert_eq!(h.machine.driver_of(AUDIO).as_deref(), Some("snd_hda_intel"));
}

#[test]
fn test_display_server_holder_aborts_acquire() {
    let procs = FakeProcesses::holding(&[(500, "Xorg"), (600, "python3")]);
    let h = harness_with(nvidia_machine(), procs, &[]);

    match h.orchestrator.try_acquire(&specs(&[GPU]), &live()) {
        Err(e @ SwapError::DisplayServerHolder { .. }) => assert!(e.is_eviction_abort()),
        other => panic!("expected eviction abort, got {other:?}"),
    }
    assert_eq!(
        h.orchestrator.acquire_for_isolation(&specs(&[GPU]), &live()),
        ExitStatus::Failure
    );

    assert!(h.procs.signals.borrow().is_empty());
    assert!(!h.kernel.writes().iter().any(|w| w.starts_with("unbind")));
    assert_eq!(h.machine.driver_of(GPU).as_deref(), Some("nvidia"));
    assert!(!h.machine.ledger().exists());
}

#[test]
fn test_holders_evicted_before_unbind() {
    let procs = FakeProcesses::holding(&[(700, "ollama")]);
    let h = harness_with(nvidia_machine(), procs, &[]);

    h.orchestrator.try_acquire(&specs(&[GPU]), &live()).unwrap();
    assert_eq!(*h.procs.signals.borrow(), vec!["Terminate 700"]);
    assert_eq!(h.machine.driver_of(GPU).as_deref(), Some("vfio-pci"));
}

#[test]
fn test_unkillable_holder_blocks_unbind() {
    let mut procs = FakeProcesses::holding(&[(700, "ollama")]);
    procs.stubborn = true;
    let h = harness_with(nvidia_machine(), procs, &[]);

    assert!(matches!(
        h.orchestrator.try_acquire(&specs(&[GPU]), &live()),
        Err(SwapError::HoldersRemain { .. })
    ));
    assert_eq!(
        *h.procs.signals.borrow(),
        vec!["Terminate 700", "Terminate ollama", "Kill ollama"]
    );
    assert_eq!(h.kernel.writes(), vec!["load vfio-pci"]);
}

#[test]
fn test_release_without_ledger() {
    let h = harness_with(nvidia_machine(), FakeProcesses::default(), &[]);

    assert!(matches!(
        h.orchestrator.try_release(&live()),
        Err(SwapError::NothingToRestore { .. })
    ));
    assert_eq!(h.orchestrator.release_to_host(&live()), ExitStatus::Failure);
    assert!(h.kernel.writes().is_empty());
    assert!(h.services.0.borrow().is_empty());
}

#[test]
fn test_forced_release_without_ledger_uses_configured_devices() {
    let machine = Machine::new();
    machine.add_device(GPU, "10de", Some("vfio-pci"), "14");
    machine.add_driver("nvidia");
    let h = harness_with(machine, FakeProcesses::default(), &[GPU]);

    let ctx = ExecutionContext { force: true, ..live() };
    let report = h.orchestrator.try_release(&ctx).unwrap();
    assert!(report.failed.is_empty());
    assert!(!report.ledger_cleared);
    assert_eq!(h.machine.driver_of(GPU).as_deref(), Some("nvidia"));
}

#[test]
fn test_forced_release_leaves_host_bound_device_alone() {
    let h = harness_with(nvidia_machine(), FakeProcesses::default(), &[GPU]);

    let ctx = ExecutionContext { force: true, ..live() };
    let report = h.orchestrator.try_release(&ctx).unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(
        report.restored,
        vec![(PciAddress::parse(GPU).unwrap(), RebindOutcome::AlreadyBound("nvidia".into()))]
    );
    assert!(h.kernel.writes().is_empty());
    assert_eq!(h.machine.driver_of(GPU).as_deref(), Some("nvidia"));
}

#[test]
fn test_rerun_release_skips_restored_unbound_device() {
    let machine = Machine::new();
    machine.add_device(GPU, "10de", None, "14");
    machine.add_device(AUDIO, "10de", Some("snd_hda_intel"), "14");
    let mut kernel = FakeKernel::new(&machine);
    kernel.probe_default = Rc::new(HashMap::new());
    let services = Services::default();
    let orchestrator =
        orchestrator(&machine, kernel.clone(), &FakeProcesses::default(), &services, &[]);

    orchestrator.try_acquire(&specs(&[GPU, AUDIO]), &live()).unwrap();
    assert_eq!(
        fs::read_to_string(machine.ledger()).unwrap(),
        "0000:01:00.0,\n0000:01:00.1,snd_hda_intel\n"
    );

    // The audio driver goes away while the devices are isolated.
    fs::remove_dir_all(machine.sys().join("bus/pci/drivers/snd_hda_intel")).unwrap();
    let report = orchestrator.try_release(&live()).unwrap();
    assert_eq!(report.restored, vec![(PciAddress::parse(GPU).unwrap(), RebindOutcome::Unbound)]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(machine.driver_of(GPU), None);

    // Retrying touches only the device that still needs work.
    let before = kernel.writes().len();
    let report = orchestrator.try_release(&live()).unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(kernel.writes()[before..].iter().all(|w| !w.contains(GPU)));

    machine.add_driver("snd_hda_intel");
    let before = kernel.writes().len();
    assert!(orchestrator.release_to_host(&live()).is_success());
    assert!(kernel.writes()[before..].iter().all(|w| !w.contains(GPU)));
    assert_eq!(machine.driver_of(AUDIO).as_deref(), Some("snd_hda_intel"));
    assert!(!machine.ledger().exists());
}

#[test]
fn test_malformed_ledger_does_not_block_acquire() {
    let h = harness_with(nvidia_machine(), FakeProcesses::default(), &[]);
    fs::create_dir_all(h.machine.ledger().parent().unwrap()).unwrap();
    fs::write(h.machine.ledger(), "garbage\n").unwrap();

    h.orchestrator.try_acquire(&specs(&[GPU]), &live()).unwrap();
    assert_eq!(fs::read_to_string(h.machine.ledger()).unwrap(), "0000:01:00.0,nvidia\n");
}

#[test]
fn test_dry_run_touches_nothing() {
    let procs = FakeProcesses::holding(&[(700, "ollama")]);
    let h = harness_with(nvidia_machine(), procs, &[]);
    let ctx = ExecutionContext { dry_run: true, force: true, ..Default::default() };

    assert_eq!(h.orchestrator.acquire_for_isolation(&specs(&[GPU]), &ctx), ExitStatus::Success);
    assert!(h.kernel.writes().is_empty());
    assert!(h.procs.signals.borrow().is_empty());
    assert!(!h.machine.ledger().exists());
    assert_eq!(h.machine.driver_of(GPU).as_deref(), Some("nvidia"));

    // Now really acquire, then preview the release.
    h.procs.holders.borrow_mut().clear();
    h.orchestrator.try_acquire(&specs(&[GPU]), &live()).unwrap();
    let before = h.kernel.writes();
    let report = h.orchestrator.try_release(&ctx).unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(h.kernel.writes(), before);
    assert!(h.machine.ledger().exists());
    assert!(h.services.0.borrow().is_empty());
}

#[test]
fn test_symlinked_ledger_refused() {
    let h = harness_with(nvidia_machine(), FakeProcesses::default(), &[GPU]);
    let decoy = h.machine.tmp.path().join("decoy");
    fs::write(&decoy, "0000:01:00.0,nvidia\n").unwrap();
    fs::create_dir_all(h.machine.ledger().parent().unwrap()).unwrap();
    symlink(&decoy, h.machine.ledger()).unwrap();

    for ctx in [live(), ExecutionContext { force: true, ..live() }] {
        assert!(matches!(
            h.orchestrator.try_acquire(&specs(&[GPU]), &ctx),
            Err(SwapError::LedgerSymlink { .. })
        ));
        assert!(matches!(h.orchestrator.try_release(&ctx), Err(SwapError::LedgerSymlink { .. })));
    }
    assert!(h.kernel.writes().is_empty());
    assert_eq!(fs::read_to_string(&decoy).unwrap(), "0000:01:00.0,nvidia\n");
}

#[test]
fn test_second_acquire_refused_unless_forced() {
    let h = harness_with(nvidia_machine(), FakeProcesses::default(), &[]);
    h.orchestrator.try_acquire(&specs(&[GPU]), &live()).unwrap();
    let writes = h.kernel.writes().len();

    assert!(matches!(
        h.orchestrator.try_acquire(&specs(&[GPU]), &live()),
        Err(SwapError::AlreadyIsolated { .. })
    ));
    assert_eq!(h.kernel.writes().len(), writes);

    // Forced: existing record keeps the original driver.
    let ctx = ExecutionContext { force: true, ..live() };
    h.orchestrator.try_acquire(&specs(&[GPU]), &ctx).unwrap();
    assert_eq!(fs::read_to_string(h.machine.ledger()).unwrap(), "0000:01:00.0,nvidia\n");
}

/// Probes ignore the vfio-pci override for the audio function.
struct RejectAudio(FakeKernel);

impl DeviceControl for RejectAudio {
    fn current_driver(&self, a: &PciAddress) -> Result<Option<String>> {
        self.0.current_driver(a)
    }
    fn unbind(&self, a: &PciAddress) -> Result<()> {
        self.0.unbind(a)
    }
    fn set_override(&self, a: &PciAddress, d: Option<&str>) -> Result<()> {
        self.0.set_override(a, if a.as_str() == AUDIO { None } else { d })
    }
    fn bind(&self, d: &str, a: &PciAddress) -> Result<()> {
        self.0.bind(d, a)
    }
    fn probe(&self, a: &PciAddress) -> Result<()> {
        self.0.probe(a)
    }
    fn load_driver(&self, d: &str) -> Result<()> {
        self.0.load_driver(d)
    }
    fn driver_available(&self, d: &str) -> bool {
        self.0.driver_available(d)
    }
}

#[test]
fn test_forward_failure_keeps_completed_records() {
    let machine = nvidia_machine();
    machine.add_device(AUDIO, "10de", Some("snd_hda_intel"), "14");
    machine.add_device("0000:02:00.0", "1002", Some("amdgpu"), "15");
    let kernel = FakeKernel::new(&machine);
    let orchestrator = orchestrator(
        &machine,
        RejectAudio(kernel.clone()),
        &FakeProcesses::default(),
        &Services::default(),
        &[],
    );

    match orchestrator.try_acquire(&specs(&[GPU, AUDIO, "02:00.0"]), &live()) {
        Err(SwapError::WrongDriver { address, actual, .. }) => {
            assert_eq!(address, AUDIO);
            assert_eq!(actual, "snd_hda_intel");
        }
        other => panic!("expected WrongDriver, got {other:?}"),
    }
    assert_eq!(
        fs::read_to_string(machine.ledger()).unwrap(),
        "0000:01:00.0,nvidia\n0000:01:00.1,snd_hda_intel\n"
    );
    assert_eq!(machine.driver_of(GPU).as_deref(), Some("vfio-pci"));
    assert_eq!(machine.driver_of("0000:02:00.0").as_deref(), Some("amdgpu"));
    assert!(!kernel.writes().iter().any(|w| w.ends_with("0000:02:00.0")));

    // Recovery is a plain release.
    assert!(orchestrator.release_to_host(&live()).is_success());
    assert_eq!(machine.driver_of(GPU).as_deref(), Some("nvidia"));
    assert_eq!(machine.driver_of(AUDIO).as_deref(), Some("snd_hda_intel"));
    assert!(!machine.ledger().exists());
}

#[test]
fn test_partial_release_preserves_ledger() {
    let machine = nvidia_machine();
    machine.add_device("0000:02:00.0", "1002", Some("amdgpu"), "15");
    let h = harness_with(machine, FakeProcesses::default(), &[]);
    h.orchestrator.try_acquire(&specs(&[GPU, "02:00.0"]), &live()).unwrap();

    // amdgpu gets unloaded while the device is in the guest.
    fs::remove_dir_all(h.machine.sys().join("bus/pci/drivers/amdgpu")).unwrap();

    let report = h.orchestrator.try_release(&live()).unwrap();
    assert_eq!(report.restored.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].address.as_str(), "0000:02:00.0");
    assert!(!report.ledger_cleared);
    assert_eq!(h.machine.driver_of(GPU).as_deref(), Some("nvidia"));
    assert_eq!(
        fs::read_to_string(h.machine.ledger()).unwrap(),
        "0000:01:00.0,nvidia\n0000:02:00.0,amdgpu\n"
    );
    assert!(h.services.0.borrow().is_empty());
    assert_eq!(h.orchestrator.release_to_host(&live()), ExitStatus::Failure);

    // Retry after the driver comes back; the restored GPU is a no-op.
    h.machine.add_driver("amdgpu");
    assert_eq!(h.orchestrator.release_to_host(&live()), ExitStatus::Success);
    assert!(!h.machine.ledger().exists());
}

#[test]
fn test_missing_isolation_module_is_fatal() {
    let machine = nvidia_machine();
    let mut kernel = FakeKernel::new(&machine);
    kernel.loadable = Rc::new(vec![]);
    let procs = FakeProcesses::default();
    let orchestrator = orchestrator(&machine, kernel.clone(), &procs, &Services::default(), &[]);

    assert!(matches!(
        orchestrator.try_acquire(&specs(&[GPU]), &live()),
        Err(SwapError::DriverUnavailable { .. })
    ));
    assert_eq!(kernel.writes(), vec!["load vfio-pci"]);
    assert!(!machine.ledger().exists());
}

#[test]
fn test_invalid_and_missing_devices_rejected() {
    let h = harness_with(nvidia_machine(), FakeProcesses::default(), &[]);
    assert!(matches!(
        h.orchestrator.try_acquire(&specs(&["not-a-device"]), &live()),
        Err(SwapError::InvalidAddress { .. })
    ));
    assert!(matches!(
        h.orchestrator.try_acquire(&specs(&["0000:09:00.0"]), &live()),
        Err(SwapError::DeviceNotFound { .. })
    ));
    assert!(matches!(
        h.orchestrator.try_acquire(&[], &live()),
        Err(SwapError::InvalidConfig { .. })
    ));
    assert!(h.kernel.writes().is_empty());
}

#[test]
fn test_cancelled_before_start() {
    let machine = nvidia_machine();
    let kernel = FakeKernel::new(&machine);
    let cancel = CancelFlag::new();
    cancel.cancel();
    let orchestrator =
        orchestrator(&machine, kernel.clone(), &FakeProcesses::default(), &Services::default(), &[])
            .with_cancel(cancel);

    assert!(matches!(
        orchestrator.try_acquire(&specs(&[GPU]), &live()),
        Err(SwapError::Cancelled)
    ));
    assert!(!kernel.writes().iter().any(|w| w.starts_with("unbind")));
    assert!(!machine.ledger().exists());
}

#[test]
fn test_status_reports_ledger_and_live_driver() {
    let h = harness_with(nvidia_machine(), FakeProcesses::default(), &[GPU]);
    let before = h.orchestrator.status().unwrap();
    assert!(!before.isolated);
    assert_eq!(before.devices[0].driver.as_deref(), Some("nvidia"));
    assert_eq!(before.devices[0].original, None);

    h.orchestrator.try_acquire(&[], &live()).unwrap();
    let after = h.orchestrator.status().unwrap();
    assert!(after.isolated);
    assert_eq!(after.devices.len(), 1);
    assert_eq!(after.devices[0].driver.as_deref(), Some("vfio-pci"));
    assert_eq!(after.devices[0].original, Some(Some("nvidia".to_string())));
}
