//! Transfer ledger: the on-disk record of each device's original driver.
//!
//! Format is one `<address>,<driver>` pair per line. An empty driver means the
//! device had no driver when it was acquired. The file is owner-only, never a
//! symlink, and is replaced atomically on every append.

use crate::error::{Result, SwapError};
use crate::vfio::PciAddress;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Owner read/write only.
pub const LEDGER_MODE: u32 = 0o600;

/// One device's original binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub address: PciAddress,
    /// Driver bound before the transfer, `None` if the device was unbound.
    pub driver: Option<String>,
}

impl TransferRecord {
    pub fn new(address: PciAddress, driver: Option<String>) -> Self {
        Self { address, driver }
    }

    fn to_line(&self) -> String {
        format!("{},{}\n", self.address, self.driver.as_deref().unwrap_or(""))
    }

    fn parse_line(line: &str) -> Option<Self> {
        let (address, driver) = line.split_once(',')?;
        if driver.contains(',') {
            return None;
        }
        let address = PciAddress::parse(address).ok()?;
        let driver = driver.trim();
        let driver = (!driver.is_empty()).then(|| driver.to_string());
        Some(Self { address, driver })
    }
}

/// Ordered, de-duplicated set of [`TransferRecord`]s backed by one file.
#[derive(Debug, Clone)]
pub struct TransferLedger {
    path: PathBuf,
    records: Vec<TransferRecord>,
}

/// Refuse to follow a symlink at the ledger path.
fn ensure_not_symlink(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            Err(SwapError::LedgerSymlink { path: path.to_path_buf() })
        }
        _ => Ok(()),
    }
}

impl TransferLedger {
    /// Load the ledger at `path`. A missing file is an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure_not_symlink(&path)?;

        let records = match fs::read_to_string(&path) {
            Ok(content) => parse_records(&path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(SwapError::io(&path, e)),
        };

        debug!(path = %path.display(), records = records.len(), "Opened transfer ledger");
        Ok(Self { path, records })
    }

    /// Create or truncate the ledger file with owner-only permissions.
    pub fn initialize_empty(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure_not_symlink(&path)?;
        let ledger = Self { path, records: Vec::new() };
        ledger.persist()?;
        info!(path = %ledger.path.display(), "Initialized transfer ledger");
        Ok(ledger)
    }

    /// Whether the file holds at least one valid record: the "devices are in
    /// isolation mode" signal. Malformed lines do not count.
    pub fn is_active(path: &Path) -> Result<bool> {
        Ok(!Self::open(path)?.is_empty())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[TransferRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, address: &PciAddress) -> Option<&TransferRecord> {
        self.records.iter().find(|r| &r.address == address)
    }

    /// Add a record unless one exists for the address. Returns whether it was added.
    pub fn append(&mut self, record: TransferRecord) -> Result<bool> {
        if self.get(&record.address).is_some() {
            debug!(address = %record.address, "Ledger already has a record for device");
            return Ok(false);
        }
        self.records.push(record);
        if let Err(e) = self.persist() {
            self.records.pop();
            return Err(e);
        }
        Ok(true)
    }

    /// Delete the ledger file.
    pub fn clear(self) -> Result<()> {
        ensure_not_symlink(&self.path)?;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SwapError::io(&self.path, e)),
        }
        info!(path = %self.path.display(), "Cleared transfer ledger");
        Ok(())
    }

    /// Write all records to a temp file next to the ledger and rename it over
    /// the target, so readers never see a partial file.
    fn persist(&self) -> Result<()> {
        ensure_not_symlink(&self.path)?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| SwapError::io(&dir, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| SwapError::io(&dir, e))?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(LEDGER_MODE))
            .map_err(|e| SwapError::io(tmp.path(), e))?;
        for record in &self.records {
            tmp.write_all(record.to_line().as_bytes())
                .map_err(|e| SwapError::io(tmp.path(), e))?;
        }
        tmp.as_file().sync_all().map_err(|e| SwapError::io(tmp.path(), e))?;
        tmp.persist(&self.path).map_err(|e| SwapError::io(&self.path, e.error))?;

        fs::set_permissions(&self.path, fs::Permissions::from_mode(LEDGER_MODE))
            .map_err(|e| SwapError::io(&self.path, e))?;
        Ok(())
    }
}

fn parse_records(path: &Path, content: &str) -> Vec<TransferRecord> {
    let mut records: Vec<TransferRecord> = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match TransferRecord::parse_line(line) {
            Some(record) if records.iter().any(|r| r.address == record.address) => {
                warn!(path = %path.display(), line = lineno + 1, "Duplicate ledger record skipped");
            }
            Some(record) => records.push(record),
            None => {
                warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    content = %line,
                    "Malformed ledger line skipped"
                );
            }
        }
    }
    records
}
