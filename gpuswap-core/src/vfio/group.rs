//! VFIO group device nodes (`/dev/vfio/<group>`) and their ownership.

use crate::context::ExecutionContext;
use crate::error::{Result, SwapError};
use crate::retry::RetryPolicy;
use crate::vfio::address::PciAddress;
use crate::vfio::device::DeviceRegistry;
use nix::unistd::{chown, Gid, Group, Uid, User};
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::{debug, info};

/// Mode applied to group nodes: owner and group read/write.
pub const GROUP_NODE_MODE: u32 = 0o660;

/// Owner and group that should be able to open the VFIO group nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerIdentity {
    pub user: Option<String>,
    pub group: Option<String>,
}

impl ConsumerIdentity {
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.group.is_none()
    }

    fn resolve(&self) -> Result<(Option<Uid>, Option<Gid>)> {
        let uid = match &self.user {
            Some(name) => Some(
                User::from_name(name)
                    .map_err(SwapError::internal)?
                    .ok_or_else(|| SwapError::UnknownIdentity { name: name.clone() })?
                    .uid,
            ),
            None => None,
        };
        let gid = match &self.group {
            Some(name) => Some(
                Group::from_name(name)
                    .map_err(SwapError::internal)?
                    .ok_or_else(|| SwapError::UnknownIdentity { name: name.clone() })?
                    .gid,
            ),
            None => None,
        };
        Ok((uid, gid))
    }
}

/// Get /dev/vfio/GROUP_NUMBER paths for devices, one per distinct group.
///
/// The node appears once vfio-pci owns the group, possibly a little after the
/// bind; `wait` bounds how long to look for it. Dry runs skip the wait since
/// nothing was bound.
pub fn group_node_paths(
    registry: &DeviceRegistry,
    addresses: &[PciAddress],
    wait: &RetryPolicy,
    ctx: &ExecutionContext,
) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut seen_groups = HashSet::new();

    for addr in addresses {
        let group_id = registry.iommu_group(addr).ok_or_else(|| SwapError::RebindFailed {
            address: addr.to_string(),
            reason: "device has no IOMMU group (is IOMMU enabled?)".to_string(),
        })?;

        if !seen_groups.insert(group_id.clone()) {
            continue;
        }

        let group_path = registry.dev_root().join("vfio").join(&group_id);
        let present = group_path.exists() || ctx.dry_run || wait.poll(|| Ok(group_path.exists()))?;
        if !present {
            return Err(SwapError::GroupNodeMissing { address: addr.to_string(), path: group_path });
        }
        paths.push(group_path);
    }

    Ok(paths)
}

/// Hand the group nodes to the consumer identity.
pub fn grant_access(
    paths: &[PathBuf],
    identity: &ConsumerIdentity,
    ctx: &ExecutionContext,
) -> Result<()> {
    let (uid, gid) = identity.resolve()?;

    for path in paths {
        if ctx.dry_run {
            info!(
                path = %path.display(),
                identity = ?identity,
                "[dry-run] Would grant VFIO group access"
            );
            continue;
        }

        if uid.is_some() || gid.is_some() {
            chown(path, uid, gid).map_err(|e| SwapError::io(path, e.into()))?;
        }
        fs::set_permissions(path, fs::Permissions::from_mode(GROUP_NODE_MODE))
            .map_err(|e| SwapError::io(path, e))?;
        debug!(path = %path.display(), uid = ?uid, gid = ?gid, "Granted VFIO group access");
    }

    Ok(())
}
