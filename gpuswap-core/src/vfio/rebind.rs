//! Driver rebind state machine.
//!
//! A device moves `BoundTo(current) -> Unbound -> BoundTo(target)`. Every
//! write goes through [`DeviceControl`] and is confirmed by a bounded poll.
//!
//! Forward transfers (host to isolation) must land on the requested driver.
//! Reverse transfers accept whatever host driver the kernel picks, with a
//! warning, since the goal is only to get the device off the isolation driver.

use crate::context::ExecutionContext;
use crate::error::{Result, SwapError};
use crate::retry::RetryPolicy;
use crate::vfio::address::PciAddress;
use crate::vfio::control::DeviceControl;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which way a device is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host driver to isolation driver.
    ToIsolation,
    /// Isolation driver back to the host.
    ToHost,
}

/// Observable binding state of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindState {
    BoundTo(String),
    Unbound,
}

impl From<Option<String>> for BindState {
    fn from(driver: Option<String>) -> Self {
        driver.map_or(BindState::Unbound, BindState::BoundTo)
    }
}

/// Successful end states of a rebind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebindOutcome {
    /// Device was already on the target driver; nothing was written.
    AlreadyBound(String),
    /// Device is now on the requested driver (or the kernel's pick when no
    /// target was given).
    Bound(String),
    /// Reverse transfer landed on a different host driver than recorded.
    BoundOther { expected: String, actual: String },
    /// No target was given and no driver claimed the device.
    Unbound,
    /// Dry run: transitions were reported, nothing was written.
    Planned,
}

/// Poll budgets for the rebind confirmations.
#[derive(Debug, Clone, Copy)]
pub struct RebindPolicy {
    pub unbind: RetryPolicy,
    pub bind_forward: RetryPolicy,
    pub bind_reverse: RetryPolicy,
}

impl Default for RebindPolicy {
    fn default() -> Self {
        let step = Duration::from_millis(200);
        Self {
            unbind: RetryPolicy::new(5, step),
            bind_forward: RetryPolicy::new(5, step),
            bind_reverse: RetryPolicy::new(3, step),
        }
    }
}

impl RebindPolicy {
    pub fn immediate() -> Self {
        Self {
            unbind: RetryPolicy::immediate(5),
            bind_forward: RetryPolicy::immediate(5),
            bind_reverse: RetryPolicy::immediate(3),
        }
    }

    fn bind(&self, direction: Direction) -> RetryPolicy {
        match direction {
            Direction::ToIsolation => self.bind_forward,
            Direction::ToHost => self.bind_reverse,
        }
    }
}

/// Drives one device at a time through unbind/bind transitions.
pub struct RebindEngine<'a> {
    control: &'a dyn DeviceControl,
    policy: RebindPolicy,
}

impl<'a> RebindEngine<'a> {
    pub fn new(control: &'a dyn DeviceControl, policy: RebindPolicy) -> Self {
        Self { control, policy }
    }

    pub fn state(&self, address: &PciAddress) -> Result<BindState> {
        Ok(self.control.current_driver(address)?.into())
    }

    /// Move a device onto `target`, or onto whatever the kernel selects when
    /// `target` is `None`.
    pub fn rebind(
        &self,
        address: &PciAddress,
        target: Option<&str>,
        direction: Direction,
        ctx: &ExecutionContext,
    ) -> Result<RebindOutcome> {
        let current = self.control.current_driver(address)?;

        if let (Some(current), Some(target)) = (current.as_deref(), target) {
            if current == target {
                info!(address = %address, driver = %current, "Device already bound");
                return Ok(RebindOutcome::AlreadyBound(current.to_string()));
            }
        }

        if ctx.dry_run {
            info!(
                address = %address,
                from = current.as_deref().unwrap_or("<none>"),
                to = target.unwrap_or("<kernel choice>"),
                "[dry-run] Would rebind device"
            );
            return Ok(RebindOutcome::Planned);
        }

        self.unbind(address, target, ctx)?;
        self.clear_override(address, ctx)?;
        self.bind(address, target, direction, ctx)
    }

    /// Release the device from its current driver.
    ///
    /// A device that never reports Unbound is only a warning: the bind step
    /// that follows fails loudly if the device is really stuck.
    pub fn unbind(
        &self,
        address: &PciAddress,
        target: Option<&str>,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let Some(current) = self.control.current_driver(address)? else {
            debug!(address = %address, "Device not bound to any driver");
            return Ok(());
        };
        if target == Some(current.as_str()) {
            return Ok(());
        }
        if ctx.dry_run {
            info!(address = %address, driver = %current, "[dry-run] Would unbind device");
            return Ok(());
        }

        debug!(address = %address, driver = %current, "Unbinding from driver");
        self.control.unbind(address)?;

        let released =
            self.policy.unbind.poll(|| Ok(self.control.current_driver(address)?.is_none()))?;
        if !released {
            warn!(
                address = %address,
                driver = %current,
                attempts = self.policy.unbind.attempts,
                "Timed out waiting for device to unbind; continuing"
            );
        }
        Ok(())
    }

    pub fn clear_override(&self, address: &PciAddress, ctx: &ExecutionContext) -> Result<()> {
        if ctx.dry_run {
            return Ok(());
        }
        self.control.set_override(address, None)
    }

    /// Bind to `target` and confirm, applying the direction's success policy.
    pub fn bind(
        &self,
        address: &PciAddress,
        target: Option<&str>,
        direction: Direction,
        ctx: &ExecutionContext,
    ) -> Result<RebindOutcome> {
        if ctx.dry_run {
            return Ok(RebindOutcome::Planned);
        }

        match target {
            Some(driver) => {
                if let Err(e) = self.control.bind(driver, address) {
                    debug!(
                        address = %address,
                        driver = %driver,
                        error = %e,
                        "Direct bind failed, re-probing"
                    );
                    if direction == Direction::ToIsolation {
                        self.control.set_override(address, Some(driver))?;
                    }
                    self.control.probe(address)?;
                }
            }
            None => self.control.probe(address)?,
        }

        let policy = self.policy.bind(direction);
        policy.poll(|| Ok(self.control.current_driver(address)?.is_some()))?;
        let bound = self.control.current_driver(address)?;

        match (bound, target) {
            (None, None) => {
                info!(address = %address, "No driver claimed the device");
                Ok(RebindOutcome::Unbound)
            }
            (None, Some(driver)) => Err(SwapError::RebindFailed {
                address: address.to_string(),
                reason: format!(
                    "no driver bound after {} attempts (wanted {})",
                    policy.attempts, driver
                ),
            }),
            (Some(actual), None) => {
                info!(address = %address, driver = %actual, "Device bound");
                Ok(RebindOutcome::Bound(actual))
            }
            (Some(actual), Some(expected)) if actual == expected => {
                info!(address = %address, driver = %actual, "Device bound");
                Ok(RebindOutcome::Bound(actual))
            }
            (Some(actual), Some(expected)) => match direction {
                Direction::ToIsolation => Err(SwapError::WrongDriver {
                    address: address.to_string(),
                    expected: expected.to_string(),
                    actual,
                }),
                Direction::ToHost => {
                    warn!(
                        address = %address,
                        expected = %expected,
                        actual = %actual,
                        "Device returned to a different host driver than recorded"
                    );
                    Ok(RebindOutcome::BoundOther { expected: expected.to_string(), actual })
                }
            },
        }
    }
}
