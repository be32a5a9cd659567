//! Per-session record of armed intercepts.
//!
//! The tracker is the authoritative view of what the backend currently
//! watches. It changes only after the backend has acknowledged a toggle
//! (write-through), so a failed backend call leaves it untouched.
//!
//! Entries are keyed by vCPU and by the full [`InterceptType`] including
//! its parameters: CR0 and CR3 are separate entries, as are two MSR
//! indices on the same vCPU.

use log::{debug, warn};
use std::collections::BTreeSet;

use crate::api::{CrType, Event, InterceptType};
use crate::driver::Driver;
use crate::error::DriverError;

#[derive(Debug, Default, Clone)]
pub struct InterceptTracker {
    armed: BTreeSet<(u16, InterceptType)>,
}

impl InterceptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self, vcpu: u16, intercept: InterceptType) -> bool {
        self.armed.contains(&(vcpu, intercept))
    }

    /// Intercepts armed on one vCPU, in a stable order.
    pub fn armed(&self, vcpu: u16) -> Vec<InterceptType> {
        self.armed
            .range((vcpu, InterceptType::Cr(CrType::Cr0))..)
            .take_while(|(v, _)| *v == vcpu)
            .map(|(_, i)| *i)
            .collect()
    }

    pub fn all_armed(&self) -> Vec<(u16, InterceptType)> {
        self.armed.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Whether `event` was produced by an intercept that is still armed.
    pub fn accepts(&self, event: &Event) -> bool {
        self.is_armed(event.vcpu, event.kind.intercept())
    }

    /// Forward a toggle to the backend and record it once acknowledged.
    pub fn toggle(
        &mut self,
        driver: &dyn Driver,
        vcpu: u16,
        intercept: InterceptType,
        enabled: bool,
    ) -> Result<(), DriverError> {
        driver.toggle_intercept(vcpu, intercept, enabled)?;
        if enabled {
            self.armed.insert((vcpu, intercept));
        } else {
            self.armed.remove(&(vcpu, intercept));
        }
        debug!(
            "VCPU {}: {} {}",
            vcpu,
            intercept,
            if enabled { "armed" } else { "disarmed" }
        );
        Ok(())
    }

    /// Switch an armed intercept to a new parameterization.
    ///
    /// The caller holds the tracker for the whole operation, so dispatch
    /// never observes a state where both or neither are recorded as armed
    /// for longer than the call. If arming `new` fails, `old` is re-armed;
    /// if that fails too the tracker records `old` as disarmed, matching
    /// the backend.
    pub fn retarget(
        &mut self,
        driver: &dyn Driver,
        vcpu: u16,
        old: InterceptType,
        new: InterceptType,
    ) -> Result<(), DriverError> {
        if !self.is_armed(vcpu, old) {
            return Err(DriverError::InvalidArgument(format!(
                "{} is not armed on VCPU {}",
                old, vcpu
            )));
        }
        if old == new {
            return Ok(());
        }

        self.toggle(driver, vcpu, old, false)?;
        if let Err(e) = self.toggle(driver, vcpu, new, true) {
            if let Err(rollback) = self.toggle(driver, vcpu, old, true) {
                warn!(
                    "VCPU {}: failed to re-arm {} after failed retarget: {}",
                    vcpu, old, rollback
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Forget every entry and return what was armed, for teardown.
    pub fn drain(&mut self) -> Vec<(u16, InterceptType)> {
        std::mem::take(&mut self.armed).into_iter().collect()
    }
}
