//! The event dispatch loop.
//!
//! Drives a backend's blocking [`Driver::listen`], normalizes the native
//! trap record into an [`Event`] and filters it against the intercept
//! tracker. A trap whose intercept has been disarmed in the meantime is
//! acknowledged to the backend and dropped, and the loop keeps waiting
//! within what is left of the caller's budget.

use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::api::{Event, EventReply};
use crate::driver::{Driver, RawTrap};
use crate::error::DriverError;
use crate::intercept::InterceptTracker;
use crate::lock;
use crate::verified::traps::decode_trap;

/// Normalize a native trap record.
pub fn normalize(raw: &RawTrap) -> Result<Event, DriverError> {
    let kind = decode_trap(raw.class, raw.arg0, raw.arg1, raw.arg2).map_err(|e| {
        DriverError::MalformedTrap(format!("trap #{} on VCPU {}: {}", raw.seq, raw.vcpu, e))
    })?;
    Ok(Event {
        vcpu: raw.vcpu,
        kind,
    })
}

/// Wait up to `timeout` for the next event produced by an armed intercept.
///
/// A zero timeout polls: traps that are already pending are inspected and
/// the call returns without waiting. A timeout too large to express as a
/// deadline waits without bound. Returns [`DriverError::TornDown`] if
/// `closed` is raised while waiting.
pub fn listen(
    driver: &dyn Driver,
    tracker: &Mutex<InterceptTracker>,
    closed: &AtomicBool,
    timeout: Duration,
) -> Result<Option<Event>, DriverError> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if closed.load(Ordering::Acquire) {
            return Err(DriverError::TornDown);
        }

        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => timeout,
        };
        let raw = match driver.listen(remaining)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let event = normalize(&raw)?;
        if closed.load(Ordering::Acquire) {
            // Teardown started while this trap was in flight.
            if let Err(e) = driver.reply_event(&event, EventReply::Continue) {
                debug!("Trap #{} not acknowledged on teardown: {}", raw.seq, e);
            }
            return Err(DriverError::TornDown);
        }

        if lock(tracker).accepts(&event) {
            trace!("Trap #{} delivered: {}", raw.seq, event);
            return Ok(Some(event));
        }

        debug!(
            "Discarding trap #{} ({}) on VCPU {}: intercept no longer armed",
            raw.seq,
            event.kind.intercept(),
            event.vcpu
        );
        driver.reply_event(&event, EventReply::Continue)?;
    }
}
