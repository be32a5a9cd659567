//! The driver contract and the backend registry.
//!
//! A backend implements [`Driver`] for one hypervisor technology and is
//! registered under a stable [`BackendId`]. The facade picks a backend
//! through [`create_driver`], either explicitly or by probing every
//! auto-detectable entry in registration order, and from then on talks to
//! it only through `Arc<dyn Driver>`.
//!
//! Drivers take `&self` everywhere: the hypervisor connection is shared
//! between a thread blocked in [`Driver::listen`] and threads issuing
//! pause, read and toggle calls, so each backend synchronises internally.

pub mod dummy;
pub mod replay;

use log::{debug, info, warn};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::api::{Access, BackendId, Event, EventReply, InitParams, InterceptType, Registers};
use crate::error::{DriverError, InitError};
use crate::lock;
use crate::verified::traps::encode_trap;

// ═══════════════════════════════════════════════════════════════════════
//  Native trap record
// ═══════════════════════════════════════════════════════════════════════

/// Fixed-layout trap record produced by a backend's blocking primitive.
///
/// The meaning of `arg0..arg2` depends on `class`; see
/// [`verified::traps`](crate::verified::traps) for the table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTrap {
    /// Backend sequence number, strictly increasing per session.
    pub seq: u64,
    pub vcpu: u16,
    pub class: u32,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
}

impl RawTrap {
    /// Encode a normalized event as a native record.
    pub fn from_event(seq: u64, event: &Event) -> Self {
        let (class, arg0, arg1, arg2) = encode_trap(&event.kind);
        Self {
            seq,
            vcpu: event.vcpu,
            class,
            arg0,
            arg1,
            arg2,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Driver contract
// ═══════════════════════════════════════════════════════════════════════

/// Capability set every introspection backend exposes.
///
/// Memory and register access do not pause the guest. Callers that need a
/// consistent snapshot pause first.
pub trait Driver: Send + Sync {
    fn backend_id(&self) -> BackendId;

    fn vcpu_count(&self) -> Result<u16, DriverError>;

    fn pause(&self) -> Result<(), DriverError>;

    fn resume(&self) -> Result<(), DriverError>;

    /// Fill `buf` from guest physical memory at `paddr`.
    ///
    /// The facade never passes a range that crosses a frame boundary.
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), DriverError>;

    fn write_physical(&self, _paddr: u64, _buf: &[u8]) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("write_physical"))
    }

    /// Inclusive last valid guest physical address.
    fn max_physical_address(&self) -> Result<u64, DriverError>;

    fn read_registers(&self, vcpu: u16) -> Result<Registers, DriverError>;

    fn write_registers(&self, _vcpu: u16, _regs: &Registers) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("write_registers"))
    }

    /// Access rights on the page containing `paddr`.
    fn get_page_access(&self, _paddr: u64) -> Result<Access, DriverError> {
        Err(DriverError::Unsupported("get_page_access"))
    }

    /// Restrict the page containing `paddr` to `access`. A guest access
    /// outside it raises a pagefault trap when that intercept is armed.
    fn set_page_access(&self, _paddr: u64, _access: Access) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("set_page_access"))
    }

    /// Arm or disarm one trap on one vCPU. Must work while the guest runs.
    ///
    /// Returns only once the backend has acknowledged the change.
    fn toggle_intercept(
        &self,
        vcpu: u16,
        intercept: InterceptType,
        enabled: bool,
    ) -> Result<(), DriverError>;

    /// Block up to `timeout` for the next trap.
    ///
    /// A zero timeout polls once. Returns `Ok(None)` when the budget runs
    /// out and [`DriverError::TornDown`] once [`Driver::shutdown`] was
    /// called.
    fn listen(&self, timeout: Duration) -> Result<Option<RawTrap>, DriverError>;

    /// Acknowledge a delivered (or discarded) event.
    fn reply_event(&self, _event: &Event, _reply: EventReply) -> Result<(), DriverError> {
        Ok(())
    }

    /// Wake every thread blocked in [`Driver::listen`] and make later calls
    /// fail with [`DriverError::TornDown`].
    ///
    /// The facade disarms every intercept and resumes the guest before
    /// calling this, so nothing is left to undo afterwards.
    fn shutdown(&self);

    /// Release backend resources. Called once, after `shutdown`.
    fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry
// ═══════════════════════════════════════════════════════════════════════

/// Whether a backend can serve a session at all (host support present,
/// its parameter section supplied).
pub type DetectFn = fn(&InitParams) -> bool;

/// Construct a connected driver.
pub type CreateFn = fn(&InitParams) -> Result<Arc<dyn Driver>, InitError>;

/// One registered backend.
#[derive(Clone, Copy)]
pub struct BackendEntry {
    pub id: BackendId,
    pub name: &'static str,
    /// Tried by [`BackendSelector::Auto`].
    pub auto_detect: bool,
    pub detect: DetectFn,
    pub create: CreateFn,
}

impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("auto_detect", &self.auto_detect)
            .finish()
    }
}

/// How [`create_driver`] picks a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelector {
    /// Try auto-detectable backends in registration order.
    Auto,
    Explicit(BackendId),
}

impl From<Option<BackendId>> for BackendSelector {
    fn from(id: Option<BackendId>) -> Self {
        match id {
            Some(id) => BackendSelector::Explicit(id),
            None => BackendSelector::Auto,
        }
    }
}

fn builtin_backends() -> Vec<BackendEntry> {
    vec![replay::entry(), dummy::entry()]
}

fn registry() -> &'static Mutex<Vec<BackendEntry>> {
    static REGISTRY: OnceLock<Mutex<Vec<BackendEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(builtin_backends()))
}

/// Register an external backend. It is tried after every backend that was
/// registered before it.
pub fn register_backend(entry: BackendEntry) -> Result<(), InitError> {
    let mut entries = lock(registry());
    if entries.iter().any(|e| e.id == entry.id) {
        return Err(InitError::DuplicateBackend(entry.id));
    }
    info!("Registered backend {} ({})", entry.name, entry.id.0);
    entries.push(entry);
    Ok(())
}

/// Snapshot of the registry, in priority order.
pub fn registered_backends() -> Vec<BackendEntry> {
    lock(registry()).clone()
}

pub fn lookup_backend(id: BackendId) -> Option<BackendEntry> {
    lock(registry()).iter().find(|e| e.id == id).copied()
}

/// Select and initialize a backend.
pub fn create_driver(
    selector: BackendSelector,
    params: &InitParams,
) -> Result<(BackendEntry, Arc<dyn Driver>), InitError> {
    match selector {
        BackendSelector::Explicit(id) => {
            let entry = lookup_backend(id).ok_or(InitError::UnknownBackend(id))?;
            debug!("Initializing explicitly selected backend {}", entry.name);
            let driver = (entry.create)(params)?;
            Ok((entry, driver))
        }
        BackendSelector::Auto => {
            let mut first_error = None;
            for entry in registered_backends().into_iter().filter(|e| e.auto_detect) {
                if !(entry.detect)(params) {
                    debug!("Backend {} not available", entry.name);
                    continue;
                }
                match (entry.create)(params) {
                    Ok(driver) => {
                        info!("Auto-detected backend {}", entry.name);
                        return Ok((entry, driver));
                    }
                    Err(e) => {
                        warn!("Backend {} failed to initialize: {}", entry.name, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
            Err(first_error.unwrap_or(InitError::NoBackendAvailable))
        }
    }
}
