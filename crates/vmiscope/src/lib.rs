//! Hypervisor-agnostic virtual machine introspection runtime.
//!
//! vmiscope lets a client inspect and monitor a running VM without
//! knowing which hypervisor hosts it. A pluggable backend implements the
//! [`Driver`] contract; the runtime selects one, and wraps it in a
//! [`Vmi`] session that validates calls, tracks which intercepts are
//! armed, and turns backend traps into uniform [`Event`]s.
//!
//! # Architecture
//!
//! ```text
//! client ──→ Vmi (facade) ──→ dyn Driver ──→ hypervisor / recording / dummy
//!              │    ▲
//!              │    └── dispatch: RawTrap → Event, filtered by the tracker
//!              └── InterceptTracker: armed (vCPU, intercept) pairs
//! ```
//!
//! - **[`api`]**: data model shared by every layer
//! - **[`driver`]**: the backend contract, the registry, built-in backends
//! - **[`memory`]**: guest physical memory as a byte stream, page scans
//! - **[`recording`]**: snapshots and trap streams for the replay backend
//! - **[`capi`]**: the exported C boundary
//! - **[`verified`]**: pure trap and register mapping functions

pub mod api;
pub mod capi;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod intercept;
pub mod logging;
pub mod memory;
pub mod recording;
pub mod verified;
mod vmi;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use api::{
    Access, BackendId, CrType, Event, EventKind, EventReply, InitParams, InterceptType,
    MemoryPage, Registers, TrapClass, X86Registers, PAGE_SHIFT, PAGE_SIZE,
};
pub use driver::{register_backend, BackendEntry, BackendSelector, Driver, RawTrap};
pub use error::{DriverError, InitError, SerializeError};
pub use memory::{Memory, PaddedMemory, ScanSummary};
pub use recording::{Recorder, Recording};
pub use vmi::Vmi;

/// Lock a mutex, recovering the data if a holder panicked. Every mutex in
/// this crate guards state that stays consistent across a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
