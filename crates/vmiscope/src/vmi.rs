//! The runtime facade.
//!
//! [`Vmi`] is the single owner of a driver for the lifetime of one
//! introspection session. It selects and initializes the backend, keeps
//! the intercept tracker and the pause state, validates every call and
//! routes it to the driver.
//!
//! All methods take `&self`: a client may run [`Vmi::listen`] on one
//! thread while pausing, reading and toggling from another. Nothing makes
//! a *sequence* of calls atomic, so a client that needs a consistent
//! snapshot pauses, reads, and resumes under its own lock.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use vmiscope::{BackendSelector, CrType, InitParams, InterceptType, Vmi};
//!
//! let vmi = Vmi::init(BackendSelector::Auto, &InitParams::for_vm("windows10"))?;
//! for vcpu in 0..vmi.vcpu_count()? {
//!     vmi.toggle_intercept(vcpu, InterceptType::Cr(CrType::Cr3), true)?;
//! }
//! while let Some(event) = vmi.listen(Duration::from_millis(1000))? {
//!     println!("{}", event);
//! }
//! vmi.destroy();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::api::{
    Access, BackendId, Event, EventReply, InitParams, InterceptType, MemoryPage, PageFrame, Registers,
    PAGE_SHIFT, PAGE_SIZE,
};
use crate::dispatch;
use crate::driver::{create_driver, registered_backends, BackendSelector, Driver};
use crate::error::{DriverError, InitError};
use crate::intercept::InterceptTracker;
use crate::lock;

/// Name used when the facade itself rejects parameters, before any
/// backend has seen them.
const FACADE: &str = "vmiscope";

/// One introspection session.
pub struct Vmi {
    backend_name: &'static str,
    backend_id: BackendId,
    /// `None` once the session is destroyed.
    driver: RwLock<Option<Arc<dyn Driver>>>,
    closed: AtomicBool,
    tracker: Mutex<InterceptTracker>,
    paused: Mutex<bool>,
}

impl Vmi {
    /// Select a backend and open a session on the VM named in `params`.
    pub fn init(selector: BackendSelector, params: &InitParams) -> Result<Self, InitError> {
        params.check_version(FACADE)?;
        let backends: Vec<&str> = registered_backends().iter().map(|e| e.name).collect();
        params.check_extension_targets(FACADE, &backends)?;
        debug!(
            "Initializing session for {:?} with {:?}",
            params.vm_name(),
            selector
        );
        let (entry, driver) = create_driver(selector, params)?;
        info!(
            "Session opened on {:?} with backend {}",
            params.vm_name().unwrap_or("<unnamed>"),
            entry.name
        );
        Ok(Self::with_driver(entry.name, driver))
    }

    /// Wrap an already-connected driver.
    pub fn with_driver(backend_name: &'static str, driver: Arc<dyn Driver>) -> Self {
        Self {
            backend_name,
            backend_id: driver.backend_id(),
            driver: RwLock::new(Some(driver)),
            closed: AtomicBool::new(false),
            tracker: Mutex::new(InterceptTracker::new()),
            paused: Mutex::new(false),
        }
    }

    fn driver(&self) -> Result<Arc<dyn Driver>, DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::InvalidHandle);
        }
        let guard = self
            .driver
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.clone().ok_or(DriverError::InvalidHandle)
    }

    fn check_vcpu(&self, driver: &dyn Driver, vcpu: u16) -> Result<(), DriverError> {
        let count = driver.vcpu_count()?;
        if vcpu >= count {
            return Err(DriverError::InvalidArgument(format!(
                "VCPU {} out of range (VM has {})",
                vcpu, count
            )));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Session metadata
    // ═══════════════════════════════════════════════════════════════════

    pub fn backend_id(&self) -> Result<BackendId, DriverError> {
        self.driver()?;
        Ok(self.backend_id)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn vcpu_count(&self) -> Result<u16, DriverError> {
        self.driver()?.vcpu_count()
    }

    pub fn is_destroyed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Execution control
    // ═══════════════════════════════════════════════════════════════════

    /// Pause every vCPU. Pausing an already paused VM does nothing.
    pub fn pause(&self) -> Result<(), DriverError> {
        let driver = self.driver()?;
        let mut paused = lock(&self.paused);
        if *paused {
            debug!("Pause requested while already paused");
            return Ok(());
        }
        driver.pause()?;
        *paused = true;
        Ok(())
    }

    /// Resume a VM paused through this session.
    pub fn resume(&self) -> Result<(), DriverError> {
        let driver = self.driver()?;
        let mut paused = lock(&self.paused);
        if !*paused {
            return Err(DriverError::NotPaused);
        }
        driver.resume()?;
        *paused = false;
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        *lock(&self.paused)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Physical memory
    // ═══════════════════════════════════════════════════════════════════

    /// Read `len` bytes at `paddr`. The range must lie inside one frame.
    pub fn read_physical(&self, paddr: u64, len: usize) -> Result<Vec<u8>, DriverError> {
        let mut buf = vec![0u8; len];
        self.read_physical_into(paddr, &mut buf)?;
        Ok(buf)
    }

    pub fn read_physical_into(&self, paddr: u64, buf: &mut [u8]) -> Result<(), DriverError> {
        let driver = self.driver()?;
        check_frame_window(paddr, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        driver.read_physical(paddr, buf)
    }

    /// Write `buf` at `paddr`. The range must lie inside one frame.
    pub fn write_physical(&self, paddr: u64, buf: &[u8]) -> Result<(), DriverError> {
        let driver = self.driver()?;
        check_frame_window(paddr, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        driver.write_physical(paddr, buf)
    }

    /// Read one full frame.
    pub fn read_page(&self, frame: u64) -> Result<MemoryPage, DriverError> {
        let paddr = frame.checked_shl(PAGE_SHIFT).filter(|p| p >> PAGE_SHIFT == frame);
        let paddr = paddr.ok_or_else(|| {
            DriverError::InvalidArgument(format!("frame {:#x} is outside the address space", frame))
        })?;
        let mut page = MemoryPage::zeroed(frame);
        self.read_physical_into(paddr, &mut page.data)?;
        Ok(page)
    }

    /// Inclusive last valid guest physical address.
    pub fn max_physical_address(&self) -> Result<u64, DriverError> {
        self.driver()?.max_physical_address()
    }

    /// Access rights on the page containing `paddr`.
    pub fn get_page_access(&self, paddr: u64) -> Result<Access, DriverError> {
        self.driver()?.get_page_access(paddr)
    }

    /// Restrict the page containing `paddr`. Guest accesses outside
    /// `access` produce [`EventKind::Pagefault`](crate::EventKind::Pagefault)
    /// events on vCPUs with [`InterceptType::Pagefault`] armed.
    pub fn set_page_access(&self, paddr: u64, access: Access) -> Result<(), DriverError> {
        self.driver()?.set_page_access(paddr, access)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Registers
    // ═══════════════════════════════════════════════════════════════════

    pub fn read_registers(&self, vcpu: u16) -> Result<Registers, DriverError> {
        let driver = self.driver()?;
        self.check_vcpu(driver.as_ref(), vcpu)?;
        driver.read_registers(vcpu)
    }

    pub fn write_registers(&self, vcpu: u16, regs: &Registers) -> Result<(), DriverError> {
        let driver = self.driver()?;
        self.check_vcpu(driver.as_ref(), vcpu)?;
        driver.write_registers(vcpu, regs)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Intercepts and events
    // ═══════════════════════════════════════════════════════════════════

    /// Arm or disarm one intercept on one vCPU.
    ///
    /// The tracker is updated only after the backend acknowledges.
    pub fn toggle_intercept(
        &self,
        vcpu: u16,
        intercept: InterceptType,
        enabled: bool,
    ) -> Result<(), DriverError> {
        let driver = self.driver()?;
        self.check_vcpu(driver.as_ref(), vcpu)?;
        let mut tracker = self.open_tracker()?;
        tracker.toggle(driver.as_ref(), vcpu, intercept, enabled)
    }

    /// Replace the armed intercept `old` by `new` on one vCPU.
    ///
    /// Once this returns, no trap produced by `old` is delivered.
    pub fn retarget_intercept(
        &self,
        vcpu: u16,
        old: InterceptType,
        new: InterceptType,
    ) -> Result<(), DriverError> {
        let driver = self.driver()?;
        self.check_vcpu(driver.as_ref(), vcpu)?;
        let mut tracker = self.open_tracker()?;
        tracker.retarget(driver.as_ref(), vcpu, old, new)
    }

    /// Lock the tracker for a change. `destroy` raises `closed` before it
    /// drains under this lock, so a change that gets past the check is
    /// always undone by teardown.
    fn open_tracker(&self) -> Result<MutexGuard<'_, InterceptTracker>, DriverError> {
        let tracker = lock(&self.tracker);
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::InvalidHandle);
        }
        Ok(tracker)
    }

    pub fn is_armed(&self, vcpu: u16, intercept: InterceptType) -> bool {
        lock(&self.tracker).is_armed(vcpu, intercept)
    }

    pub fn armed_intercepts(&self, vcpu: u16) -> Vec<InterceptType> {
        lock(&self.tracker).armed(vcpu)
    }

    pub fn all_armed(&self) -> Vec<(u16, InterceptType)> {
        lock(&self.tracker).all_armed()
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// `Ok(None)` means the timeout expired. A zero timeout never waits.
    /// Fails with [`DriverError::TornDown`] if the session is destroyed
    /// while waiting.
    pub fn listen(&self, timeout: Duration) -> Result<Option<Event>, DriverError> {
        let driver = self.driver()?;
        dispatch::listen(driver.as_ref(), &self.tracker, &self.closed, timeout)
    }

    pub fn reply_event(&self, event: &Event, reply: EventReply) -> Result<(), DriverError> {
        self.driver()?.reply_event(event, reply)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Teardown
    // ═══════════════════════════════════════════════════════════════════

    /// End the session.
    ///
    /// Disarms every tracked intercept and resumes the VM if this session
    /// paused it, while the backend still accepts calls. Then shuts the
    /// backend down, which unblocks any thread waiting in [`Vmi::listen`],
    /// and releases it. Cleanup failures are logged and do not stop the
    /// release. Calling it again is a no-op; every other method then
    /// fails with [`DriverError::InvalidHandle`].
    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let driver = self
            .driver
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(driver) = driver else {
            return;
        };

        let armed = lock(&self.tracker).drain();
        for (vcpu, intercept) in armed {
            if let Err(e) = driver.toggle_intercept(vcpu, intercept, false) {
                warn!("VCPU {}: failed to disarm {} on teardown: {}", vcpu, intercept, e);
            }
        }

        let mut paused = lock(&self.paused);
        if *paused {
            if let Err(e) = driver.resume() {
                warn!("Failed to resume VM on teardown: {}", e);
            }
            *paused = false;
        }
        drop(paused);

        driver.shutdown();
        if let Err(e) = driver.close() {
            warn!("Failed to close backend {}: {}", self.backend_name, e);
        }
        info!("Session on backend {} closed", self.backend_name);
    }
}

impl Drop for Vmi {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Reject ranges longer than a page or crossing a frame boundary.
fn check_frame_window(paddr: u64, len: usize) -> Result<(), DriverError> {
    if len > PAGE_SIZE {
        return Err(DriverError::InvalidArgument(format!(
            "{} bytes requested, at most {} per call",
            len, PAGE_SIZE
        )));
    }
    if len > PageFrame::containing(paddr).window_len() {
        return Err(DriverError::InvalidArgument(format!(
            "{} bytes at {:#x} cross a frame boundary",
            len, paddr
        )));
    }
    Ok(())
}
