//! `dummy` backend: introspection of an in-process simulated guest.
//!
//! Explicit-only. Auto-detection never attaches to a simulated VM.
//!
//! Parameters: `common.vm_name` (required), the optional `dummy` section,
//! and the extensions `dummy.memory_size` / `dummy.vcpu_count`, which
//! override the section. They only matter when no guest with that name is
//! running yet and the backend has to launch one.

mod guest;

pub use guest::{GuestController, GuestError, BOOT_CR3, BOOT_RIP, BOOT_STACK_POINTER};

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use super::{BackendEntry, Driver, RawTrap};
use crate::api::{Access, BackendId, InitParams, InterceptType, PageFrame, Registers};
use crate::error::{DriverError, InitError};
use crate::lock;
use crate::verified::registers::apply_x86;
use guest::{frame_count, GuestState};

pub const NAME: &str = "dummy";

const KNOWN_EXTENSIONS: &[&str] = &["memory_size", "vcpu_count"];

pub fn entry() -> BackendEntry {
    BackendEntry {
        id: BackendId::DUMMY,
        name: NAME,
        auto_detect: false,
        detect,
        create,
    }
}

/// Always available: the guest lives in this process.
fn detect(_params: &InitParams) -> bool {
    true
}

fn parse_number(key: &str, value: &str) -> Result<u64, InitError> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| InitError::rejected(NAME, format!("{} must be a number, got {:?}", key, value)))
}

fn create(params: &InitParams) -> Result<Arc<dyn Driver>, InitError> {
    let vm_name = params.require_vm_name(NAME)?;
    let extensions = params.extensions_for(NAME, KNOWN_EXTENSIONS)?;

    let mut config = params.dummy.clone().unwrap_or_default();
    if let Some(value) = extensions.get("memory_size") {
        config.memory_size = parse_number("memory_size", value)?;
    }
    if let Some(value) = extensions.get("vcpu_count") {
        config.vcpu_count = u16::try_from(parse_number("vcpu_count", value)?)
            .map_err(|_| InitError::rejected(NAME, "vcpu_count out of range"))?;
    }

    let guest = match GuestController::find(vm_name) {
        Some(guest) => {
            debug!("Attaching to running guest {:?}", vm_name);
            guest
        }
        None => GuestController::launch(vm_name, config).map_err(|e| match e {
            GuestError::InvalidSize { .. } | GuestError::NoVcpus => {
                InitError::rejected(NAME, e.to_string())
            }
            other => InitError::backend_failure(NAME, DriverError::backend(other.to_string())),
        })?,
    };

    let driver = DummyDriver::attach(guest).map_err(|e| InitError::backend_failure(NAME, e))?;
    Ok(Arc::new(driver))
}

/// Introspection session on a [`GuestController`].
pub struct DummyDriver {
    guest: GuestController,
    session: u64,
    closed: AtomicBool,
}

impl DummyDriver {
    /// Attach to `guest`. A guest accepts one session at a time.
    pub fn attach(guest: GuestController) -> Result<Self, DriverError> {
        let session = {
            let mut state = lock(&guest.shared.state);
            if state.attached {
                return Err(DriverError::backend(format!(
                    "guest {:?} already has an introspection session",
                    guest.name()
                )));
            }
            state.attached = true;
            state.session += 1;
            state.session
        };
        info!("Attached to guest {:?} (session {})", guest.name(), session);
        Ok(Self {
            guest,
            session,
            closed: AtomicBool::new(false),
        })
    }

    pub fn guest(&self) -> &GuestController {
        &self.guest
    }

    fn check_vcpu(&self, vcpu: u16) -> Result<usize, DriverError> {
        if vcpu >= self.guest.vcpu_count() {
            return Err(DriverError::InvalidArgument(format!(
                "VCPU {} out of range",
                vcpu
            )));
        }
        Ok(usize::from(vcpu))
    }

    fn check_session(&self, state: &GuestState) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) || !state.attached || state.session != self.session
        {
            return Err(DriverError::TornDown);
        }
        Ok(())
    }

    fn check_frame(&self, state: &GuestState, frame: u64) -> Result<(), DriverError> {
        if frame >= frame_count(self.guest.memory_size()) || state.unreadable.contains(&frame) {
            return Err(DriverError::FrameNotMapped(frame));
        }
        Ok(())
    }

    fn detach(&self) {
        let mut state = lock(&self.guest.shared.state);
        if state.attached && state.session == self.session {
            state.attached = false;
            state.armed.clear();
            state.pending.clear();
            state.page_access.clear();
            info!("Detached from guest {:?}", self.guest.name());
        }
    }
}

impl Driver for DummyDriver {
    fn backend_id(&self) -> BackendId {
        BackendId::DUMMY
    }

    fn vcpu_count(&self) -> Result<u16, DriverError> {
        Ok(self.guest.vcpu_count())
    }

    fn pause(&self) -> Result<(), DriverError> {
        let mut state = lock(&self.guest.shared.state);
        state.paused = true;
        Ok(())
    }

    fn resume(&self) -> Result<(), DriverError> {
        let shared = &self.guest.shared;
        let mut state = lock(&shared.state);
        if !state.paused {
            return Err(DriverError::NotPaused);
        }
        state.paused = false;
        let queued = state.pending.len();
        let replayed = state.run_deferred(&shared.memory);
        if state.pending.len() > queued {
            shared.trap_ready.notify_all();
        }
        replayed.map_err(|e| DriverError::backend(e.to_string()))
    }

    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), DriverError> {
        let shared = &self.guest.shared;
        let frame = PageFrame::containing(paddr).number;
        let state = lock(&shared.state);
        self.check_frame(&state, frame)?;
        shared
            .memory
            .read(paddr, buf)
            .map_err(|_| DriverError::FrameNotMapped(frame))
    }

    fn write_physical(&self, paddr: u64, buf: &[u8]) -> Result<(), DriverError> {
        let shared = &self.guest.shared;
        let frame = PageFrame::containing(paddr).number;
        let state = lock(&shared.state);
        self.check_frame(&state, frame)?;
        shared
            .memory
            .write(paddr, buf)
            .map_err(|_| DriverError::FrameNotMapped(frame))
    }

    fn max_physical_address(&self) -> Result<u64, DriverError> {
        Ok(self.guest.memory_size() - 1)
    }

    fn read_registers(&self, vcpu: u16) -> Result<Registers, DriverError> {
        self.check_vcpu(vcpu)?;
        self.guest
            .registers(vcpu)
            .map_err(|e| DriverError::InvalidArgument(e.to_string()))
    }

    fn write_registers(&self, vcpu: u16, regs: &Registers) -> Result<(), DriverError> {
        let index = self.check_vcpu(vcpu)?;
        let mut state = lock(&self.guest.shared.state);
        let v = &mut state.vcpus[index];
        match regs {
            Registers::X86(x86) => apply_x86(x86, &mut v.regs, &mut v.sregs, &mut v.msrs),
        }
        Ok(())
    }

    fn get_page_access(&self, paddr: u64) -> Result<Access, DriverError> {
        let frame = PageFrame::containing(paddr).number;
        let state = lock(&self.guest.shared.state);
        self.check_frame(&state, frame)?;
        Ok(state.access_of(frame))
    }

    fn set_page_access(&self, paddr: u64, access: Access) -> Result<(), DriverError> {
        let frame = PageFrame::containing(paddr).number;
        let mut state = lock(&self.guest.shared.state);
        self.check_session(&state)?;
        self.check_frame(&state, frame)?;
        state.restrict(frame, access);
        Ok(())
    }

    fn toggle_intercept(
        &self,
        vcpu: u16,
        intercept: InterceptType,
        enabled: bool,
    ) -> Result<(), DriverError> {
        self.check_vcpu(vcpu)?;
        let mut state = lock(&self.guest.shared.state);
        self.check_session(&state)?;
        if enabled {
            state.armed.insert((vcpu, intercept));
        } else {
            state.armed.remove(&(vcpu, intercept));
        }
        Ok(())
    }

    fn listen(&self, timeout: Duration) -> Result<Option<RawTrap>, DriverError> {
        let shared = &self.guest.shared;
        let deadline = Instant::now().checked_add(timeout);
        let mut state = lock(&shared.state);
        loop {
            if self.closed.load(Ordering::Acquire) || state.session != self.session {
                return Err(DriverError::TornDown);
            }
            if let Some(trap) = state.pending.pop_front() {
                return Ok(Some(trap));
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    shared
                        .trap_ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => shared
                    .trap_ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn shutdown(&self) {
        // Raised under the state lock so a listener cannot miss the wakeup
        // between its check and its wait.
        let _state = lock(&self.guest.shared.state);
        self.closed.store(true, Ordering::Release);
        self.guest.shared.trap_ready.notify_all();
    }

    fn close(&self) -> Result<(), DriverError> {
        self.detach();
        Ok(())
    }
}

impl Drop for DummyDriver {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CrType, DummyInitParams, Event, EventKind, PAGE_SIZE};
    use crate::dispatch::normalize;
    use std::thread;

    fn attach(name: &str) -> (GuestController, DummyDriver) {
        let guest = GuestController::launch(
            name,
            DummyInitParams {
                memory_size: 64 * 1024,
                vcpu_count: 2,
            },
        )
        .unwrap();
        let driver = DummyDriver::attach(guest.clone()).unwrap();
        (guest, driver)
    }

    fn event(driver: &DummyDriver) -> Option<Event> {
        driver
            .listen(Duration::ZERO)
            .unwrap()
            .map(|raw| normalize(&raw).unwrap())
    }

    #[test]
    fn create_requires_vm_name() {
        assert!(matches!(
            create(&InitParams::default()),
            Err(InitError::RejectedParameters { .. })
        ));
    }

    #[test]
    fn create_applies_extensions() {
        let params = InitParams::for_vm("dummy-ext")
            .with_extension("dummy.memory_size", "0x20000", true)
            .with_extension("dummy.vcpu_count", "3", true);
        let driver = create(&params).unwrap();
        assert_eq!(driver.vcpu_count().unwrap(), 3);
        assert_eq!(driver.max_physical_address().unwrap(), 0x1ffff);
    }

    #[test]
    fn create_rejects_bad_extension_value() {
        let params =
            InitParams::for_vm("dummy-ext-bad").with_extension("dummy.vcpu_count", "many", true);
        assert!(matches!(
            create(&params),
            Err(InitError::RejectedParameters { .. })
        ));
    }

    #[test]
    fn only_armed_traps_are_queued() {
        let (guest, driver) = attach("dummy-armed");
        guest.write_cr(0, CrType::Cr3, 0x1000).unwrap();
        assert_eq!(event(&driver), None);

        driver
            .toggle_intercept(1, InterceptType::Breakpoint, true)
            .unwrap();
        guest.breakpoint(0, 0x4000, 1).unwrap();
        guest.breakpoint(1, 0x5000, 1).unwrap();
        assert_eq!(
            event(&driver),
            Some(Event {
                vcpu: 1,
                kind: EventKind::Breakpoint {
                    gpa: 0x5000,
                    insn_len: 1
                }
            })
        );
        assert_eq!(event(&driver), None);
    }

    #[test]
    fn traps_keep_guest_order() {
        let (guest, driver) = attach("dummy-order");
        driver
            .toggle_intercept(0, InterceptType::Singlestep, true)
            .unwrap();
        for gpa in [0x1000, 0x1001, 0x1003] {
            guest.singlestep(0, gpa).unwrap();
        }
        let mut seen = Vec::new();
        while let Some(raw) = driver.listen(Duration::ZERO).unwrap() {
            seen.push((raw.seq, raw.arg0));
        }
        assert_eq!(seen, vec![(0, 0x1000), (1, 0x1001), (2, 0x1003)]);
    }

    #[test]
    fn paused_activity_replayed_on_resume() {
        let (guest, driver) = attach("dummy-defer");
        driver
            .toggle_intercept(0, InterceptType::Interrupt, true)
            .unwrap();
        driver.pause().unwrap();
        guest.interrupt(0, 14, 0x2).unwrap();
        assert_eq!(event(&driver), None);

        driver.resume().unwrap();
        assert_eq!(
            event(&driver).map(|e| e.kind),
            Some(EventKind::Interrupt {
                vector: 14,
                info: 0x2
            })
        );
        assert!(matches!(driver.resume(), Err(DriverError::NotPaused)));
    }

    #[test]
    fn listen_wakes_on_trap() {
        let (guest, driver) = attach("dummy-wake");
        driver
            .toggle_intercept(0, InterceptType::Cr(CrType::Cr4), true)
            .unwrap();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            guest.write_cr(0, CrType::Cr4, 0x20).unwrap();
        });
        let raw = driver.listen(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
        assert_eq!(raw.map(|r| r.class), Some(1));
    }

    #[test]
    fn shutdown_unblocks_listen() {
        let (_guest, driver) = attach("dummy-shutdown");
        let driver = Arc::new(driver);
        let listener = {
            let driver = Arc::clone(&driver);
            thread::spawn(move || driver.listen(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        driver.shutdown();
        assert!(matches!(
            listener.join().unwrap(),
            Err(DriverError::TornDown)
        ));
        assert!(matches!(
            driver.listen(Duration::ZERO),
            Err(DriverError::TornDown)
        ));
    }

    #[test]
    fn listen_without_deadline_waits_for_trap() {
        let (guest, driver) = attach("dummy-unbounded");
        driver
            .toggle_intercept(1, InterceptType::Singlestep, true)
            .unwrap();
        let stepper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            guest.singlestep(1, 0x8000).unwrap();
        });
        let raw = driver.listen(Duration::MAX).unwrap().unwrap();
        stepper.join().unwrap();
        assert_eq!((raw.vcpu, raw.arg0), (1, 0x8000));
    }

    #[test]
    fn toggle_refused_after_shutdown() {
        let (_guest, driver) = attach("dummy-shutdown-toggle");
        driver
            .toggle_intercept(0, InterceptType::Breakpoint, true)
            .unwrap();
        driver.shutdown();
        assert!(matches!(
            driver.toggle_intercept(0, InterceptType::Breakpoint, false),
            Err(DriverError::TornDown)
        ));
    }

    #[test]
    fn restricted_page_raises_pagefault() {
        let (guest, driver) = attach("dummy-pagefault");
        driver
            .toggle_intercept(0, InterceptType::Pagefault, true)
            .unwrap();
        assert_eq!(driver.get_page_access(0x4000).unwrap(), Access::RWX);

        let mut access = driver.get_page_access(0x4000).unwrap();
        access &= !Access::X;
        driver.set_page_access(0x4000, access).unwrap();
        assert_eq!(driver.get_page_access(0x4abc).unwrap(), Access::RW);

        guest
            .access_memory(0, 0xffff_8000_0000_4010, 0x4010, Access::W)
            .unwrap();
        assert_eq!(event(&driver), None);
        guest
            .access_memory(0, 0xffff_8000_0000_4010, 0x4010, Access::RX)
            .unwrap();
        assert_eq!(
            event(&driver).map(|e| e.kind),
            Some(EventKind::Pagefault {
                gva: 0xffff_8000_0000_4010,
                gpa: 0x4010,
                access: Access::X
            })
        );
        assert!(matches!(
            driver.get_page_access(0x10000),
            Err(DriverError::FrameNotMapped(0x10))
        ));

        driver.close().unwrap();
        assert_eq!(guest.page_access(4), Access::RWX);
    }

    #[test]
    fn unreadable_frames_reported() {
        let (guest, driver) = attach("dummy-holes");
        guest.set_frame_readable(3, false);
        let mut buf = [0u8; PAGE_SIZE];
        assert!(matches!(
            driver.read_physical(0x3000, &mut buf),
            Err(DriverError::FrameNotMapped(3))
        ));
        driver.read_physical(0x2000, &mut buf).unwrap();
        guest.set_frame_readable(3, true);
        driver.read_physical(0x3000, &mut buf).unwrap();
        assert!(matches!(
            driver.read_physical(0x10000, &mut buf),
            Err(DriverError::FrameNotMapped(0x10))
        ));
    }

    #[test]
    fn introspector_writes_memory_and_registers() {
        let (guest, driver) = attach("dummy-writes");
        driver.write_physical(0x1000, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        driver.read_physical(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        let Registers::X86(mut regs) = driver.read_registers(1).unwrap();
        regs.rax = 0x1337;
        driver.write_registers(1, &Registers::X86(regs)).unwrap();
        let Registers::X86(after) = guest.registers(1).unwrap();
        assert_eq!(after.rax, 0x1337);
    }

    #[test]
    fn second_session_refused_until_close() {
        let (guest, driver) = attach("dummy-exclusive");
        assert!(DummyDriver::attach(guest.clone()).is_err());
        driver.close().unwrap();
        assert!(!guest.is_attached());
        drop(driver);
        assert!(DummyDriver::attach(guest).is_ok());
    }
}
