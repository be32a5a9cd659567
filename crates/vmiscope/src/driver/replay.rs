//! `replay` backend: plays a [`Recording`] back as if it were a live VM.
//!
//! The recorded trap stream is replayed in order while the VM is running.
//! A trap whose intercept is not armed when its turn comes is skipped,
//! exactly as a hypervisor would not have reported it. Register state
//! follows the replayed traps; memory is the recorded snapshot and is
//! read-only.
//!
//! Parameters: the `replay` section, or the `replay.recording` extension.
//! If `common.vm_name` is given it has to match the recorded VM.

use log::{debug, info, trace};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{BackendEntry, Driver, RawTrap};
use crate::api::{BackendId, InitParams, InterceptType, PageFrame, Registers};
use crate::error::{DriverError, InitError, SerializeError};
use crate::lock;
use crate::recording::Recording;
use crate::verified::registers::apply_event;

pub const NAME: &str = "replay";

const KNOWN_EXTENSIONS: &[&str] = &["recording"];

pub fn entry() -> BackendEntry {
    BackendEntry {
        id: BackendId::REPLAY,
        name: NAME,
        auto_detect: true,
        detect,
        create,
    }
}

/// Available whenever a recording is named.
fn detect(params: &InitParams) -> bool {
    params.replay.is_some() || params.extensions.contains_key("replay.recording")
}

fn recording_path(params: &InitParams) -> Result<PathBuf, InitError> {
    let extensions = params.extensions_for(NAME, KNOWN_EXTENSIONS)?;
    if let Some(path) = extensions.get("recording") {
        return Ok(PathBuf::from(path));
    }
    params
        .replay
        .as_ref()
        .map(|section| section.recording.clone())
        .ok_or_else(|| InitError::rejected(NAME, "no recording given"))
}

fn create(params: &InitParams) -> Result<Arc<dyn Driver>, InitError> {
    let path = recording_path(params)?;
    debug!("Loading recording {}", path.display());

    let recording = Recording::load(&path).map_err(|e| {
        let source = match e {
            SerializeError::Io(io) => DriverError::Io(io),
            other => DriverError::backend(format!(
                "Failed to load recording {}: {}",
                path.display(),
                other
            )),
        };
        InitError::backend_failure(NAME, source)
    })?;

    if let Some(wanted) = params.vm_name() {
        if wanted != recording.vm_name {
            return Err(InitError::rejected(
                NAME,
                format!(
                    "recording is of VM {:?}, not {:?}",
                    recording.vm_name, wanted
                ),
            ));
        }
    }
    if recording.registers.len() != usize::from(recording.vcpu_count) {
        return Err(InitError::rejected(
            NAME,
            format!(
                "recording has {} register sets for {} vCPUs",
                recording.registers.len(),
                recording.vcpu_count
            ),
        ));
    }

    info!(
        "Replaying {:?} from {} ({} traps)",
        recording.vm_name,
        path.display(),
        recording.traps.len()
    );
    Ok(Arc::new(ReplayDriver::new(recording)))
}

struct ReplayState {
    /// Index of the next recorded trap.
    cursor: usize,
    registers: Vec<Registers>,
    armed: BTreeSet<(u16, InterceptType)>,
    paused: bool,
}

/// Driver serving a loaded [`Recording`].
pub struct ReplayDriver {
    recording: Recording,
    state: Mutex<ReplayState>,
    /// Signalled on resume and shutdown.
    wake: Condvar,
    closed: AtomicBool,
}

impl ReplayDriver {
    pub fn new(recording: Recording) -> Self {
        let registers = recording.registers.clone();
        Self {
            recording,
            state: Mutex::new(ReplayState {
                cursor: 0,
                registers,
                armed: BTreeSet::new(),
                paused: false,
            }),
            wake: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of recorded traps not yet replayed.
    pub fn remaining(&self) -> usize {
        let state = lock(&self.state);
        self.recording.traps.len() - state.cursor
    }

    fn check_vcpu(&self, vcpu: u16) -> Result<usize, DriverError> {
        if vcpu >= self.recording.vcpu_count {
            return Err(DriverError::InvalidArgument(format!(
                "VCPU {} out of range",
                vcpu
            )));
        }
        Ok(usize::from(vcpu))
    }

    /// Advance the stream to the next armed trap, applying the register
    /// effect of every trap passed on the way.
    fn next_armed(&self, state: &mut ReplayState) -> Option<RawTrap> {
        while let Some(event) = self.recording.traps.get(state.cursor) {
            let seq = state.cursor as u64;
            state.cursor += 1;

            if let Some(Registers::X86(regs)) = state.registers.get_mut(usize::from(event.vcpu)) {
                apply_event(regs, &event.kind);
            }
            if state.armed.contains(&(event.vcpu, event.kind.intercept())) {
                return Some(RawTrap::from_event(seq, event));
            }
            trace!("Replay skipped unarmed trap #{}: {}", seq, event);
        }
        None
    }
}

impl Driver for ReplayDriver {
    fn backend_id(&self) -> BackendId {
        BackendId::REPLAY
    }

    fn vcpu_count(&self) -> Result<u16, DriverError> {
        Ok(self.recording.vcpu_count)
    }

    fn pause(&self) -> Result<(), DriverError> {
        lock(&self.state).paused = true;
        Ok(())
    }

    fn resume(&self) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        if !state.paused {
            return Err(DriverError::NotPaused);
        }
        state.paused = false;
        self.wake.notify_all();
        Ok(())
    }

    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), DriverError> {
        let frame = PageFrame::containing(paddr);
        if paddr > self.recording.max_physical_address || self.recording.is_hole(frame.number) {
            return Err(DriverError::FrameNotMapped(frame.number));
        }
        match self.recording.page(frame.number) {
            Some(page) => {
                let src = page.get(frame.offset..frame.offset + buf.len()).ok_or_else(|| {
                    DriverError::backend(format!("recorded frame {:#x} is truncated", frame.number))
                })?;
                buf.copy_from_slice(src);
            }
            None => buf.fill(0),
        }
        Ok(())
    }

    fn max_physical_address(&self) -> Result<u64, DriverError> {
        Ok(self.recording.max_physical_address)
    }

    fn read_registers(&self, vcpu: u16) -> Result<Registers, DriverError> {
        let index = self.check_vcpu(vcpu)?;
        Ok(lock(&self.state).registers[index])
    }

    fn toggle_intercept(
        &self,
        vcpu: u16,
        intercept: InterceptType,
        enabled: bool,
    ) -> Result<(), DriverError> {
        self.check_vcpu(vcpu)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::TornDown);
        }
        let mut state = lock(&self.state);
        if enabled {
            state.armed.insert((vcpu, intercept));
        } else {
            state.armed.remove(&(vcpu, intercept));
        }
        Ok(())
    }

    fn listen(&self, timeout: Duration) -> Result<Option<RawTrap>, DriverError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = lock(&self.state);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(DriverError::TornDown);
            }
            if !state.paused {
                if let Some(trap) = self.next_armed(&mut state) {
                    return Ok(Some(trap));
                }
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn shutdown(&self) {
        let _state = lock(&self.state);
        self.closed.store(true, Ordering::Release);
        self.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CrType, Event, EventKind, ReplayInitParams, PAGE_SIZE};
    use crate::dispatch::normalize;
    use std::thread;
    use tempfile::TempDir;

    fn cr3(vcpu: u16, new: u64) -> Event {
        Event {
            vcpu,
            kind: EventKind::Cr {
                cr_type: CrType::Cr3,
                old: 0,
                new,
            },
        }
    }

    fn sample() -> Recording {
        let mut recording = Recording::new("replay-vm", 2, 0x3fff);
        let mut page = vec![0u8; PAGE_SIZE];
        page[..4].copy_from_slice(b"MZ\x90\x00");
        recording.set_page(1, &page);
        recording.holes.insert(3);
        recording.traps = vec![
            cr3(0, 0x1000),
            Event {
                vcpu: 1,
                kind: EventKind::Breakpoint {
                    gpa: 0x2000,
                    insn_len: 1,
                },
            },
            cr3(1, 0x2000),
            cr3(0, 0x3000),
        ];
        recording
    }

    fn arm(driver: &ReplayDriver, vcpu: u16, intercept: InterceptType) {
        driver.toggle_intercept(vcpu, intercept, true).unwrap();
    }

    #[test]
    fn detect_needs_a_recording() {
        assert!(!detect(&InitParams::for_vm("x")));
        assert!(detect(
            &InitParams::for_vm("x").with_extension("replay.recording", "/tmp/r.json", true)
        ));
    }

    #[test]
    fn create_from_saved_recording() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rec.json");
        sample().save(&path).unwrap();

        let params = InitParams {
            replay: Some(ReplayInitParams {
                recording: path.clone(),
            }),
            ..InitParams::for_vm("replay-vm")
        };
        let driver = create(&params).unwrap();
        assert_eq!(driver.backend_id(), BackendId::REPLAY);
        assert_eq!(driver.vcpu_count().unwrap(), 2);

        let wrong_vm = InitParams {
            replay: Some(ReplayInitParams { recording: path }),
            ..InitParams::for_vm("other-vm")
        };
        assert!(matches!(
            create(&wrong_vm),
            Err(InitError::RejectedParameters { .. })
        ));
    }

    #[test]
    fn missing_recording_is_backend_failure() {
        let params = InitParams::default().with_extension(
            "replay.recording",
            "/nonexistent/vmiscope/recording.json",
            true,
        );
        assert!(matches!(
            create(&params),
            Err(InitError::BackendFailure {
                source: DriverError::Io(_),
                ..
            })
        ));
    }

    #[test]
    fn only_armed_traps_replayed_in_order() {
        let driver = ReplayDriver::new(sample());
        arm(&driver, 0, InterceptType::Cr(CrType::Cr3));

        let first = driver.listen(Duration::ZERO).unwrap().unwrap();
        assert_eq!(normalize(&first).unwrap(), cr3(0, 0x1000));
        let second = driver.listen(Duration::ZERO).unwrap().unwrap();
        assert_eq!(second.seq, 3);
        assert_eq!(normalize(&second).unwrap(), cr3(0, 0x3000));
        assert_eq!(driver.listen(Duration::ZERO).unwrap(), None);
        assert_eq!(driver.remaining(), 0);
    }

    #[test]
    fn registers_follow_replayed_traps() {
        let driver = ReplayDriver::new(sample());
        arm(&driver, 0, InterceptType::Cr(CrType::Cr3));
        driver.listen(Duration::ZERO).unwrap();
        driver.listen(Duration::ZERO).unwrap();

        // vCPU 1 traps were skipped but still executed.
        assert_eq!(driver.read_registers(0).unwrap().page_table_root(), 0x3000);
        let vcpu1 = driver.read_registers(1).unwrap();
        assert_eq!(vcpu1.page_table_root(), 0x2000);
        assert_eq!(vcpu1.instruction_pointer(), 0x2000);
    }

    #[test]
    fn paused_replay_holds_traps() {
        let driver = ReplayDriver::new(sample());
        arm(&driver, 0, InterceptType::Cr(CrType::Cr3));
        driver.pause().unwrap();
        assert_eq!(driver.listen(Duration::from_millis(10)).unwrap(), None);
        driver.resume().unwrap();
        assert!(driver.listen(Duration::ZERO).unwrap().is_some());
    }

    #[test]
    fn unbounded_listen_waits_for_resume() {
        let driver = Arc::new(ReplayDriver::new(sample()));
        arm(&driver, 0, InterceptType::Cr(CrType::Cr3));
        driver.pause().unwrap();
        let resumer = {
            let driver = Arc::clone(&driver);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                driver.resume().unwrap();
            })
        };
        assert!(driver.listen(Duration::MAX).unwrap().is_some());
        resumer.join().unwrap();
    }

    #[test]
    fn toggle_refused_after_shutdown() {
        let driver = ReplayDriver::new(sample());
        arm(&driver, 0, InterceptType::Cr(CrType::Cr3));
        driver.shutdown();
        assert!(matches!(
            driver.toggle_intercept(0, InterceptType::Cr(CrType::Cr3), false),
            Err(DriverError::TornDown)
        ));
    }

    #[test]
    fn memory_is_snapshot_and_read_only() {
        let driver = ReplayDriver::new(sample());
        let mut buf = [0xffu8; 4];
        driver.read_physical(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"MZ\x90\x00");
        driver.read_physical(0x2000, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
        assert!(matches!(
            driver.read_physical(0x3000, &mut buf),
            Err(DriverError::FrameNotMapped(3))
        ));
        assert!(matches!(
            driver.read_physical(0x4000, &mut buf),
            Err(DriverError::FrameNotMapped(4))
        ));
        assert!(matches!(
            driver.write_physical(0x1000, &buf),
            Err(DriverError::Unsupported(_))
        ));
    }

    #[test]
    fn shutdown_unblocks_listen() {
        let driver = Arc::new(ReplayDriver::new(sample()));
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
    }
}
