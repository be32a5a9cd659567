//! Session recordings.
//!
//! A [`Recording`] is a paused snapshot of a guest (registers of every
//! vCPU and every readable page) followed by the stream of events observed
//! after it. Recordings are stored as JSON and served back by the replay
//! backend.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::api::{Event, Registers, PAGE_SHIFT, PAGE_SIZE};
use crate::error::{DriverError, SerializeError};
use crate::memory::scan_frames;
use crate::vmi::Vmi;

/// Current on-disk recording format.
pub const RECORDING_FORMAT_VERSION: u32 = 1;

/// A guest snapshot plus the traps recorded after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    pub format_version: u32,
    pub vm_name: String,
    pub vcpu_count: u16,
    pub max_physical_address: u64,
    /// Register state of each vCPU, indexed by vCPU number.
    pub registers: Vec<Registers>,
    /// Pages with at least one non-zero byte. Absent frames read as zeros.
    pub pages: BTreeMap<u64, Vec<u8>>,
    /// Frames that could not be read when the snapshot was taken.
    #[serde(default)]
    pub holes: BTreeSet<u64>,
    pub traps: Vec<Event>,
}

impl Recording {
    /// An empty recording of a guest with zeroed memory.
    pub fn new(vm_name: impl Into<String>, vcpu_count: u16, max_physical_address: u64) -> Self {
        Self {
            format_version: RECORDING_FORMAT_VERSION,
            vm_name: vm_name.into(),
            vcpu_count,
            max_physical_address,
            registers: vec![Registers::default(); vcpu_count as usize],
            pages: BTreeMap::new(),
            holes: BTreeSet::new(),
            traps: Vec::new(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SerializeError> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SerializeError> {
        let file = File::open(path)?;
        let recording: Recording = serde_json::from_reader(BufReader::new(file))?;
        if recording.format_version != RECORDING_FORMAT_VERSION {
            return Err(SerializeError::Version {
                found: recording.format_version,
                expected: RECORDING_FORMAT_VERSION,
            });
        }
        Ok(recording)
    }

    /// Highest frame number covered by the recording.
    pub fn last_frame(&self) -> u64 {
        self.max_physical_address >> PAGE_SHIFT
    }

    pub fn is_hole(&self, frame: u64) -> bool {
        self.holes.contains(&frame)
    }

    /// Recorded contents of `frame`, `None` for an all-zero page.
    pub fn page(&self, frame: u64) -> Option<&[u8]> {
        self.pages.get(&frame).map(Vec::as_slice)
    }

    /// Store a page, dropping it if it is all zeros.
    pub fn set_page(&mut self, frame: u64, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        if data.iter().all(|b| *b == 0) {
            self.pages.remove(&frame);
        } else {
            self.pages.insert(frame, data.to_vec());
        }
    }
}

/// Builds a [`Recording`] from a live session.
pub struct Recorder {
    recording: Recording,
}

impl Recorder {
    /// Snapshot the guest behind `vmi`.
    ///
    /// The VM is paused for the duration of the snapshot and resumed
    /// afterwards unless it was already paused.
    pub fn capture(vmi: &Vmi, vm_name: &str) -> Result<Self, DriverError> {
        let was_paused = vmi.is_paused();
        if !was_paused {
            vmi.pause()?;
        }

        let snapshot = Self::snapshot(vmi, vm_name);
        let resumed = if was_paused { Ok(()) } else { vmi.resume() };

        let recording = snapshot?;
        if let Err(e) = resumed {
            warn!("Failed to resume {:?} after snapshot: {}", vm_name, e);
            return Err(e);
        }
        info!(
            "Captured {:?}: {} vCPUs, {} non-zero pages, {} holes",
            vm_name,
            recording.vcpu_count,
            recording.pages.len(),
            recording.holes.len()
        );
        Ok(Self { recording })
    }

    fn snapshot(vmi: &Vmi, vm_name: &str) -> Result<Recording, DriverError> {
        let vcpu_count = vmi.vcpu_count()?;
        let max = vmi.max_physical_address()?;
        let mut recording = Recording::new(vm_name, vcpu_count, max);

        for vcpu in 0..vcpu_count {
            recording.registers[vcpu as usize] = vmi.read_registers(vcpu)?;
        }

        let mut holes = BTreeSet::new();
        let mut pages = BTreeMap::new();
        let summary = scan_frames(vmi, |frame, result| match result {
            Ok(page) => {
                if page.data.iter().any(|b| *b != 0) {
                    pages.insert(frame, page.data.to_vec());
                }
            }
            Err(_) => {
                holes.insert(frame);
            }
        })?;
        debug!(
            "Snapshot scan: {} pages read, {} skipped",
            summary.pages_read, summary.pages_skipped
        );

        recording.pages = pages;
        recording.holes = holes;
        Ok(recording)
    }

    /// Append an observed event.
    pub fn record(&mut self, event: &Event) {
        self.recording.traps.push(*event);
    }

    pub fn trap_count(&self) -> usize {
        self.recording.traps.len()
    }

    pub fn finish(self) -> Recording {
        self.recording
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BackendId, CrType, DummyInitParams, EventKind, InitParams};
    use crate::driver::dummy::{GuestController, BOOT_CR3};
    use crate::driver::BackendSelector;
    use tempfile::TempDir;

    fn launch(name: &str) -> (GuestController, Vmi) {
        let guest = GuestController::launch(
            name,
            DummyInitParams {
                memory_size: 1 << 16,
                vcpu_count: 2,
            },
        )
        .unwrap();
        let vmi = Vmi::init(
            BackendSelector::Explicit(BackendId::DUMMY),
            &InitParams::for_vm(name),
        )
        .unwrap();
        (guest, vmi)
    }

    #[test]
    fn capture_snapshots_registers_and_pages() {
        let (guest, vmi) = launch("recording-capture");
        guest.write_memory(0x2010, b"hello").unwrap();
        guest.set_frame_readable(5, false);

        let recording = Recorder::capture(&vmi, "recording-capture")
            .unwrap()
            .finish();

        assert_eq!(recording.vcpu_count, 2);
        assert_eq!(recording.max_physical_address, 0xffff);
        assert_eq!(recording.registers.len(), 2);
        assert_eq!(recording.registers[1].page_table_root(), BOOT_CR3);
        assert_eq!(&recording.page(2).unwrap()[0x10..0x15], b"hello");
        assert!(recording.page(3).is_none());
        assert!(recording.is_hole(5));
        assert!(!vmi.is_paused());
        assert!(!guest.is_paused());
    }

    #[test]
    fn capture_keeps_paused_vm_paused() {
        let (guest, vmi) = launch("recording-paused");
        vmi.pause().unwrap();
        Recorder::capture(&vmi, "recording-paused").unwrap();
        assert!(vmi.is_paused());
        assert!(guest.is_paused());
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");

        let mut recording = Recording::new("vm", 1, 0x1fff);
        let mut page = vec![0u8; PAGE_SIZE];
        page[7] = 0xaa;
        recording.set_page(1, &page);
        recording.holes.insert(0);
        recording.traps.push(Event {
            vcpu: 0,
            kind: EventKind::Cr {
                cr_type: CrType::Cr3,
                old: 1,
                new: 2,
            },
        });
        recording.save(&path).unwrap();

        assert_eq!(Recording::load(&path).unwrap(), recording);
    }

    #[test]
    fn zero_pages_are_not_stored() {
        let mut recording = Recording::new("vm", 1, 0xfff);
        recording.set_page(0, &[0u8; PAGE_SIZE]);
        assert!(recording.pages.is_empty());
    }

    #[test]
    fn load_rejects_other_format_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("future.json");
        let mut recording = Recording::new("vm", 1, 0xfff);
        recording.format_version = RECORDING_FORMAT_VERSION + 1;
        recording.save(&path).unwrap();

        assert!(matches!(
            Recording::load(&path),
            Err(SerializeError::Version { found: 2, expected: 1 })
        ));
    }
}
