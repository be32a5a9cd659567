//! Guest physical memory as a byte stream, and whole-memory scans.
//!
//! [`Memory`] and [`PaddedMemory`] turn the page-bounded facade calls into
//! `std::io` streams: every request is split at frame boundaries and
//! issued one frame at a time. The stream ends one byte past the highest
//! guest physical address; seeking saturates at `0` and at that end.
//!
//! [`scan_pages`] walks every frame of the address space exactly once,
//! skipping frames that cannot be read.

use log::{debug, trace};
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::api::{MemoryPage, PageFrame, PAGE_SHIFT, PAGE_SIZE};
use crate::error::DriverError;
use crate::vmi::Vmi;

// ═══════════════════════════════════════════════════════════════════════
//  Stream position
// ═══════════════════════════════════════════════════════════════════════

/// Cursor shared by both stream types. `end` is one past the last valid
/// guest physical address.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    pos: u64,
    end: u64,
}

impl Cursor {
    fn new(vmi: &Vmi) -> Result<Self, DriverError> {
        let max = vmi.max_physical_address()?;
        Ok(Self {
            pos: 0,
            end: max.saturating_add(1),
        })
    }

    fn seek(&mut self, pos: SeekFrom) -> u64 {
        let target = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::End(delta) => offset(self.end, delta),
            SeekFrom::Current(delta) => offset(self.pos, delta),
        };
        self.pos = target.min(self.end);
        self.pos
    }

    /// Length of the next chunk: up to the end of the frame, the request
    /// and the stream.
    fn next_chunk(&self, wanted: usize) -> usize {
        let window = PageFrame::containing(self.pos).window_len() as u64;
        let left = self.end - self.pos;
        window.min(left).min(wanted as u64) as usize
    }
}

fn offset(base: u64, delta: i64) -> u64 {
    if delta >= 0 {
        base.saturating_add(delta.unsigned_abs())
    } else {
        base.saturating_sub(delta.unsigned_abs())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory
// ═══════════════════════════════════════════════════════════════════════

/// `Read + Write + Seek` view of guest physical memory.
///
/// A read that hits an unmapped frame fails with
/// [`io::ErrorKind::NotFound`]; use [`PaddedMemory`] to get zeros instead.
pub struct Memory<'a> {
    vmi: &'a Vmi,
    cursor: Cursor,
}

impl<'a> Memory<'a> {
    pub fn new(vmi: &'a Vmi) -> Result<Self, DriverError> {
        Ok(Self {
            vmi,
            cursor: Cursor::new(vmi)?,
        })
    }

    /// One past the last valid guest physical address.
    pub fn len(&self) -> u64 {
        self.cursor.end
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.end == 0
    }
}

impl Read for Memory<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = self.cursor.next_chunk(buf.len() - done);
            if chunk == 0 {
                break;
            }
            self.vmi
                .read_physical_into(self.cursor.pos, &mut buf[done..done + chunk])?;
            self.cursor.pos += chunk as u64;
            done += chunk;
        }
        Ok(done)
    }
}

impl Write for Memory<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = self.cursor.next_chunk(buf.len() - done);
            if chunk == 0 {
                break;
            }
            self.vmi
                .write_physical(self.cursor.pos, &buf[done..done + chunk])?;
            self.cursor.pos += chunk as u64;
            done += chunk;
        }
        Ok(done)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Memory<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.cursor.seek(pos))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  PaddedMemory
// ═══════════════════════════════════════════════════════════════════════

/// Read-only view that substitutes zeros for unmapped frames, so a dump
/// keeps every byte at its physical offset.
pub struct PaddedMemory<'a> {
    vmi: &'a Vmi,
    cursor: Cursor,
}

impl<'a> PaddedMemory<'a> {
    pub fn new(vmi: &'a Vmi) -> Result<Self, DriverError> {
        Ok(Self {
            vmi,
            cursor: Cursor::new(vmi)?,
        })
    }

    pub fn len(&self) -> u64 {
        self.cursor.end
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.end == 0
    }
}

impl Read for PaddedMemory<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = self.cursor.next_chunk(buf.len() - done);
            if chunk == 0 {
                break;
            }
            let dst = &mut buf[done..done + chunk];
            match self.vmi.read_physical_into(self.cursor.pos, dst) {
                Ok(()) => {}
                Err(DriverError::FrameNotMapped(frame)) => {
                    trace!("Frame {:#x} not mapped, padding", frame);
                    dst.fill(0);
                }
                Err(e) => return Err(e.into()),
            }
            self.cursor.pos += chunk as u64;
            done += chunk;
        }
        Ok(done)
    }
}

impl Seek for PaddedMemory<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.cursor.seek(pos))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Page scans
// ═══════════════════════════════════════════════════════════════════════

/// Outcome of a whole-memory scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub pages_read: u64,
    pub pages_skipped: u64,
}

impl ScanSummary {
    pub fn total(&self) -> u64 {
        self.pages_read + self.pages_skipped
    }
}

/// Number of frames needed to cover `0..=max_physical_address`.
pub fn frame_count(max_physical_address: u64) -> u64 {
    (max_physical_address >> PAGE_SHIFT) + 1
}

/// Read every frame once, handing each outcome to `visit`.
///
/// Only a session that goes away mid-scan stops it early.
pub fn scan_frames<F>(vmi: &Vmi, mut visit: F) -> Result<ScanSummary, DriverError>
where
    F: FnMut(u64, Result<&MemoryPage, &DriverError>),
{
    let frames = frame_count(vmi.max_physical_address()?);
    debug!("Scanning {} frames", frames);

    let mut summary = ScanSummary::default();
    for frame in 0..frames {
        match vmi.read_page(frame) {
            Ok(page) => {
                summary.pages_read += 1;
                visit(frame, Ok(&page));
            }
            Err(e @ (DriverError::InvalidHandle | DriverError::TornDown)) => return Err(e),
            Err(e) => {
                trace!("Skipping frame {:#x}: {}", frame, e);
                summary.pages_skipped += 1;
                visit(frame, Err(&e));
            }
        }
    }
    Ok(summary)
}

/// Read every readable page once, skipping failures.
pub fn scan_pages<F>(vmi: &Vmi, mut visit: F) -> Result<ScanSummary, DriverError>
where
    F: FnMut(&MemoryPage),
{
    scan_frames(vmi, |_, result| {
        if let Ok(page) = result {
            visit(page);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BackendId, InterceptType, Registers};
    use crate::driver::{Driver, RawTrap};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Flat memory backend where every byte reads as its frame number.
    struct Flat {
        max: u64,
        holes: BTreeSet<u64>,
        reads: AtomicU64,
        written: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl Flat {
        fn new(max: u64, holes: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                max,
                holes: holes.iter().copied().collect(),
                reads: AtomicU64::new(0),
                written: Mutex::new(Vec::new()),
            })
        }
    }

    impl Driver for Flat {
        fn backend_id(&self) -> BackendId {
            BackendId(102)
        }
        fn vcpu_count(&self) -> Result<u16, DriverError> {
            Ok(1)
        }
        fn pause(&self) -> Result<(), DriverError> {
            Ok(())
        }
        fn resume(&self) -> Result<(), DriverError> {
            Ok(())
        }
        fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), DriverError> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let frame = paddr >> PAGE_SHIFT;
            if self.holes.contains(&frame) || paddr > self.max {
                return Err(DriverError::FrameNotMapped(frame));
            }
            buf.fill(frame as u8);
            Ok(())
        }
        fn write_physical(&self, paddr: u64, buf: &[u8]) -> Result<(), DriverError> {
            self.written.lock().unwrap().push((paddr, buf.to_vec()));
            Ok(())
        }
        fn max_physical_address(&self) -> Result<u64, DriverError> {
            Ok(self.max)
        }
        fn read_registers(&self, _vcpu: u16) -> Result<Registers, DriverError> {
            Ok(Registers::default())
        }
        fn toggle_intercept(
            &self,
            _vcpu: u16,
            _intercept: InterceptType,
            _enabled: bool,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        fn listen(&self, _timeout: Duration) -> Result<Option<RawTrap>, DriverError> {
            Ok(None)
        }
        fn shutdown(&self) {}
    }

    fn session(flat: &Arc<Flat>) -> Vmi {
        Vmi::with_driver("flat", Arc::clone(flat) as Arc<dyn Driver>)
    }

    #[test]
    fn full_scan_of_256_mib() {
        let flat = Flat::new(0xFFF_FFFF, &[0, 17, 0xFFFF]);
        let vmi = session(&flat);

        let mut visited = 0u64;
        let summary = scan_pages(&vmi, |page| {
            assert_eq!(page.data.len(), PAGE_SIZE);
            visited += 1;
        })
        .unwrap();

        assert_eq!(flat.reads.load(Ordering::Relaxed), 65_536);
        assert_eq!(summary.total(), 65_536);
        assert_eq!(summary.pages_skipped, 3);
        assert_eq!(summary.pages_read, 65_533);
        assert_eq!(visited, summary.pages_read);
    }

    #[test]
    fn frame_count_rounds_up() {
        assert_eq!(frame_count(0xFFF_FFFF), 65_536);
        assert_eq!(frame_count(0xfff), 1);
        assert_eq!(frame_count(0x1000), 2);
        assert_eq!(frame_count(0), 1);
    }

    #[test]
    fn scan_frames_reports_holes() {
        let flat = Flat::new(0x3fff, &[2]);
        let vmi = session(&flat);
        let mut holes = Vec::new();
        scan_frames(&vmi, |frame, result| {
            if result.is_err() {
                holes.push(frame);
            }
        })
        .unwrap();
        assert_eq!(holes, vec![2]);
    }

    #[test]
    fn scan_stops_on_destroyed_session() {
        let flat = Flat::new(0x3fff, &[]);
        let vmi = session(&flat);
        vmi.destroy();
        assert!(matches!(
            scan_pages(&vmi, |_| {}),
            Err(DriverError::InvalidHandle)
        ));
    }

    #[test]
    fn read_splits_at_frame_boundaries() {
        let flat = Flat::new(0x3fff, &[]);
        let vmi = session(&flat);
        let mut mem = Memory::new(&vmi).unwrap();

        mem.seek(SeekFrom::Start(0xff8)).unwrap();
        let mut buf = [0u8; 16];
        mem.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..8], &[0; 8]);
        assert_eq!(&buf[8..], &[1; 8]);
        assert_eq!(flat.reads.load(Ordering::Relaxed), 2);
        assert_eq!(mem.stream_position().unwrap(), 0x1008);
    }

    #[test]
    fn read_stops_at_end_of_memory() {
        let flat = Flat::new(0x1fff, &[]);
        let vmi = session(&flat);
        let mut mem = Memory::new(&vmi).unwrap();
        assert_eq!(mem.len(), 0x2000);

        let mut all = Vec::new();
        mem.read_to_end(&mut all).unwrap();
        assert_eq!(all.len(), 0x2000);
        assert_eq!(mem.read(&mut [0u8; 8]).unwrap(), 0);
    }

    #[test]
    fn seek_saturates() {
        let flat = Flat::new(999, &[]);
        let vmi = session(&flat);
        let mut mem = Memory::new(&vmi).unwrap();
        assert_eq!(mem.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert_eq!(mem.seek(SeekFrom::Start(5_000)).unwrap(), 1000);
        assert_eq!(mem.seek(SeekFrom::End(-10)).unwrap(), 990);
        assert_eq!(mem.seek(SeekFrom::End(10)).unwrap(), 1000);
        assert_eq!(mem.seek(SeekFrom::Current(-2_000)).unwrap(), 0);
        assert_eq!(mem.seek(SeekFrom::Current(i64::MAX)).unwrap(), 1000);
    }

    #[test]
    fn unmapped_frame_is_not_found() {
        let flat = Flat::new(0x2fff, &[1]);
        let vmi = session(&flat);
        let mut mem = Memory::new(&vmi).unwrap();
        mem.seek(SeekFrom::Start(0x1000)).unwrap();
        let err = mem.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn padded_memory_fills_holes() {
        let flat = Flat::new(0x2fff, &[1]);
        let vmi = session(&flat);
        let mut mem = PaddedMemory::new(&vmi).unwrap();
        let mut all = Vec::new();
        mem.read_to_end(&mut all).unwrap();
        assert_eq!(all.len(), 0x3000);
        assert!(all[0x1000..0x2000].iter().all(|b| *b == 0));
        assert!(all[0x2000..].iter().all(|b| *b == 2));
    }

    #[test]
    fn write_splits_at_frame_boundaries() {
        let flat = Flat::new(0x2fff, &[]);
        let vmi = session(&flat);
        let mut mem = Memory::new(&vmi).unwrap();
        mem.seek(SeekFrom::Start(0xffe)).unwrap();
        mem.write_all(&[9, 9, 9, 9]).unwrap();

        let written = flat.written.lock().unwrap();
        assert_eq!(*written, vec![(0xffe, vec![9, 9]), (0x1000, vec![9, 9])]);
    }
}
