//! Value types shared by the facade, the drivers and the C boundary.
//!
//! Everything here is passed by value: a call produces a fresh copy owned
//! by the caller and nothing holds a reference into backend state.

pub mod events;
pub mod params;
pub mod registers;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use events::{CrType, Event, EventKind, EventReply, InterceptType, TrapClass};
pub use params::{
    CommonInitParams, DummyInitParams, Extension, InitParams, ReplayInitParams,
    INIT_PARAMS_VERSION,
};
pub use registers::{Registers, SegmentReg, SystemTableReg, X86Registers};

/// log2 of the guest page size.
pub const PAGE_SHIFT: u32 = 12;

/// Guest page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// ═══════════════════════════════════════════════════════════════════════
//  Backend identifiers
// ═══════════════════════════════════════════════════════════════════════

/// Stable numeric backend identifier.
///
/// Numbers are never reused, so an id stored by a client keeps naming the
/// same hypervisor technology across releases.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(pub u32);

impl BackendId {
    /// In-process simulated guest.
    pub const DUMMY: BackendId = BackendId(0);
    /// Playback of a saved recording.
    pub const REPLAY: BackendId = BackendId(1);
    pub const KVM: BackendId = BackendId(2);
    pub const XEN: BackendId = BackendId(3);
    pub const VIRTUALBOX: BackendId = BackendId(4);
    pub const HYPERV: BackendId = BackendId(5);
    pub const MEMFLOW: BackendId = BackendId(6);

    /// Well-known name for the reserved ids, if any.
    pub fn well_known_name(&self) -> Option<&'static str> {
        match self.0 {
            0 => Some("dummy"),
            1 => Some("replay"),
            2 => Some("kvm"),
            3 => Some("xen"),
            4 => Some("virtualbox"),
            5 => Some("hyperv"),
            6 => Some("memflow"),
            _ => None,
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.well_known_name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Page access
// ═══════════════════════════════════════════════════════════════════════

bitflags! {
    /// Access rights on one guest physical page.
    #[repr(transparent)]
    #[derive(Default, Serialize, Deserialize)]
    pub struct Access: u32 {
        const NIL = 0;
        const R = 0b001;
        const W = 0b010;
        const X = 0b100;
        const RW = Self::R.bits | Self::W.bits;
        const RX = Self::R.bits | Self::X.bits;
        const WX = Self::W.bits | Self::X.bits;
        const RWX = Self::R.bits | Self::W.bits | Self::X.bits;
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Access, c: char| if self.contains(bit) { c } else { '-' };
        write!(f, "{}{}{}", flag(Access::R, 'r'), flag(Access::W, 'w'), flag(Access::X, 'x'))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Pages
// ═══════════════════════════════════════════════════════════════════════

/// A guest physical address split into frame number and in-frame offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageFrame {
    pub number: u64,
    pub offset: usize,
}

impl PageFrame {
    pub fn containing(paddr: u64) -> Self {
        Self {
            number: paddr >> PAGE_SHIFT,
            offset: (paddr & (PAGE_SIZE as u64 - 1)) as usize,
        }
    }

    /// Bytes from `offset` to the end of the frame.
    pub fn window_len(&self) -> usize {
        PAGE_SIZE - self.offset
    }

    /// Guest physical address of the first byte of the frame.
    pub fn base(&self) -> u64 {
        self.number << PAGE_SHIFT
    }
}

/// One full guest page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPage {
    /// Frame number (guest physical address >> [`PAGE_SHIFT`]).
    pub frame: u64,
    pub data: Box<[u8]>,
}

impl MemoryPage {
    pub fn zeroed(frame: u64) -> Self {
        Self {
            frame,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        }
    }

    pub fn address(&self) -> u64 {
        self.frame << PAGE_SHIFT
    }
}
