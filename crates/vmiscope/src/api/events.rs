//! Intercept descriptors and the normalized event shape.
//!
//! Every backend reports traps in its own native format. The dispatch loop
//! turns those into an [`Event`] whose [`EventKind`] mirrors the
//! [`InterceptType`] that was armed to produce it, so a client never has to
//! know which hypervisor it is talking to.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

use super::Access;
use crate::error::DriverError;

// ═══════════════════════════════════════════════════════════════════════
//  Control registers
// ═══════════════════════════════════════════════════════════════════════

/// x86 control registers that can be intercepted.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CrType {
    /// Basic operating-mode flags (PE, PG, WP, ...).
    Cr0,
    /// Page directory base. Written on every address-space switch.
    Cr3,
    /// Architectural extensions (PAE, SMEP, SMAP, ...).
    Cr4,
}

impl CrType {
    /// Architectural register number (`0`, `3` or `4`).
    pub fn number(&self) -> u32 {
        match self {
            CrType::Cr0 => 0,
            CrType::Cr3 => 3,
            CrType::Cr4 => 4,
        }
    }
}

impl TryFrom<u32> for CrType {
    type Error = DriverError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CrType::Cr0),
            3 => Ok(CrType::Cr3),
            4 => Ok(CrType::Cr4),
            n => Err(DriverError::InvalidArgument(format!(
                "cr{} is not an interceptable control register",
                n
            ))),
        }
    }
}

impl fmt::Display for CrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CR{}", self.number())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Intercepts
// ═══════════════════════════════════════════════════════════════════════

/// Trap classes, without their parameters.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrapClass {
    Cr = 1,
    Msr = 2,
    Breakpoint = 3,
    Singlestep = 4,
    Interrupt = 5,
    Pagefault = 6,
}

impl fmt::Display for TrapClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrapClass::Cr => "cr",
            TrapClass::Msr => "msr",
            TrapClass::Breakpoint => "breakpoint",
            TrapClass::Singlestep => "singlestep",
            TrapClass::Interrupt => "interrupt",
            TrapClass::Pagefault => "pagefault",
        };
        f.write_str(name)
    }
}

/// Which trap to arm on a vCPU, with its parameters.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InterceptType {
    /// Guest write to a control register.
    Cr(CrType),
    /// Guest write to the model-specific register with this index.
    Msr(u32),
    /// Software breakpoint (`int3`).
    Breakpoint,
    /// Single-step trap after every guest instruction.
    Singlestep,
    /// Interrupt or exception delivery.
    Interrupt,
    /// Guest access to a page that denies it (see
    /// [`Vmi::set_page_access`](crate::Vmi::set_page_access)).
    Pagefault,
}

impl InterceptType {
    pub fn class(&self) -> TrapClass {
        match self {
            InterceptType::Cr(_) => TrapClass::Cr,
            InterceptType::Msr(_) => TrapClass::Msr,
            InterceptType::Breakpoint => TrapClass::Breakpoint,
            InterceptType::Singlestep => TrapClass::Singlestep,
            InterceptType::Interrupt => TrapClass::Interrupt,
            InterceptType::Pagefault => TrapClass::Pagefault,
        }
    }
}

impl fmt::Display for InterceptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptType::Cr(cr) => write!(f, "{}", cr),
            InterceptType::Msr(index) => write!(f, "MSR {:#x}", index),
            other => write!(f, "{}", other.class()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Events
// ═══════════════════════════════════════════════════════════════════════

/// Event payload, one variant per trap class.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Cr {
        cr_type: CrType,
        /// Value before the guest write.
        old: u64,
        /// Value the guest wrote.
        new: u64,
    },
    Msr {
        msr_index: u32,
        new: u64,
    },
    Breakpoint {
        /// Guest physical address of the `int3`.
        gpa: u64,
        /// Anything other than 1 means the guest used a prefixed encoding.
        insn_len: u8,
    },
    Singlestep {
        gpa: u64,
    },
    Interrupt {
        vector: u8,
        /// Backend-defined metadata (error code, injection flags, ...).
        info: u64,
    },
    Pagefault {
        gva: u64,
        gpa: u64,
        /// Requested rights the page did not grant.
        access: Access,
    },
}

impl EventKind {
    /// The intercept that has to be armed for this event to be delivered.
    pub fn intercept(&self) -> InterceptType {
        match self {
            EventKind::Cr { cr_type, .. } => InterceptType::Cr(*cr_type),
            EventKind::Msr { msr_index, .. } => InterceptType::Msr(*msr_index),
            EventKind::Breakpoint { .. } => InterceptType::Breakpoint,
            EventKind::Singlestep { .. } => InterceptType::Singlestep,
            EventKind::Interrupt { .. } => InterceptType::Interrupt,
            EventKind::Pagefault { .. } => InterceptType::Pagefault,
        }
    }

    pub fn class(&self) -> TrapClass {
        self.intercept().class()
    }
}

/// A trap observed on one vCPU.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// vCPU the trap fired on.
    pub vcpu: u16,
    pub kind: EventKind,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VCPU {} ", self.vcpu)?;
        match &self.kind {
            EventKind::Cr { cr_type, old, new } => {
                write!(f, "{:<10} old={:#x} new={:#x}", cr_type.to_string(), old, new)
            }
            EventKind::Msr { msr_index, new } => {
                write!(f, "MSR {:#x} new={:#x}", msr_index, new)
            }
            EventKind::Breakpoint { gpa, insn_len } => {
                write!(f, "BREAKPOINT gpa={:#x} len={}", gpa, insn_len)
            }
            EventKind::Singlestep { gpa } => write!(f, "SINGLESTEP gpa={:#x}", gpa),
            EventKind::Interrupt { vector, info } => {
                write!(f, "INTERRUPT vector={} info={:#x}", vector, info)
            }
            EventKind::Pagefault { gva, gpa, access } => {
                write!(f, "PAGEFAULT gva={:#x} gpa={:#x} access={}", gva, gpa, access)
            }
        }
    }
}

/// Reply sent back to the backend once an event has been handled.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReply {
    /// Let the vCPU continue.
    Continue,
}
