//! Pure decoding and encoding of backend trap records.
//!
//! A trap record carries a class discriminant and three 64-bit arguments:
//!
//! | Class | Name       | `arg0`            | `arg1`     | `arg2` |
//! |-------|------------|-------------------|------------|--------|
//! | 1     | CR         | register number   | old value  | new    |
//! | 2     | MSR        | MSR index         | new value  | -      |
//! | 3     | BREAKPOINT | guest phys addr   | insn len   | -      |
//! | 4     | SINGLESTEP | guest phys addr   | -          | -      |
//! | 5     | INTERRUPT  | vector            | info       | -      |
//! | 6     | PAGEFAULT  | guest phys addr   | guest virt | access |
//!
//! Unused arguments are encoded as zero and ignored on decode.

use std::fmt;

use crate::api::{Access, CrType, EventKind, TrapClass};

/// Why a trap record could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapDecodeError {
    UnknownClass(u32),
    InvalidControlRegister(u64),
    MsrIndexOutOfRange(u64),
    InstructionLengthOutOfRange(u64),
    VectorOutOfRange(u64),
    InvalidAccess(u64),
}

impl fmt::Display for TrapDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapDecodeError::UnknownClass(class) => write!(f, "unknown trap class {}", class),
            TrapDecodeError::InvalidControlRegister(n) => {
                write!(f, "cr{} is not an interceptable control register", n)
            }
            TrapDecodeError::MsrIndexOutOfRange(index) => {
                write!(f, "MSR index {:#x} does not fit in 32 bits", index)
            }
            TrapDecodeError::InstructionLengthOutOfRange(len) => {
                write!(f, "instruction length {} is out of range", len)
            }
            TrapDecodeError::VectorOutOfRange(vector) => {
                write!(f, "interrupt vector {} is out of range", vector)
            }
            TrapDecodeError::InvalidAccess(bits) => {
                write!(f, "access bits {:#x} are not a valid access set", bits)
            }
        }
    }
}

/// Longest x86 instruction, in bytes.
pub const MAX_INSN_LEN: u64 = 15;

// ─── Class discriminants ────────────────────────────────────────────

/// Convert a `u32` discriminant to a [`TrapClass`], if valid.
///
/// Valid discriminants are 1..=6. Returns `None` for 0 or anything larger.
pub fn trap_class_from_u32(v: u32) -> Option<TrapClass> {
    let result = match v {
        1 => Some(TrapClass::Cr),
        2 => Some(TrapClass::Msr),
        3 => Some(TrapClass::Breakpoint),
        4 => Some(TrapClass::Singlestep),
        5 => Some(TrapClass::Interrupt),
        6 => Some(TrapClass::Pagefault),
        _ => None,
    };

    debug_assert!(
        result.map_or(true, |c| c as u32 == v),
        "trap_class_from_u32: round-trip violation for v={v}"
    );

    result
}

/// Control register from its architectural number.
pub fn cr_type_from_number(n: u64) -> Option<CrType> {
    match n {
        0 => Some(CrType::Cr0),
        3 => Some(CrType::Cr3),
        4 => Some(CrType::Cr4),
        _ => None,
    }
}

// ─── Decoding ───────────────────────────────────────────────────────

/// Decode the class and arguments of a trap record into an [`EventKind`].
///
/// Total: every input produces either a kind or a decode error, never a
/// panic. Arguments that are wider than the field they land in are
/// rejected rather than truncated.
pub fn decode_trap(
    class: u32,
    arg0: u64,
    arg1: u64,
    arg2: u64,
) -> Result<EventKind, TrapDecodeError> {
    let class = trap_class_from_u32(class).ok_or(TrapDecodeError::UnknownClass(class))?;
    let kind = match class {
        TrapClass::Cr => EventKind::Cr {
            cr_type: cr_type_from_number(arg0)
                .ok_or(TrapDecodeError::InvalidControlRegister(arg0))?,
            old: arg1,
            new: arg2,
        },
        TrapClass::Msr => EventKind::Msr {
            msr_index: u32::try_from(arg0).map_err(|_| TrapDecodeError::MsrIndexOutOfRange(arg0))?,
            new: arg1,
        },
        TrapClass::Breakpoint => {
            if arg1 == 0 || arg1 > MAX_INSN_LEN {
                return Err(TrapDecodeError::InstructionLengthOutOfRange(arg1));
            }
            EventKind::Breakpoint {
                gpa: arg0,
                insn_len: arg1 as u8,
            }
        }
        TrapClass::Singlestep => EventKind::Singlestep { gpa: arg0 },
        TrapClass::Interrupt => EventKind::Interrupt {
            vector: u8::try_from(arg0).map_err(|_| TrapDecodeError::VectorOutOfRange(arg0))?,
            info: arg1,
        },
        TrapClass::Pagefault => EventKind::Pagefault {
            gpa: arg0,
            gva: arg1,
            access: u32::try_from(arg2)
                .ok()
                .and_then(Access::from_bits)
                .ok_or(TrapDecodeError::InvalidAccess(arg2))?,
        },
    };

    debug_assert_eq!(kind.class(), class, "decode_trap: class mismatch");

    Ok(kind)
}

// ─── Encoding ───────────────────────────────────────────────────────

/// Encode an [`EventKind`] as `(class, arg0, arg1, arg2)`.
///
/// `decode_trap` applied to the result yields `kind` again.
pub fn encode_trap(kind: &EventKind) -> (u32, u64, u64, u64) {
    let class = kind.class() as u32;
    match *kind {
        EventKind::Cr { cr_type, old, new } => (class, u64::from(cr_type.number()), old, new),
        EventKind::Msr { msr_index, new } => (class, u64::from(msr_index), new, 0),
        EventKind::Breakpoint { gpa, insn_len } => (class, gpa, u64::from(insn_len), 0),
        EventKind::Singlestep { gpa } => (class, gpa, 0, 0),
        EventKind::Interrupt { vector, info } => (class, u64::from(vector), info, 0),
        EventKind::Pagefault { gva, gpa, access } => (class, gpa, gva, u64::from(access.bits())),
    }
}
