//! Pure functions at the heart of trap and register normalization.
//!
//! Every backend speaks its own format. The conversions between those
//! formats and the public data model live here, away from any lock,
//! thread or hypervisor handle:
//!
//! - [`traps`]: fixed-layout trap records to [`EventKind`](crate::api::EventKind)
//!   and back.
//! - [`registers`]: KVM's native `kvm_regs`/`kvm_sregs` layout to
//!   [`X86Registers`](crate::api::X86Registers) and back.
//!
//! No function in this module performs I/O or touches shared state, so all
//! of them are tested with plain `#[test]` functions over values.

pub mod registers;
pub mod traps;
