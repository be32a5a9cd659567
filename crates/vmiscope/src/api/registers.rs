//! Architecture-tagged register snapshots.
//!
//! A [`Registers`] value is a copy taken at one instant. It goes stale as
//! soon as the vCPU runs again, so pause the VM first if the snapshot has
//! to be consistent with memory.

use serde::{Deserialize, Serialize};

/// An x86 segment register.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentReg {
    pub base: u64,
    pub limit: u32,
    /// RPL (2 bits), table indicator (1 bit), descriptor index (13 bits).
    pub selector: u16,
}

/// x86 system table register (GDTR, IDTR).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemTableReg {
    /// Linear base address.
    pub base: u64,
    pub limit: u16,
}

/// Full register state of one x86 vCPU.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct X86Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cr0: u64,
    /// Page-fault linear address.
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// `IA32_SYSENTER_CS` (0x174).
    pub sysenter_cs: u64,
    /// `IA32_SYSENTER_ESP` (0x175).
    pub sysenter_esp: u64,
    /// `IA32_SYSENTER_EIP` (0x176).
    pub sysenter_eip: u64,
    /// `IA32_EFER` (0xc0000080) as read through the MSR interface.
    pub msr_efer: u64,
    /// `IA32_STAR` (0xc0000081).
    pub msr_star: u64,
    /// `IA32_LSTAR` (0xc0000082), the 64-bit `syscall` entry point.
    pub msr_lstar: u64,
    /// EFER as tracked in the special registers.
    pub efer: u64,
    pub apic_base: u64,
    pub cs: SegmentReg,
    pub ds: SegmentReg,
    pub es: SegmentReg,
    pub fs: SegmentReg,
    pub gs: SegmentReg,
    pub ss: SegmentReg,
    pub tr: SegmentReg,
    pub ldt: SegmentReg,
    pub idt: SystemTableReg,
    pub gdt: SystemTableReg,
}

/// Register snapshot of one vCPU, tagged by architecture.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Registers {
    X86(X86Registers),
}

impl Registers {
    /// Instruction pointer, whatever the architecture.
    pub fn instruction_pointer(&self) -> u64 {
        match self {
            Registers::X86(regs) => regs.rip,
        }
    }

    /// Root of the current address space (CR3 on x86).
    pub fn page_table_root(&self) -> u64 {
        match self {
            Registers::X86(regs) => regs.cr3,
        }
    }
}

impl Default for Registers {
    fn default() -> Self {
        Registers::X86(X86Registers::default())
    }
}
