//! Pure mapping between KVM's native vCPU layout and [`X86Registers`].
//!
//! Backends that keep state in `kvm_regs`/`kvm_sregs` plus an MSR table
//! use these functions to produce the normalized snapshot and to apply a
//! caller-supplied snapshot back.

use kvm_bindings::{kvm_dtable, kvm_regs, kvm_segment, kvm_sregs};
use std::collections::BTreeMap;

use crate::api::{CrType, EventKind, SegmentReg, SystemTableReg, X86Registers};

// ═══════════════════════════════════════════════════════════════════════
//  Model-specific registers
// ═══════════════════════════════════════════════════════════════════════

pub const MSR_IA32_SYSENTER_CS: u32 = 0x174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
pub const MSR_IA32_EFER: u32 = 0xc000_0080;
pub const MSR_IA32_STAR: u32 = 0xc000_0081;
pub const MSR_IA32_LSTAR: u32 = 0xc000_0082;
pub const MSR_IA32_APICBASE: u32 = 0x1b;

/// MSRs that appear in [`X86Registers`].
pub const SNAPSHOT_MSRS: [u32; 6] = [
    MSR_IA32_SYSENTER_CS,
    MSR_IA32_SYSENTER_ESP,
    MSR_IA32_SYSENTER_EIP,
    MSR_IA32_EFER,
    MSR_IA32_STAR,
    MSR_IA32_LSTAR,
];

/// MSR table of one vCPU, index to value. Missing entries read as zero.
pub type MsrTable = BTreeMap<u32, u64>;

fn msr(table: &MsrTable, index: u32) -> u64 {
    table.get(&index).copied().unwrap_or(0)
}

// ─── Segments ───────────────────────────────────────────────────────

pub fn segment_from_kvm(seg: &kvm_segment) -> SegmentReg {
    SegmentReg {
        base: seg.base,
        limit: seg.limit,
        selector: seg.selector,
    }
}

/// Write base, limit and selector into `seg`, leaving the cached
/// attribute bits untouched.
pub fn apply_segment(seg: &mut kvm_segment, value: &SegmentReg) {
    seg.base = value.base;
    seg.limit = value.limit;
    seg.selector = value.selector;
}

pub fn table_from_kvm(table: &kvm_dtable) -> SystemTableReg {
    SystemTableReg {
        base: table.base,
        limit: table.limit,
    }
}

pub fn apply_table(table: &mut kvm_dtable, value: &SystemTableReg) {
    table.base = value.base;
    table.limit = value.limit;
}

// ─── Full snapshot ──────────────────────────────────────────────────

/// Build the normalized snapshot of one vCPU.
pub fn x86_from_kvm(regs: &kvm_regs, sregs: &kvm_sregs, msrs: &MsrTable) -> X86Registers {
    X86Registers {
        rax: regs.rax,
        rbx: regs.rbx,
        rcx: regs.rcx,
        rdx: regs.rdx,
        rsi: regs.rsi,
        rdi: regs.rdi,
        rsp: regs.rsp,
        rbp: regs.rbp,
        r8: regs.r8,
        r9: regs.r9,
        r10: regs.r10,
        r11: regs.r11,
        r12: regs.r12,
        r13: regs.r13,
        r14: regs.r14,
        r15: regs.r15,
        rip: regs.rip,
        rflags: regs.rflags,
        cr0: sregs.cr0,
        cr2: sregs.cr2,
        cr3: sregs.cr3,
        cr4: sregs.cr4,
        sysenter_cs: msr(msrs, MSR_IA32_SYSENTER_CS),
        sysenter_esp: msr(msrs, MSR_IA32_SYSENTER_ESP),
        sysenter_eip: msr(msrs, MSR_IA32_SYSENTER_EIP),
        msr_efer: msr(msrs, MSR_IA32_EFER),
        msr_star: msr(msrs, MSR_IA32_STAR),
        msr_lstar: msr(msrs, MSR_IA32_LSTAR),
        efer: sregs.efer,
        apic_base: sregs.apic_base,
        cs: segment_from_kvm(&sregs.cs),
        ds: segment_from_kvm(&sregs.ds),
        es: segment_from_kvm(&sregs.es),
        fs: segment_from_kvm(&sregs.fs),
        gs: segment_from_kvm(&sregs.gs),
        ss: segment_from_kvm(&sregs.ss),
        tr: segment_from_kvm(&sregs.tr),
        ldt: segment_from_kvm(&sregs.ldt),
        idt: table_from_kvm(&sregs.idt),
        gdt: table_from_kvm(&sregs.gdt),
    }
}

/// Apply a normalized snapshot to KVM's native layout.
///
/// `efer` in the special registers and `IA32_EFER` in the MSR table are
/// the same register; `value.efer` wins when the two disagree.
pub fn apply_x86(
    value: &X86Registers,
    regs: &mut kvm_regs,
    sregs: &mut kvm_sregs,
    msrs: &mut MsrTable,
) {
    regs.rax = value.rax;
    regs.rbx = value.rbx;
    regs.rcx = value.rcx;
    regs.rdx = value.rdx;
    regs.rsi = value.rsi;
    regs.rdi = value.rdi;
    regs.rsp = value.rsp;
    regs.rbp = value.rbp;
    regs.r8 = value.r8;
    regs.r9 = value.r9;
    regs.r10 = value.r10;
    regs.r11 = value.r11;
    regs.r12 = value.r12;
    regs.r13 = value.r13;
    regs.r14 = value.r14;
    regs.r15 = value.r15;
    regs.rip = value.rip;
    regs.rflags = value.rflags;

    sregs.cr0 = value.cr0;
    sregs.cr2 = value.cr2;
    sregs.cr3 = value.cr3;
    sregs.cr4 = value.cr4;
    sregs.efer = value.efer;
    sregs.apic_base = value.apic_base;
    apply_segment(&mut sregs.cs, &value.cs);
    apply_segment(&mut sregs.ds, &value.ds);
    apply_segment(&mut sregs.es, &value.es);
    apply_segment(&mut sregs.fs, &value.fs);
    apply_segment(&mut sregs.gs, &value.gs);
    apply_segment(&mut sregs.ss, &value.ss);
    apply_segment(&mut sregs.tr, &value.tr);
    apply_segment(&mut sregs.ldt, &value.ldt);
    apply_table(&mut sregs.idt, &value.idt);
    apply_table(&mut sregs.gdt, &value.gdt);

    msrs.insert(MSR_IA32_SYSENTER_CS, value.sysenter_cs);
    msrs.insert(MSR_IA32_SYSENTER_ESP, value.sysenter_esp);
    msrs.insert(MSR_IA32_SYSENTER_EIP, value.sysenter_eip);
    msrs.insert(MSR_IA32_STAR, value.msr_star);
    msrs.insert(MSR_IA32_LSTAR, value.msr_lstar);
    msrs.insert(MSR_IA32_EFER, value.efer);
}

// ─── Single-register writes ─────────────────────────────────────────

/// Current value of a control register.
pub fn control_register(sregs: &kvm_sregs, cr: CrType) -> u64 {
    match cr {
        CrType::Cr0 => sregs.cr0,
        CrType::Cr3 => sregs.cr3,
        CrType::Cr4 => sregs.cr4,
    }
}

/// Store `value` into a control register and return the previous value.
pub fn write_control_register(sregs: &mut kvm_sregs, cr: CrType, value: u64) -> u64 {
    let slot = match cr {
        CrType::Cr0 => &mut sregs.cr0,
        CrType::Cr3 => &mut sregs.cr3,
        CrType::Cr4 => &mut sregs.cr4,
    };
    std::mem::replace(slot, value)
}

/// Store `value` into an MSR, keeping the mirrored special registers
/// (`efer`, `apic_base`) in sync.
pub fn write_msr(sregs: &mut kvm_sregs, msrs: &mut MsrTable, index: u32, value: u64) {
    match index {
        MSR_IA32_EFER => sregs.efer = value,
        MSR_IA32_APICBASE => sregs.apic_base = value,
        _ => {}
    }
    msrs.insert(index, value);
}

/// Register side effect of a trap the guest has already executed.
///
/// CR and MSR writes land in the written register, breakpoints and single
/// steps move the instruction pointer. Interrupts leave no trace here.
pub fn apply_event(regs: &mut X86Registers, kind: &EventKind) {
    match *kind {
        EventKind::Cr { cr_type, new, .. } => match cr_type {
            CrType::Cr0 => regs.cr0 = new,
            CrType::Cr3 => regs.cr3 = new,
            CrType::Cr4 => regs.cr4 = new,
        },
        EventKind::Msr { msr_index, new } => match msr_index {
            MSR_IA32_SYSENTER_CS => regs.sysenter_cs = new,
            MSR_IA32_SYSENTER_ESP => regs.sysenter_esp = new,
            MSR_IA32_SYSENTER_EIP => regs.sysenter_eip = new,
            MSR_IA32_EFER => {
                regs.msr_efer = new;
                regs.efer = new;
            }
            MSR_IA32_STAR => regs.msr_star = new,
            MSR_IA32_LSTAR => regs.msr_lstar = new,
            MSR_IA32_APICBASE => regs.apic_base = new,
            _ => {}
        },
        EventKind::Breakpoint { gpa, .. } | EventKind::Singlestep { gpa } => regs.rip = gpa,
        EventKind::Interrupt { .. } | EventKind::Pagefault { .. } => {}
    }
}
