//! In-process simulated guest.
//!
//! A [`GuestController`] owns a small virtual machine: mmap-backed guest
//! physical memory and per-vCPU register files in KVM's native layout.
//! It stands in for the guest's own activity: CR and MSR writes,
//! breakpoints, single steps, interrupts, memory stores and memory
//! accesses checked against per-page access rights. Each activity
//! updates the vCPU state and, when the matching intercept is armed by the
//! attached introspection session, queues a trap for it.
//!
//! While the VM is paused, guest activity is held back and replayed in
//! order on resume, so an introspector always sees a frozen snapshot.
//!
//! Guests register themselves by name; the `dummy` backend attaches to a
//! running guest with the requested `vm_name` or launches a fresh one.

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::api::{
    Access, CrType, DummyInitParams, Event, EventKind, InterceptType, Registers, PAGE_SHIFT,
    PAGE_SIZE,
};
use crate::driver::RawTrap;
use crate::lock;
use crate::verified::registers::{
    control_register, write_control_register, write_msr, x86_from_kvm, MsrTable, MSR_IA32_EFER,
};
use crate::verified::traps::MAX_INSN_LEN;

// ═══════════════════════════════════════════════════════════════════════
//  Boot state
// ═══════════════════════════════════════════════════════════════════════

/// Entry point every vCPU starts at (1 MiB).
pub const BOOT_RIP: u64 = 0x0010_0000;
pub const BOOT_STACK_POINTER: u64 = 0x8ff0;
/// Initial page-table root.
pub const BOOT_CR3: u64 = 0x9000;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_ET: u64 = 0x10;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors raised by the simulated guest.
#[derive(Error, Debug)]
pub enum GuestError {
    #[error("Failed to create guest memory region of {size} bytes")]
    Create { size: u64 },

    #[error("Guest memory size {size:#x} is not a non-zero multiple of the page size")]
    InvalidSize { size: u64 },

    #[error("Guest must have at least one VCPU")]
    NoVcpus,

    #[error("Failed to write to guest memory at {address:#x}")]
    Write { address: u64 },

    #[error("Failed to read from guest memory at {address:#x}")]
    Read { address: u64 },

    #[error("VCPU {vcpu} does not exist (guest has {count})")]
    InvalidVcpu { vcpu: u16, count: u16 },

    #[error("A guest named {0:?} is already running")]
    NameInUse(String),

    #[error("Instruction length {0} is not between 1 and 15")]
    InvalidInstructionLength(u8),
}

// ═══════════════════════════════════════════════════════════════════════
//  Guest memory
// ═══════════════════════════════════════════════════════════════════════

/// Guest physical memory: one contiguous mmap region starting at 0.
pub(crate) struct GuestMemory {
    memory: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    fn new(size: u64) -> Result<Self, GuestError> {
        if size == 0 || size % PAGE_SIZE as u64 != 0 {
            return Err(GuestError::InvalidSize { size });
        }
        let len = usize::try_from(size).map_err(|_| GuestError::Create { size })?;
        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), len)])
            .map_err(|_| GuestError::Create { size })?;
        Ok(Self { memory, size })
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn read(&self, paddr: u64, buf: &mut [u8]) -> Result<(), GuestError> {
        self.memory
            .read_slice(buf, GuestAddress(paddr))
            .map_err(|_| GuestError::Read { address: paddr })
    }

    pub(crate) fn write(&self, paddr: u64, buf: &[u8]) -> Result<(), GuestError> {
        self.memory
            .write_slice(buf, GuestAddress(paddr))
            .map_err(|_| GuestError::Write { address: paddr })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  VCPU and session state
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub(crate) struct VcpuState {
    pub(crate) regs: kvm_regs,
    pub(crate) sregs: kvm_sregs,
    pub(crate) msrs: MsrTable,
}

impl VcpuState {
    /// 64-bit long mode with identity-mapped paging, as a freshly booted
    /// kernel would leave it.
    fn boot() -> Self {
        let code = kvm_segment {
            base: 0,
            limit: 0xfffff,
            selector: 0x08,
            type_: 0xb,
            present: 1,
            s: 1,
            l: 1,
            g: 1,
            ..Default::default()
        };
        let data = kvm_segment {
            base: 0,
            limit: 0xfffff,
            selector: 0x10,
            type_: 0x3,
            present: 1,
            s: 1,
            db: 1,
            g: 1,
            ..Default::default()
        };

        let mut sregs = kvm_sregs {
            cs: code,
            ds: data,
            es: data,
            fs: data,
            gs: data,
            ss: data,
            cr0: X86_CR0_PE | X86_CR0_ET | X86_CR0_PG,
            cr3: BOOT_CR3,
            cr4: X86_CR4_PAE,
            efer: EFER_LME | EFER_LMA,
            ..Default::default()
        };
        sregs.gdt.base = 0x500;
        sregs.gdt.limit = 4 * 8 - 1;
        sregs.idt.base = 0x520;
        sregs.idt.limit = 8 - 1;

        let regs = kvm_regs {
            rip: BOOT_RIP,
            rsp: BOOT_STACK_POINTER,
            rbp: BOOT_STACK_POINTER,
            rflags: 0x2,
            ..Default::default()
        };

        let mut msrs = MsrTable::new();
        msrs.insert(MSR_IA32_EFER, sregs.efer);

        Self { regs, sregs, msrs }
    }
}

/// Guest activity, applied immediately or deferred while paused.
#[derive(Debug, Clone)]
enum GuestOp {
    WriteCr { vcpu: u16, cr: CrType, value: u64 },
    WriteMsr { vcpu: u16, index: u32, value: u64 },
    Breakpoint { vcpu: u16, gpa: u64, insn_len: u8 },
    Singlestep { vcpu: u16, gpa: u64 },
    Interrupt { vcpu: u16, vector: u8, info: u64 },
    Access { vcpu: u16, gva: u64, gpa: u64, access: Access },
    WriteMemory { gpa: u64, data: Vec<u8> },
    RawTrap { vcpu: u16, class: u32, args: [u64; 3] },
}

pub(crate) struct GuestState {
    pub(crate) vcpus: Vec<VcpuState>,
    pub(crate) paused: bool,
    /// An introspection session is attached.
    pub(crate) attached: bool,
    /// Bumped on every attach, so a stale driver cannot touch a newer
    /// session.
    pub(crate) session: u64,
    pub(crate) armed: BTreeSet<(u16, InterceptType)>,
    pub(crate) pending: VecDeque<RawTrap>,
    deferred: VecDeque<GuestOp>,
    pub(crate) unreadable: BTreeSet<u64>,
    /// Restricted frames. Frames not listed grant [`Access::RWX`].
    pub(crate) page_access: BTreeMap<u64, Access>,
    next_seq: u64,
}

impl GuestState {
    pub(crate) fn access_of(&self, frame: u64) -> Access {
        self.page_access.get(&frame).copied().unwrap_or(Access::RWX)
    }

    pub(crate) fn restrict(&mut self, frame: u64, access: Access) {
        if access == Access::RWX {
            self.page_access.remove(&frame);
        } else {
            self.page_access.insert(frame, access);
        }
    }

    fn raise(&mut self, vcpu: u16, kind: EventKind) {
        if !self.attached || !self.armed.contains(&(vcpu, kind.intercept())) {
            return;
        }
        let trap = RawTrap::from_event(self.next_seq, &Event { vcpu, kind });
        self.next_seq += 1;
        self.pending.push_back(trap);
    }

    fn apply(&mut self, memory: &GuestMemory, op: GuestOp) -> Result<(), GuestError> {
        match op {
            GuestOp::WriteCr { vcpu, cr, value } => {
                let state = &mut self.vcpus[usize::from(vcpu)];
                let old = write_control_register(&mut state.sregs, cr, value);
                self.raise(
                    vcpu,
                    EventKind::Cr {
                        cr_type: cr,
                        old,
                        new: value,
                    },
                );
            }
            GuestOp::WriteMsr { vcpu, index, value } => {
                let state = &mut self.vcpus[usize::from(vcpu)];
                write_msr(&mut state.sregs, &mut state.msrs, index, value);
                self.raise(
                    vcpu,
                    EventKind::Msr {
                        msr_index: index,
                        new: value,
                    },
                );
            }
            GuestOp::Breakpoint { vcpu, gpa, insn_len } => {
                self.vcpus[usize::from(vcpu)].regs.rip = gpa;
                self.raise(vcpu, EventKind::Breakpoint { gpa, insn_len });
            }
            GuestOp::Singlestep { vcpu, gpa } => {
                self.vcpus[usize::from(vcpu)].regs.rip = gpa;
                self.raise(vcpu, EventKind::Singlestep { gpa });
            }
            GuestOp::Interrupt { vcpu, vector, info } => {
                self.raise(vcpu, EventKind::Interrupt { vector, info });
            }
            GuestOp::Access {
                vcpu,
                gva,
                gpa,
                access,
            } => {
                let denied = access & !self.access_of(gpa >> PAGE_SHIFT);
                if !denied.is_empty() {
                    self.raise(
                        vcpu,
                        EventKind::Pagefault {
                            gva,
                            gpa,
                            access: denied,
                        },
                    );
                }
            }
            GuestOp::WriteMemory { gpa, data } => memory.write(gpa, &data)?,
            GuestOp::RawTrap { vcpu, class, args } => {
                if self.attached {
                    self.pending.push_back(RawTrap {
                        seq: self.next_seq,
                        vcpu,
                        class,
                        arg0: args[0],
                        arg1: args[1],
                        arg2: args[2],
                    });
                    self.next_seq += 1;
                }
            }
        }
        Ok(())
    }

    /// Replay activity held back while paused.
    pub(crate) fn run_deferred(&mut self, memory: &GuestMemory) -> Result<(), GuestError> {
        while let Some(op) = self.deferred.pop_front() {
            self.apply(memory, op)?;
        }
        Ok(())
    }
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) vcpu_count: u16,
    pub(crate) memory: GuestMemory,
    pub(crate) state: Mutex<GuestState>,
    /// Signalled whenever a trap is queued or the session shuts down.
    pub(crate) trap_ready: Condvar,
}

fn directory() -> &'static Mutex<HashMap<String, Weak<Shared>>> {
    static GUESTS: OnceLock<Mutex<HashMap<String, Weak<Shared>>>> = OnceLock::new();
    GUESTS.get_or_init(|| Mutex::new(HashMap::new()))
}

// ═══════════════════════════════════════════════════════════════════════
//  GuestController
// ═══════════════════════════════════════════════════════════════════════

/// Handle on a running simulated guest. Cheap to clone.
///
/// The guest stays alive as long as a controller or an attached session
/// refers to it.
#[derive(Clone)]
pub struct GuestController {
    pub(crate) shared: Arc<Shared>,
}

impl GuestController {
    /// Boot a new guest and register it under `name`.
    pub fn launch(name: &str, config: DummyInitParams) -> Result<Self, GuestError> {
        if config.vcpu_count == 0 {
            return Err(GuestError::NoVcpus);
        }
        let memory = GuestMemory::new(config.memory_size)?;

        let mut guests = lock(directory());
        guests.retain(|_, guest| guest.strong_count() > 0);
        if guests.contains_key(name) {
            return Err(GuestError::NameInUse(name.to_string()));
        }

        let shared = Arc::new(Shared {
            name: name.to_string(),
            vcpu_count: config.vcpu_count,
            memory,
            state: Mutex::new(GuestState {
                vcpus: vec![VcpuState::boot(); usize::from(config.vcpu_count)],
                paused: false,
                attached: false,
                session: 0,
                armed: BTreeSet::new(),
                pending: VecDeque::new(),
                deferred: VecDeque::new(),
                unreadable: BTreeSet::new(),
                page_access: BTreeMap::new(),
                next_seq: 0,
            }),
            trap_ready: Condvar::new(),
        });
        guests.insert(name.to_string(), Arc::downgrade(&shared));

        info!(
            "Guest {:?} launched: {} VCPUs, {} MB",
            name,
            config.vcpu_count,
            config.memory_size >> 20
        );
        Ok(Self { shared })
    }

    /// Find a running guest by name.
    pub fn find(name: &str) -> Option<Self> {
        lock(directory())
            .get(name)
            .and_then(Weak::upgrade)
            .map(|shared| Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn vcpu_count(&self) -> u16 {
        self.shared.vcpu_count
    }

    pub fn memory_size(&self) -> u64 {
        self.shared.memory.size()
    }

    fn check_vcpu(&self, vcpu: u16) -> Result<(), GuestError> {
        if vcpu >= self.shared.vcpu_count {
            return Err(GuestError::InvalidVcpu {
                vcpu,
                count: self.shared.vcpu_count,
            });
        }
        Ok(())
    }

    fn run(&self, op: GuestOp) -> Result<(), GuestError> {
        let mut state = lock(&self.shared.state);
        if state.paused {
            debug!("Guest {:?} paused, deferring {:?}", self.shared.name, op);
            state.deferred.push_back(op);
            return Ok(());
        }
        let queued = state.pending.len();
        state.apply(&self.shared.memory, op)?;
        if state.pending.len() > queued {
            self.shared.trap_ready.notify_all();
        }
        Ok(())
    }

    // ─── Guest activity ─────────────────────────────────────────────

    /// The guest writes a control register (`mov crN, reg`).
    pub fn write_cr(&self, vcpu: u16, cr: CrType, value: u64) -> Result<(), GuestError> {
        self.check_vcpu(vcpu)?;
        self.run(GuestOp::WriteCr { vcpu, cr, value })
    }

    /// The guest writes a model-specific register (`wrmsr`).
    pub fn write_msr(&self, vcpu: u16, index: u32, value: u64) -> Result<(), GuestError> {
        self.check_vcpu(vcpu)?;
        self.run(GuestOp::WriteMsr { vcpu, index, value })
    }

    /// The guest executes `int3` at `gpa`.
    pub fn breakpoint(&self, vcpu: u16, gpa: u64, insn_len: u8) -> Result<(), GuestError> {
        self.check_vcpu(vcpu)?;
        if insn_len == 0 || u64::from(insn_len) > MAX_INSN_LEN {
            return Err(GuestError::InvalidInstructionLength(insn_len));
        }
        self.run(GuestOp::Breakpoint {
            vcpu,
            gpa,
            insn_len,
        })
    }

    /// The guest retires one instruction and lands at `gpa`.
    pub fn singlestep(&self, vcpu: u16, gpa: u64) -> Result<(), GuestError> {
        self.check_vcpu(vcpu)?;
        self.run(GuestOp::Singlestep { vcpu, gpa })
    }

    /// An interrupt or exception is delivered to the guest.
    pub fn interrupt(&self, vcpu: u16, vector: u8, info: u64) -> Result<(), GuestError> {
        self.check_vcpu(vcpu)?;
        self.run(GuestOp::Interrupt { vcpu, vector, info })
    }

    /// The guest touches `gpa` through `gva` with `access`. Rights the page
    /// does not grant raise a pagefault trap.
    pub fn access_memory(
        &self,
        vcpu: u16,
        gva: u64,
        gpa: u64,
        access: Access,
    ) -> Result<(), GuestError> {
        self.check_vcpu(vcpu)?;
        if gpa >= self.shared.memory.size() {
            return Err(GuestError::Read { address: gpa });
        }
        self.run(GuestOp::Access {
            vcpu,
            gva,
            gpa,
            access,
        })
    }

    /// The guest stores `data` at `gpa`.
    pub fn write_memory(&self, gpa: u64, data: &[u8]) -> Result<(), GuestError> {
        let end = gpa.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > self.shared.memory.size()) {
            return Err(GuestError::Write { address: gpa });
        }
        self.run(GuestOp::WriteMemory {
            gpa,
            data: data.to_vec(),
        })
    }

    /// Queue a native trap record as-is, bypassing the armed check.
    pub fn inject_raw(
        &self,
        vcpu: u16,
        class: u32,
        arg0: u64,
        arg1: u64,
        arg2: u64,
    ) -> Result<(), GuestError> {
        self.run(GuestOp::RawTrap {
            vcpu,
            class,
            args: [arg0, arg1, arg2],
        })
    }

    /// Make a frame unreadable to the introspector, like a hole in the
    /// physical address map.
    pub fn set_frame_readable(&self, frame: u64, readable: bool) {
        let mut state = lock(&self.shared.state);
        if readable {
            state.unreadable.remove(&frame);
        } else {
            state.unreadable.insert(frame);
        }
    }

    // ─── Inspection ─────────────────────────────────────────────────

    /// Current value of a control register, including writes that are
    /// not yet visible to a paused introspector.
    pub fn control_register(&self, vcpu: u16, cr: CrType) -> Result<u64, GuestError> {
        self.check_vcpu(vcpu)?;
        let state = lock(&self.shared.state);
        Ok(control_register(&state.vcpus[usize::from(vcpu)].sregs, cr))
    }

    pub fn registers(&self, vcpu: u16) -> Result<Registers, GuestError> {
        self.check_vcpu(vcpu)?;
        let state = lock(&self.shared.state);
        let v = &state.vcpus[usize::from(vcpu)];
        Ok(Registers::X86(x86_from_kvm(&v.regs, &v.sregs, &v.msrs)))
    }

    /// Access rights currently set on a frame.
    pub fn page_access(&self, frame: u64) -> Access {
        lock(&self.shared.state).access_of(frame)
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.shared.state).attached
    }

    /// Intercepts the attached session has armed.
    pub fn armed_intercepts(&self) -> Vec<(u16, InterceptType)> {
        lock(&self.shared.state).armed.iter().copied().collect()
    }

    /// Traps queued but not yet picked up by `listen`.
    pub fn pending_traps(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }
}

/// Number of frames a guest of `size` bytes spans.
pub(crate) fn frame_count(size: u64) -> u64 {
    size >> PAGE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vcpus: u16) -> DummyInitParams {
        DummyInitParams {
            memory_size: 64 * 1024,
            vcpu_count: vcpus,
        }
    }

    #[test]
    fn launch_validates_config() {
        assert!(matches!(
            GuestController::launch("guest-bad-size", DummyInitParams {
                memory_size: 1000,
                vcpu_count: 1
            }),
            Err(GuestError::InvalidSize { size: 1000 })
        ));
        assert!(matches!(
            GuestController::launch("guest-no-vcpu", config(0)),
            Err(GuestError::NoVcpus)
        ));
    }

    #[test]
    fn names_are_unique_while_alive() {
        let guest = GuestController::launch("guest-unique", config(1)).unwrap();
        assert!(matches!(
            GuestController::launch("guest-unique", config(1)),
            Err(GuestError::NameInUse(_))
        ));
        assert!(GuestController::find("guest-unique").is_some());
        drop(guest);
        assert!(GuestController::find("guest-unique").is_none());
        GuestController::launch("guest-unique", config(1)).unwrap();
    }

    #[test]
    fn boots_in_long_mode() {
        let guest = GuestController::launch("guest-boot", config(2)).unwrap();
        let Registers::X86(regs) = guest.registers(1).unwrap();
        assert_eq!(regs.rip, BOOT_RIP);
        assert_eq!(regs.cr3, BOOT_CR3);
        assert_ne!(regs.cr0 & X86_CR0_PG, 0);
        assert_eq!(regs.efer, EFER_LME | EFER_LMA);
        assert_eq!(regs.msr_efer, regs.efer);
        assert_eq!(regs.cs.selector, 0x08);
    }

    #[test]
    fn activity_updates_state_without_session() {
        let guest = GuestController::launch("guest-activity", config(1)).unwrap();
        guest.write_cr(0, CrType::Cr3, 0xa000).unwrap();
        guest.write_msr(0, MSR_IA32_EFER, 0xd01).unwrap();
        guest.singlestep(0, 0x1234).unwrap();

        let Registers::X86(regs) = guest.registers(0).unwrap();
        assert_eq!(regs.cr3, 0xa000);
        assert_eq!(regs.efer, 0xd01);
        assert_eq!(regs.rip, 0x1234);
        assert_eq!(guest.pending_traps(), 0, "no session, no traps");
    }

    #[test]
    fn invalid_vcpu_rejected() {
        let guest = GuestController::launch("guest-vcpu", config(1)).unwrap();
        assert!(matches!(
            guest.write_cr(1, CrType::Cr0, 0),
            Err(GuestError::InvalidVcpu { vcpu: 1, count: 1 })
        ));
    }

    #[test]
    fn breakpoint_length_checked() {
        let guest = GuestController::launch("guest-int3", config(1)).unwrap();
        assert!(matches!(
            guest.breakpoint(0, 0x1000, 0),
            Err(GuestError::InvalidInstructionLength(0))
        ));
        assert!(matches!(
            guest.breakpoint(0, 0x1000, 16),
            Err(GuestError::InvalidInstructionLength(16))
        ));
        guest.breakpoint(0, 0x1000, 15).unwrap();
        let Registers::X86(regs) = guest.registers(0).unwrap();
        assert_eq!(regs.rip, 0x1000);
    }

    #[test]
    fn access_checked_against_page_rights() {
        let guest = GuestController::launch("guest-access", config(1)).unwrap();
        {
            let mut state = lock(&guest.shared.state);
            state.attached = true;
            state.armed.insert((0, InterceptType::Pagefault));
            state.restrict(2, Access::RW);
        }
        guest.access_memory(0, 0x7000_2000, 0x2010, Access::R).unwrap();
        assert_eq!(guest.pending_traps(), 0);
        guest.access_memory(0, 0x7000_2000, 0x2010, Access::RX).unwrap();
        assert_eq!(guest.pending_traps(), 1);
        assert_eq!(guest.page_access(2), Access::RW);
        assert_eq!(guest.page_access(3), Access::RWX);
        assert!(guest.access_memory(0, 0, 64 * 1024, Access::R).is_err());
    }

    #[test]
    fn memory_writes_bounded() {
        let guest = GuestController::launch("guest-mem", config(1)).unwrap();
        guest.write_memory(0x100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        guest.shared.memory.read(0x100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(guest.write_memory(64 * 1024 - 2, b"abc").is_err());
        assert_eq!(frame_count(guest.memory_size()), 16);
    }
}
