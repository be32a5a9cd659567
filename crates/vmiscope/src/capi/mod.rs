//! The exported C boundary.
//!
//! Sessions are referred to by opaque `u64` handles looked up in a
//! process-wide table; a handle is never dereferenced as a pointer, so a
//! stale or repeated handle yields [`VmiStatus::InvalidHandle`] instead of
//! undefined behavior. `0` is never a valid handle.
//!
//! Every fallible function returns a [`VmiStatus`]. `vmi_init` also hands
//! back an owned error message; for calls on an open session the message of
//! the most recent failure is fetched with [`vmi_last_error`]. Both are
//! released with [`vmi_error_free`].

pub mod params;

use log::{debug, warn};
use std::collections::HashMap;
use std::ffi::{c_char, CString};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::api::{
    Access, BackendId, Event, EventReply, InitParams, InterceptType, PageFrame, Registers,
};
use crate::driver::BackendSelector;
use crate::error::{DriverError, InitError};
use crate::lock;
use crate::vmi::Vmi;
pub use params::{VmiExtension, VmiInitParams, VMI_INIT_PARAMS_V1_SIZE};

/// Version of the exported function set and struct layouts.
pub const VMI_ABI_VERSION: u32 = 1;

/// Outcome of an exported call.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmiStatus {
    Ok = 0,
    /// `vmi_listen` returned without an event.
    Timeout = 1,
    InvalidHandle = 2,
    NullPointer = 3,
    InvalidArgument = 4,
    Unsupported = 5,
    NotPaused = 6,
    FrameNotMapped = 7,
    TornDown = 8,
    NoBackendAvailable = 9,
    UnknownBackend = 10,
    RejectedParameters = 11,
    BackendFailure = 12,
    MalformedTrap = 13,
    Io = 14,
}

impl From<&DriverError> for VmiStatus {
    fn from(e: &DriverError) -> Self {
        match e {
            DriverError::InvalidHandle => VmiStatus::InvalidHandle,
            DriverError::TornDown => VmiStatus::TornDown,
            DriverError::Unsupported(_) => VmiStatus::Unsupported,
            DriverError::InvalidArgument(_) => VmiStatus::InvalidArgument,
            DriverError::NotPaused => VmiStatus::NotPaused,
            DriverError::FrameNotMapped(_) => VmiStatus::FrameNotMapped,
            DriverError::MalformedTrap(_) => VmiStatus::MalformedTrap,
            DriverError::Io(_) => VmiStatus::Io,
            DriverError::Backend(_) => VmiStatus::BackendFailure,
        }
    }
}

impl From<&InitError> for VmiStatus {
    fn from(e: &InitError) -> Self {
        match e {
            InitError::NoBackendAvailable => VmiStatus::NoBackendAvailable,
            InitError::UnknownBackend(_) => VmiStatus::UnknownBackend,
            InitError::RejectedParameters { .. } => VmiStatus::RejectedParameters,
            InitError::BackendFailure { .. } => VmiStatus::BackendFailure,
            InitError::DuplicateBackend(_) => VmiStatus::InvalidArgument,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Handle table
// ═══════════════════════════════════════════════════════════════════════

struct Session {
    vmi: Vmi,
    /// Message of the most recent failed call on this handle.
    last_error: Mutex<Option<String>>,
}

impl Session {
    fn fail(&self, status: VmiStatus, message: String) -> VmiStatus {
        *lock(&self.last_error) = Some(message);
        status
    }
}

fn sessions() -> &'static Mutex<HashMap<u64, Arc<Session>>> {
    static SESSIONS: OnceLock<Mutex<HashMap<u64, Arc<Session>>>> = OnceLock::new();
    SESSIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn insert_session(vmi: Vmi) -> u64 {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    let session = Session {
        vmi,
        last_error: Mutex::new(None),
    };
    lock(sessions()).insert(handle, Arc::new(session));
    handle
}

fn session(handle: u64) -> Option<Arc<Session>> {
    lock(sessions()).get(&handle).cloned()
}

/// Report a NULL argument, recording it against the session if the
/// handle is open.
fn null_pointer(handle: u64, what: &str) -> VmiStatus {
    match session(handle) {
        Some(session) => session.fail(VmiStatus::NullPointer, format!("{} is NULL", what)),
        None => VmiStatus::NullPointer,
    }
}

/// Run `op` on the session behind `handle`. The table lock is not held
/// while `op` runs, so a blocked `vmi_listen` does not stall other calls.
fn with_session<F>(handle: u64, op: F) -> VmiStatus
where
    F: FnOnce(&Vmi) -> Result<VmiStatus, DriverError>,
{
    let Some(session) = session(handle) else {
        return VmiStatus::InvalidHandle;
    };
    match op(&session.vmi) {
        Ok(status) => status,
        Err(e) => {
            debug!("Handle {}: {}", handle, e);
            session.fail(VmiStatus::from(&e), e.to_string())
        }
    }
}

fn offset_address(paddr: u64, done: usize) -> Result<u64, DriverError> {
    paddr.checked_add(done as u64).ok_or_else(|| {
        DriverError::InvalidArgument(format!("range at {:#x} wraps the address space", paddr))
    })
}

unsafe fn set_error(out_error: *mut *mut c_char, message: String) {
    if out_error.is_null() {
        return;
    }
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    out_error.write(message.into_raw());
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[no_mangle]
pub extern "C" fn vmi_abi_version() -> u32 {
    VMI_ABI_VERSION
}

/// Install a logger honouring `RUST_LOG`. Safe to call more than once.
#[no_mangle]
pub extern "C" fn vmi_logger_init() -> bool {
    crate::logging::init()
}

/// Open a session.
///
/// `backend` selects a backend id, or auto-detection when NULL. `params`
/// may be NULL. On failure `*out_error` (if non-NULL) receives a message to
/// be released with [`vmi_error_free`].
///
/// # Safety
///
/// Non-null pointers must be valid for their pointee type; `params` must
/// satisfy [`params::to_init_params`].
#[no_mangle]
pub unsafe extern "C" fn vmi_init(
    backend: *const u32,
    params: *const VmiInitParams,
    out_handle: *mut u64,
    out_error: *mut *mut c_char,
) -> VmiStatus {
    if !out_error.is_null() {
        out_error.write(ptr::null_mut());
    }
    if out_handle.is_null() {
        set_error(out_error, "out_handle is NULL".to_string());
        return VmiStatus::NullPointer;
    }

    let selector = BackendSelector::from((!backend.is_null()).then(|| BackendId(backend.read())));
    let result = if params.is_null() {
        Ok(InitParams::default())
    } else {
        params::to_init_params(params)
    }
    .and_then(|params| Vmi::init(selector, &params));

    match result {
        Ok(vmi) => {
            let handle = insert_session(vmi);
            debug!("Opened handle {}", handle);
            out_handle.write(handle);
            VmiStatus::Ok
        }
        Err(e) => {
            warn!("vmi_init failed: {}", e);
            let status = VmiStatus::from(&e);
            set_error(out_error, e.to_string());
            status
        }
    }
}

/// Release a message returned by [`vmi_init`] or [`vmi_last_error`]. NULL
/// is ignored.
///
/// # Safety
///
/// `error` must come from this library and must not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn vmi_error_free(error: *mut c_char) {
    if !error.is_null() {
        drop(CString::from_raw(error));
    }
}

/// Message describing the most recent failed call on `handle`.
///
/// `*out_error` receives an owned copy to release with [`vmi_error_free`],
/// or NULL when no call on this handle has failed yet.
///
/// # Safety
///
/// `out_error` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn vmi_last_error(handle: u64, out_error: *mut *mut c_char) -> VmiStatus {
    if out_error.is_null() {
        return VmiStatus::NullPointer;
    }
    out_error.write(ptr::null_mut());
    let Some(session) = session(handle) else {
        return VmiStatus::InvalidHandle;
    };
    let message = lock(&session.last_error).clone();
    if let Some(message) = message {
        set_error(out_error, message);
    }
    VmiStatus::Ok
}

/// Tear down a session. A second call with the same handle returns
/// `InvalidHandle`.
#[no_mangle]
pub extern "C" fn vmi_destroy(handle: u64) -> VmiStatus {
    let Some(session) = lock(sessions()).remove(&handle) else {
        return VmiStatus::InvalidHandle;
    };
    session.vmi.destroy();
    debug!("Closed handle {}", handle);
    VmiStatus::Ok
}

#[no_mangle]
pub extern "C" fn vmi_pause(handle: u64) -> VmiStatus {
    with_session(handle, |vmi| vmi.pause().map(|_| VmiStatus::Ok))
}

#[no_mangle]
pub extern "C" fn vmi_resume(handle: u64) -> VmiStatus {
    with_session(handle, |vmi| vmi.resume().map(|_| VmiStatus::Ok))
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory and registers
// ═══════════════════════════════════════════════════════════════════════

/// Read `len` bytes of guest physical memory starting at `paddr`. The
/// request may span frames; `*bytes_read` (if non-NULL) receives how much
/// was read before a failure.
///
/// # Safety
///
/// `buffer` must be valid for `len` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn vmi_read_physical(
    handle: u64,
    paddr: u64,
    buffer: *mut u8,
    len: usize,
    bytes_read: *mut u64,
) -> VmiStatus {
    if buffer.is_null() && len > 0 {
        return null_pointer(handle, "buffer");
    }
    let buf: &mut [u8] = if len == 0 {
        &mut []
    } else {
        slice::from_raw_parts_mut(buffer, len)
    };
    let mut done = 0usize;
    let status = with_session(handle, |vmi| {
        while done < buf.len() {
            let addr = offset_address(paddr, done)?;
            let chunk = PageFrame::containing(addr).window_len().min(buf.len() - done);
            vmi.read_physical_into(addr, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(VmiStatus::Ok)
    });
    if !bytes_read.is_null() {
        bytes_read.write(done as u64);
    }
    status
}

/// Write `len` bytes to guest physical memory starting at `paddr`.
///
/// # Safety
///
/// `buffer` must be valid for `len` bytes of reads.
#[no_mangle]
pub unsafe extern "C" fn vmi_write_physical(
    handle: u64,
    paddr: u64,
    buffer: *const u8,
    len: usize,
) -> VmiStatus {
    if buffer.is_null() && len > 0 {
        return null_pointer(handle, "buffer");
    }
    let buf: &[u8] = if len == 0 {
        &[]
    } else {
        slice::from_raw_parts(buffer, len)
    };
    with_session(handle, |vmi| {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = offset_address(paddr, done)?;
            let chunk = PageFrame::containing(addr).window_len().min(buf.len() - done);
            vmi.write_physical(addr, &buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(VmiStatus::Ok)
    })
}

/// # Safety
///
/// `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn vmi_get_max_physical_addr(handle: u64, out: *mut u64) -> VmiStatus {
    if out.is_null() {
        return null_pointer(handle, "out");
    }
    with_session(handle, |vmi| {
        out.write(vmi.max_physical_address()?);
        Ok(VmiStatus::Ok)
    })
}

/// # Safety
///
/// `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn vmi_get_vcpu_count(handle: u64, out: *mut u16) -> VmiStatus {
    if out.is_null() {
        return null_pointer(handle, "out");
    }
    with_session(handle, |vmi| {
        out.write(vmi.vcpu_count()?);
        Ok(VmiStatus::Ok)
    })
}

/// # Safety
///
/// `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn vmi_read_registers(
    handle: u64,
    vcpu: u16,
    out: *mut Registers,
) -> VmiStatus {
    if out.is_null() {
        return null_pointer(handle, "out");
    }
    with_session(handle, |vmi| {
        out.write(vmi.read_registers(vcpu)?);
        Ok(VmiStatus::Ok)
    })
}

/// # Safety
///
/// `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn vmi_get_backend_id(handle: u64, out: *mut u32) -> VmiStatus {
    if out.is_null() {
        return null_pointer(handle, "out");
    }
    with_session(handle, |vmi| {
        out.write(vmi.backend_id()?.0);
        Ok(VmiStatus::Ok)
    })
}

/// Access rights (`Access` bits) on the page containing `paddr`.
///
/// # Safety
///
/// `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn vmi_get_page_access(handle: u64, paddr: u64, out: *mut u32) -> VmiStatus {
    if out.is_null() {
        return null_pointer(handle, "out");
    }
    with_session(handle, |vmi| {
        out.write(vmi.get_page_access(paddr)?.bits());
        Ok(VmiStatus::Ok)
    })
}

#[no_mangle]
pub extern "C" fn vmi_set_page_access(handle: u64, paddr: u64, access: u32) -> VmiStatus {
    with_session(handle, |vmi| {
        let access = Access::from_bits(access).ok_or_else(|| {
            DriverError::InvalidArgument(format!("access bits {:#x} are not valid", access))
        })?;
        vmi.set_page_access(paddr, access)?;
        Ok(VmiStatus::Ok)
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Intercepts and events
// ═══════════════════════════════════════════════════════════════════════

#[no_mangle]
pub extern "C" fn vmi_toggle_intercept(
    handle: u64,
    vcpu: u16,
    intercept: InterceptType,
    enabled: bool,
) -> VmiStatus {
    with_session(handle, |vmi| {
        vmi.toggle_intercept(vcpu, intercept, enabled)?;
        Ok(VmiStatus::Ok)
    })
}

/// Wait up to `timeout_ms` for an event. Returns `Timeout` and leaves
/// `*out` untouched when none arrived.
///
/// # Safety
///
/// `out` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn vmi_listen(handle: u64, timeout_ms: u32, out: *mut Event) -> VmiStatus {
    if out.is_null() {
        return null_pointer(handle, "out");
    }
    with_session(handle, |vmi| {
        match vmi.listen(Duration::from_millis(u64::from(timeout_ms)))? {
            Some(event) => {
                out.write(event);
                Ok(VmiStatus::Ok)
            }
            None => Ok(VmiStatus::Timeout),
        }
    })
}

/// # Safety
///
/// `event` must point to an event returned by [`vmi_listen`].
#[no_mangle]
pub unsafe extern "C" fn vmi_reply_event(
    handle: u64,
    event: *const Event,
    reply: EventReply,
) -> VmiStatus {
    if event.is_null() {
        return null_pointer(handle, "event");
    }
    let event = event.read();
    with_session(handle, |vmi| {
        vmi.reply_event(&event, reply)?;
        Ok(VmiStatus::Ok)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CrType, DummyInitParams, EventKind, X86Registers};
    use crate::driver::dummy::GuestController;
    use std::ffi::CStr;

    fn open(name: &str, vcpus: u16) -> (GuestController, u64) {
        let guest = GuestController::launch(
            name,
            DummyInitParams {
                memory_size: 1 << 16,
                vcpu_count: vcpus,
            },
        )
        .unwrap();
        let vm_name = CString::new(name).unwrap();
        let params = VmiInitParams::new(vm_name.as_ptr());
        let backend = BackendId::DUMMY.0;
        let mut handle = 0u64;
        let status =
            unsafe { vmi_init(&backend, &params, &mut handle, ptr::null_mut()) };
        assert_eq!(status, VmiStatus::Ok);
        assert_ne!(handle, 0);
        (guest, handle)
    }

    #[test]
    fn abi_version() {
        assert_eq!(vmi_abi_version(), VMI_ABI_VERSION);
    }

    #[test]
    fn init_failure_returns_message() {
        let backend = 4242u32;
        let mut handle = 0u64;
        let mut error: *mut c_char = ptr::null_mut();
        let status = unsafe { vmi_init(&backend, ptr::null(), &mut handle, &mut error) };
        assert_eq!(status, VmiStatus::UnknownBackend);
        assert!(!error.is_null());
        let message = unsafe { CStr::from_ptr(error) }.to_str().unwrap().to_owned();
        assert!(message.contains("4242"));
        unsafe { vmi_error_free(error) };
    }

    #[test]
    fn session_queries() {
        let (_guest, handle) = open("capi-queries", 2);

        let mut count = 0u16;
        assert_eq!(unsafe { vmi_get_vcpu_count(handle, &mut count) }, VmiStatus::Ok);
        assert_eq!(count, 2);

        let mut max = 0u64;
        assert_eq!(
            unsafe { vmi_get_max_physical_addr(handle, &mut max) },
            VmiStatus::Ok
        );
        assert_eq!(max, 0xffff);

        let mut id = u32::MAX;
        assert_eq!(unsafe { vmi_get_backend_id(handle, &mut id) }, VmiStatus::Ok);
        assert_eq!(id, BackendId::DUMMY.0);

        let mut regs = Registers::X86(X86Registers::default());
        assert_eq!(
            unsafe { vmi_read_registers(handle, 1, &mut regs) },
            VmiStatus::Ok
        );
        assert_ne!(regs.instruction_pointer(), 0);
        assert_eq!(
            unsafe { vmi_read_registers(handle, 9, &mut regs) },
            VmiStatus::InvalidArgument
        );

        assert_eq!(
            unsafe { vmi_get_vcpu_count(handle, ptr::null_mut()) },
            VmiStatus::NullPointer
        );
        assert_eq!(vmi_destroy(handle), VmiStatus::Ok);
    }

    #[test]
    fn memory_across_frames() {
        let (guest, handle) = open("capi-memory", 1);
        let data: Vec<u8> = (0..64).collect();
        assert_eq!(
            unsafe { vmi_write_physical(handle, 0x1fe0, data.as_ptr(), data.len()) },
            VmiStatus::Ok
        );

        let mut buf = [0u8; 64];
        let mut read = 0u64;
        assert_eq!(
            unsafe { vmi_read_physical(handle, 0x1fe0, buf.as_mut_ptr(), buf.len(), &mut read) },
            VmiStatus::Ok
        );
        assert_eq!(read, 64);
        assert_eq!(buf.to_vec(), data);

        guest.set_frame_readable(3, false);
        let mut big = vec![0u8; 0x2000];
        assert_eq!(
            unsafe { vmi_read_physical(handle, 0x2000, big.as_mut_ptr(), big.len(), &mut read) },
            VmiStatus::FrameNotMapped
        );
        assert_eq!(read, 0x1000);
        vmi_destroy(handle);
    }

    #[test]
    fn listen_and_timeout() {
        let (guest, handle) = open("capi-listen", 1);
        let mut event = Event {
            vcpu: 0,
            kind: EventKind::Singlestep { gpa: 0 },
        };
        assert_eq!(
            unsafe { vmi_listen(handle, 0, &mut event) },
            VmiStatus::Timeout
        );

        assert_eq!(
            vmi_toggle_intercept(handle, 0, InterceptType::Cr(CrType::Cr3), true),
            VmiStatus::Ok
        );
        guest.write_cr(0, CrType::Cr3, 0x7000).unwrap();
        assert_eq!(unsafe { vmi_listen(handle, 100, &mut event) }, VmiStatus::Ok);
        assert!(matches!(
            event.kind,
            EventKind::Cr {
                cr_type: CrType::Cr3,
                new: 0x7000,
                ..
            }
        ));
        assert_eq!(
            unsafe { vmi_reply_event(handle, &event, EventReply::Continue) },
            VmiStatus::Ok
        );
        vmi_destroy(handle);
    }

    #[test]
    fn pause_resume_statuses() {
        let (_guest, handle) = open("capi-pause", 1);
        assert_eq!(vmi_resume(handle), VmiStatus::NotPaused);
        assert_eq!(vmi_pause(handle), VmiStatus::Ok);
        assert_eq!(vmi_resume(handle), VmiStatus::Ok);
        vmi_destroy(handle);
    }

    fn last_error(handle: u64) -> Option<String> {
        let mut error: *mut c_char = ptr::null_mut();
        assert_eq!(unsafe { vmi_last_error(handle, &mut error) }, VmiStatus::Ok);
        if error.is_null() {
            return None;
        }
        let message = unsafe { CStr::from_ptr(error) }.to_str().unwrap().to_owned();
        unsafe { vmi_error_free(error) };
        Some(message)
    }

    #[test]
    fn failed_calls_leave_a_message() {
        let (_guest, handle) = open("capi-last-error", 1);
        assert_eq!(last_error(handle), None);

        assert_eq!(vmi_resume(handle), VmiStatus::NotPaused);
        assert!(last_error(handle).unwrap().contains("not paused"));

        assert_eq!(
            vmi_toggle_intercept(handle, 5, InterceptType::Breakpoint, true),
            VmiStatus::InvalidArgument
        );
        assert!(last_error(handle).unwrap().contains("VCPU 5"));

        assert_eq!(
            unsafe { vmi_listen(handle, 0, ptr::null_mut()) },
            VmiStatus::NullPointer
        );
        assert_eq!(last_error(handle).unwrap(), "out is NULL");

        vmi_destroy(handle);
        let mut error: *mut c_char = ptr::null_mut();
        assert_eq!(
            unsafe { vmi_last_error(handle, &mut error) },
            VmiStatus::InvalidHandle
        );
        assert!(error.is_null());
    }

    #[test]
    fn page_access_bits() {
        let (guest, handle) = open("capi-page-access", 1);
        let mut bits = 0u32;
        assert_eq!(
            unsafe { vmi_get_page_access(handle, 0x2000, &mut bits) },
            VmiStatus::Ok
        );
        assert_eq!(bits, Access::RWX.bits());

        assert_eq!(
            vmi_set_page_access(handle, 0x2000, Access::RX.bits()),
            VmiStatus::Ok
        );
        assert_eq!(guest.page_access(2), Access::RX);
        assert_eq!(
            vmi_set_page_access(handle, 0x2000, 0x10),
            VmiStatus::InvalidArgument
        );
        assert_eq!(
            vmi_set_page_access(handle, 0x10_0000, Access::R.bits()),
            VmiStatus::FrameNotMapped
        );
        vmi_destroy(handle);
    }

    #[test]
    fn destroyed_handle_is_invalid() {
        let (guest, handle) = open("capi-destroy", 1);
        assert_eq!(vmi_destroy(handle), VmiStatus::Ok);
        assert_eq!(vmi_destroy(handle), VmiStatus::InvalidHandle);
        assert_eq!(vmi_pause(handle), VmiStatus::InvalidHandle);
        assert_eq!(vmi_pause(0), VmiStatus::InvalidHandle);
        assert!(!guest.is_attached());
    }
}
