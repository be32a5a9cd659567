//! C layout of the initialization parameters.
//!
//! [`VmiInitParams`] is versioned and size-tagged. Fields are only ever
//! appended: a caller built against a newer header passes a larger block
//! whose tail is ignored, and one built against an older header passes a
//! shorter block whose missing fields read as unset.

use std::ffi::{c_char, CStr};
use std::mem;
use std::path::PathBuf;
use std::ptr;
use std::slice;

use crate::api::{DummyInitParams, InitParams, ReplayInitParams, INIT_PARAMS_VERSION};
use crate::error::InitError;

/// Name used when the C boundary rejects parameters.
const CAPI: &str = "vmiscope-capi";

/// Size of the first published layout, the smallest block accepted.
pub const VMI_INIT_PARAMS_V1_SIZE: usize =
    mem::offset_of!(VmiInitParams, extension_count) + mem::size_of::<usize>();

/// One `"<backend>.<key>"` extension.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VmiExtension {
    pub key: *const c_char,
    pub value: *const c_char,
    pub required: bool,
}

/// Initialization parameters as passed by a C caller.
///
/// Null pointers and zero sizes mean "not given".
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VmiInitParams {
    /// Must be `1..=INIT_PARAMS_VERSION`.
    pub version: u32,
    /// `sizeof(VmiInitParams)` as the caller knows it.
    pub struct_size: u32,
    pub vm_name: *const c_char,
    /// Recording for the replay backend.
    pub recording: *const c_char,
    /// Memory size of a guest the dummy backend launches, 0 for default.
    pub dummy_memory_size: u64,
    /// vCPU count of a guest the dummy backend launches, 0 for default.
    pub dummy_vcpu_count: u16,
    pub extensions: *const VmiExtension,
    pub extension_count: usize,
}

impl VmiInitParams {
    /// Parameters for `vm_name` with every other field unset.
    pub fn new(vm_name: *const c_char) -> Self {
        Self {
            version: INIT_PARAMS_VERSION,
            struct_size: mem::size_of::<Self>() as u32,
            vm_name,
            recording: std::ptr::null(),
            dummy_memory_size: 0,
            dummy_vcpu_count: 0,
            extensions: std::ptr::null(),
            extension_count: 0,
        }
    }
}

unsafe fn string(ptr: *const c_char, field: &str) -> Result<Option<String>, InitError> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(|s| Some(s.to_owned()))
        .map_err(|_| InitError::rejected(CAPI, format!("{} is not valid UTF-8", field)))
}

/// Convert a C parameter block.
///
/// # Safety
///
/// `raw` must point to `struct_size` readable bytes, every
/// non-null string must be NUL-terminated, and `extensions` must point to
/// `extension_count` entries.
pub unsafe fn to_init_params(raw: *const VmiInitParams) -> Result<InitParams, InitError> {
    // Read the tag fields first: the block may be shorter than ours.
    let header = raw as *const u32;
    let version = header.read_unaligned();
    let struct_size = header.add(1).read_unaligned() as usize;
    if struct_size < VMI_INIT_PARAMS_V1_SIZE {
        return Err(InitError::rejected(
            CAPI,
            format!(
                "parameter block of {} bytes is smaller than the first layout ({} bytes)",
                struct_size, VMI_INIT_PARAMS_V1_SIZE
            ),
        ));
    }
    let mut block = VmiInitParams::new(ptr::null());
    ptr::copy_nonoverlapping(
        raw as *const u8,
        &mut block as *mut VmiInitParams as *mut u8,
        struct_size.min(mem::size_of::<VmiInitParams>()),
    );
    let raw = block;

    let mut params = InitParams {
        version,
        ..InitParams::default()
    };
    if let Some(vm_name) = string(raw.vm_name, "vm_name")? {
        params = InitParams {
            version,
            ..InitParams::for_vm(vm_name)
        };
    }
    if let Some(recording) = string(raw.recording, "recording")? {
        params.replay = Some(ReplayInitParams {
            recording: PathBuf::from(recording),
        });
    }
    if raw.dummy_memory_size != 0 || raw.dummy_vcpu_count != 0 {
        let mut dummy = DummyInitParams::default();
        if raw.dummy_memory_size != 0 {
            dummy.memory_size = raw.dummy_memory_size;
        }
        if raw.dummy_vcpu_count != 0 {
            dummy.vcpu_count = raw.dummy_vcpu_count;
        }
        params.dummy = Some(dummy);
    }

    if raw.extension_count > 0 {
        if raw.extensions.is_null() {
            return Err(InitError::rejected(CAPI, "extensions is NULL"));
        }
        for ext in slice::from_raw_parts(raw.extensions, raw.extension_count) {
            let key = string(ext.key, "extension key")?
                .ok_or_else(|| InitError::rejected(CAPI, "extension key is NULL"))?;
            let value = string(ext.value, "extension value")?.unwrap_or_default();
            params = params.with_extension(key, value, ext.required);
        }
    }
    Ok(params)
}
