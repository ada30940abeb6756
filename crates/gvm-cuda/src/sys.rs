//! Forwarding table into the real CUDA driver.
//!
//! Every pointer is looked up with `dlsym` on the handle returned by
//! `dlopen("libcuda.so.1")`, never with `RTLD_DEFAULT`/`RTLD_NEXT`, which would
//! find the interposer's own exports first.  Each resolved address is also
//! checked with `dladdr`: a pointer that lands inside the interposer's own
//! module is refused rather than called into recursively.

use gvm_core::error::{InterceptError, Result};
use gvm_core::ffi_types::{
    PfnCtxGetDevice, PfnDeviceGet, PfnDeviceGetUuid, PfnDeviceTotalMem, PfnEventCreate, PfnEventOp, PfnEventRecord,
    PfnGetProcAddress, PfnGetProcAddressV2, PfnInit, PfnIntOut, PfnLaunchKernel, PfnMemAlloc,
    PfnMemAllocAsync, PfnMemAllocManaged, PfnMemFree, PfnMemGetAddressRange, PfnMemGetInfo,
};
#[cfg(target_os = "linux")]
use std::ffi::{CStr, CString, c_char, c_void};
#[cfg(target_os = "linux")]
use std::sync::OnceLock;

#[cfg(target_os = "linux")]
unsafe extern "C" {
    fn dlopen(filename: *const c_char, flags: i32) -> *mut c_void;
    fn dlerror() -> *const c_char;
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
    fn dladdr(addr: *const c_void, info: *mut DlInfo) -> i32;
}

#[cfg(target_os = "linux")]
const RTLD_NOW: i32 = 2;
#[cfg(target_os = "linux")]
const RTLD_GLOBAL: i32 = 0x100;

#[cfg(target_os = "linux")]
#[repr(C)]
struct DlInfo {
    dli_fname: *const c_char,
    dli_fbase: *mut c_void,
    dli_sname: *const c_char,
    dli_saddr: *mut c_void,
}

#[cfg(target_os = "linux")]
impl DlInfo {
    fn empty() -> Self {
        Self {
            dli_fname: std::ptr::null(),
            dli_fbase: std::ptr::null_mut(),
            dli_sname: std::ptr::null(),
            dli_saddr: std::ptr::null_mut(),
        }
    }
}

/// Real driver entry points, resolved once per process.
pub struct CudaForwardingTable {
    pub init: PfnInit,
    pub driver_get_version: PfnIntOut,
    pub device_get_count: PfnIntOut,
    pub device_get: PfnDeviceGet,
    pub device_total_mem: PfnDeviceTotalMem,
    pub mem_get_info: PfnMemGetInfo,
    pub mem_alloc: PfnMemAlloc,
    pub mem_alloc_managed: PfnMemAllocManaged,
    /// Stream-ordered allocator; absent before CUDA 11.2.
    pub mem_alloc_async: Option<PfnMemAllocAsync>,
    pub mem_free: PfnMemFree,
    pub mem_get_address_range: PfnMemGetAddressRange,
    pub launch_kernel: PfnLaunchKernel,
    pub event_create: PfnEventCreate,
    pub event_record: PfnEventRecord,
    pub event_query: PfnEventOp,
    pub event_synchronize: PfnEventOp,
    pub event_destroy: PfnEventOp,
    pub ctx_get_device: PfnCtxGetDevice,
    pub device_get_uuid: PfnDeviceGetUuid,
    /// Absent before CUDA 11.3.
    pub get_proc_address: Option<PfnGetProcAddress>,
    /// Absent before CUDA 12.0.
    pub get_proc_address_v2: Option<PfnGetProcAddressV2>,
    /// Path of the shared object the table was resolved from.
    pub library_path: Option<String>,
}

#[cfg(target_os = "linux")]
static FORWARDING_TABLE: OnceLock<std::result::Result<CudaForwardingTable, String>> =
    OnceLock::new();

#[cfg(target_os = "linux")]
fn last_dl_error(fallback: &str) -> String {
    // SAFETY: dlerror returns thread-local C string or null.
    unsafe {
        let p = dlerror();
        if p.is_null() {
            fallback.to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

#[cfg(target_os = "linux")]
fn module_base(addr: *const c_void) -> Option<usize> {
    let mut info = DlInfo::empty();
    // SAFETY: passing a code address and a valid DlInfo out pointer.
    let rc = unsafe { dladdr(addr, &mut info as *mut DlInfo) };
    (rc != 0 && !info.dli_fbase.is_null()).then_some(info.dli_fbase as usize)
}

#[cfg(target_os = "linux")]
fn module_path(addr: *const c_void) -> Option<String> {
    let mut info = DlInfo::empty();
    // SAFETY: passing a code address and a valid DlInfo out pointer.
    let rc = unsafe { dladdr(addr, &mut info as *mut DlInfo) };
    if rc == 0 || info.dli_fname.is_null() {
        None
    } else {
        // SAFETY: dli_fname is a valid C string on success.
        Some(
            unsafe { CStr::from_ptr(info.dli_fname) }
                .to_string_lossy()
                .to_string(),
        )
    }
}

/// Whether `addr` lies inside the module this crate is linked into.
#[cfg(target_os = "linux")]
pub fn is_own_address(addr: *const c_void) -> bool {
    let anchor = is_own_address as *const c_void;
    match (module_base(addr), module_base(anchor)) {
        (Some(target), Some(own)) => target == own,
        _ => false,
    }
}

/// Refuses a pointer that would forward back into this module.
pub fn guard_forward(ptr: *const std::ffi::c_void, name: &str) -> Result<()> {
    if ptr.is_null() {
        return Err(InterceptError::SymbolGuard(format!("{name} resolved to null")));
    }
    if is_own_address(ptr) {
        return Err(InterceptError::SymbolGuard(format!(
            "{name} resolved into the interposer itself; refusing to forward"
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn resolve(handle: *mut c_void, name: &'static str) -> std::result::Result<*mut c_void, String> {
    let cname = CString::new(name).map_err(|_| format!("invalid CUDA symbol name: {name}"))?;
    // SAFETY: handle is a valid dlopen handle and cname is a valid C symbol name.
    let ptr = unsafe { dlsym(handle, cname.as_ptr()) };
    if ptr.is_null() {
        return Err(format!(
            "dlsym({name}) failed: {}",
            last_dl_error("unknown dlsym error")
        ));
    }
    if is_own_address(ptr) {
        return Err(format!(
            "dlsym({name}) resolved into the interposer itself; refusing to forward"
        ));
    }
    Ok(ptr)
}

#[cfg(target_os = "linux")]
fn load_cuda_symbol<T>(handle: *mut c_void, name: &'static str) -> std::result::Result<T, String> {
    let ptr = resolve(handle, name)?;
    // SAFETY: ptr points to a function with signature T.
    Ok(unsafe { std::mem::transmute_copy(&ptr) })
}

#[cfg(target_os = "linux")]
fn load_optional_symbol<T>(handle: *mut c_void, name: &'static str) -> Option<T> {
    match resolve(handle, name) {
        Ok(ptr) => {
            // SAFETY: ptr points to a function with signature T.
            Some(unsafe { std::mem::transmute_copy(&ptr) })
        }
        Err(err) => {
            tracing::debug!(symbol = name, error = %err, "optional CUDA symbol unavailable");
            None
        }
    }
}

#[cfg(target_os = "linux")]
fn init_forwarding_table() -> std::result::Result<CudaForwardingTable, String> {
    let mut handle = std::ptr::null_mut();
    let mut last_err = "unknown dlopen error".to_string();
    for candidate in ["libcuda.so.1", "libcuda.so"] {
        let soname =
            CString::new(candidate).map_err(|_| format!("invalid CUDA soname: {candidate}"))?;
        // SAFETY: static soname and valid dlopen flags.
        handle = unsafe { dlopen(soname.as_ptr(), RTLD_NOW | RTLD_GLOBAL) };
        if !handle.is_null() {
            break;
        }
        last_err = last_dl_error("unknown dlopen error");
    }

    if handle.is_null() {
        return Err(format!(
            "dlopen(libcuda.so.1|libcuda.so) failed: {last_err}"
        ));
    }

    let init: PfnInit = load_cuda_symbol(handle, "cuInit")?;
    let library_path = module_path(init as *const c_void);

    Ok(CudaForwardingTable {
        init,
        driver_get_version: load_cuda_symbol(handle, "cuDriverGetVersion")?,
        device_get_count: load_cuda_symbol(handle, "cuDeviceGetCount")?,
        device_get: load_cuda_symbol(handle, "cuDeviceGet")?,
        device_total_mem: load_cuda_symbol(handle, "cuDeviceTotalMem_v2")?,
        mem_get_info: load_cuda_symbol(handle, "cuMemGetInfo_v2")?,
        mem_alloc: load_cuda_symbol(handle, "cuMemAlloc_v2")?,
        mem_alloc_managed: load_cuda_symbol(handle, "cuMemAllocManaged")?,
        mem_alloc_async: load_optional_symbol(handle, "cuMemAllocAsync"),
        mem_free: load_cuda_symbol(handle, "cuMemFree_v2")?,
        mem_get_address_range: load_cuda_symbol(handle, "cuMemGetAddressRange_v2")?,
        launch_kernel: load_cuda_symbol(handle, "cuLaunchKernel")?,
        event_create: load_cuda_symbol(handle, "cuEventCreate")?,
        event_record: load_cuda_symbol(handle, "cuEventRecord")?,
        event_query: load_cuda_symbol(handle, "cuEventQuery")?,
        event_synchronize: load_cuda_symbol(handle, "cuEventSynchronize")?,
        event_destroy: load_cuda_symbol(handle, "cuEventDestroy_v2")?,
        ctx_get_device: load_cuda_symbol(handle, "cuCtxGetDevice")?,
        device_get_uuid: load_cuda_symbol(handle, "cuDeviceGetUuid")?,
        get_proc_address: load_optional_symbol(handle, "cuGetProcAddress"),
        get_proc_address_v2: load_optional_symbol(handle, "cuGetProcAddress_v2"),
        library_path,
    })
}

/// The process-wide forwarding table, resolving it on first use.
#[cfg(target_os = "linux")]
pub fn forwarding_table() -> Result<&'static CudaForwardingTable> {
    let table = FORWARDING_TABLE.get_or_init(init_forwarding_table);
    table.as_ref().map_err(|err| {
        InterceptError::DriverLoad(format!(
            "{err}. Ensure NVIDIA driver libraries are installed and visible via LD_LIBRARY_PATH."
        ))
    })
}

#[cfg(not(target_os = "linux"))]
pub fn forwarding_table() -> Result<&'static CudaForwardingTable> {
    Err(InterceptError::DriverLoad(
        "driver interposition is only supported on Linux".into(),
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn is_own_address(_addr: *const std::ffi::c_void) -> bool {
    false
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    fn local_marker() {}

    #[test]
    fn own_functions_are_recognised() {
        assert!(is_own_address(local_marker as *const c_void));
    }

    #[test]
    fn guard_refuses_self_and_null() {
        let err = guard_forward(local_marker as *const c_void, "cuMemAlloc").unwrap_err();
        assert_eq!(err.error_code(), 102);
        assert!(guard_forward(std::ptr::null(), "cuMemAlloc").is_err());
    }

    #[test]
    fn unknown_addresses_are_not_claimed() {
        assert!(!is_own_address(std::ptr::null()));
    }

    #[test]
    #[ignore = "requires NVIDIA driver libraries on host"]
    fn forwarding_table_resolves_real_driver() {
        let table = forwarding_table().expect("libcuda should load");
        assert!(
            table
                .library_path
                .as_deref()
                .is_some_and(|p| p.contains("libcuda"))
        );
    }
}
