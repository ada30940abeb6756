//! Exported driver entry points.
//!
//! Each export validates its out-pointers, calls into [`runtime`] and maps the
//! outcome back to a driver status code.

#![allow(non_snake_case)]

use std::ffi::{CStr, c_char, c_int, c_uint, c_void};

use tracing::{debug, warn};

use gvm_core::driver::{Dim3, DevicePtr, KernelLaunch, StreamHandle};
use gvm_core::error::{InterceptError, Result};
use gvm_core::ffi_types::{
    CU_GET_PROC_ADDRESS_SYMBOL_NOT_FOUND, CUDA_ERROR_INVALID_VALUE, CUDA_ERROR_NOT_FOUND,
    CUDA_ERROR_NOT_INITIALIZED, CUDA_SUCCESS, CUdeviceptr, CUdriverProcAddressQueryResult,
    CUfunction, CUresult, CUstream, cuuint64_t,
};
use gvm_cuda::sys::{forwarding_table, guard_forward};
use gvm_intercept::{Dispatcher, HookedSymbol, Resolution};

use crate::runtime::runtime;

static DISPATCHER: Dispatcher = Dispatcher::new();

fn status(result: Result<()>) -> CUresult {
    match result {
        Ok(()) => CUDA_SUCCESS,
        Err(err @ InterceptError::OutOfMemory { .. }) => {
            debug!(error = %err, "allocation refused by admission");
            err.cu_result()
        }
        Err(err) => err.cu_result(),
    }
}

/// Store `ptr` through `out` on success.
///
/// # Safety
/// `out` must be valid for writes.
unsafe fn write_ptr(out: *mut CUdeviceptr, result: Result<DevicePtr>) -> CUresult {
    status(result.map(|ptr| {
        // SAFETY: guaranteed by the caller.
        unsafe { *out = ptr.0 };
    }))
}

// ─── Allocation ─────────────────────────────────────────────────────────────

/// # Safety
/// `dptr` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cuMemAlloc_v2(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult {
    if dptr.is_null() {
        return CUDA_ERROR_INVALID_VALUE;
    }
    // SAFETY: non-null out pointer supplied by the application.
    unsafe { write_ptr(dptr, runtime().mem_alloc(bytesize as u64)) }
}

/// # Safety
/// `dptr` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cuMemAlloc(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult {
    // SAFETY: same contract.
    unsafe { cuMemAlloc_v2(dptr, bytesize) }
}

/// # Safety
/// `dptr` must be null or valid for writes; `h_stream` must be a stream of
/// the current context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cuMemAllocAsync(
    dptr: *mut CUdeviceptr,
    bytesize: usize,
    h_stream: CUstream,
) -> CUresult {
    if dptr.is_null() {
        return CUDA_ERROR_INVALID_VALUE;
    }
    let result = runtime().mem_alloc_async(bytesize as u64, StreamHandle(h_stream));
    // SAFETY: non-null out pointer supplied by the application.
    unsafe { write_ptr(dptr, result) }
}

/// # Safety
/// `dptr` must come from a driver allocation.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cuMemFree_v2(dptr: CUdeviceptr) -> CUresult {
    status(runtime().mem_free(DevicePtr(dptr)))
}

/// # Safety
/// `dptr` must come from a driver allocation.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cuMemFree(dptr: CUdeviceptr) -> CUresult {
    // SAFETY: same contract.
    unsafe { cuMemFree_v2(dptr) }
}

// ─── Launch ─────────────────────────────────────────────────────────────────

/// # Safety
/// Same contract as the driver's `cuLaunchKernel`.
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn cuLaunchKernel(
    f: CUfunction,
    grid_dim_x: c_uint,
    grid_dim_y: c_uint,
    grid_dim_z: c_uint,
    block_dim_x: c_uint,
    block_dim_y: c_uint,
    block_dim_z: c_uint,
    shared_mem_bytes: c_uint,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult {
    let launch = KernelLaunch {
        function: f,
        grid: Dim3 {
            x: grid_dim_x,
            y: grid_dim_y,
            z: grid_dim_z,
        },
        block: Dim3 {
            x: block_dim_x,
            y: block_dim_y,
            z: block_dim_z,
        },
        shared_mem_bytes,
        stream: StreamHandle(h_stream),
        kernel_params,
        extra,
    };
    // SAFETY: arguments forwarded unchanged from the application.
    status(unsafe { runtime().launch_kernel(&launch) })
}

// ─── Symbol resolution ──────────────────────────────────────────────────────

/// Address of the export standing in for `sym`.
pub fn export_address(sym: HookedSymbol) -> *mut c_void {
    match sym {
        HookedSymbol::MemAlloc => cuMemAlloc as *mut c_void,
        HookedSymbol::MemAllocV2 => cuMemAlloc_v2 as *mut c_void,
        HookedSymbol::MemAllocAsync => cuMemAllocAsync as *mut c_void,
        HookedSymbol::MemFree => cuMemFree as *mut c_void,
        HookedSymbol::MemFreeV2 => cuMemFree_v2 as *mut c_void,
        HookedSymbol::LaunchKernel => cuLaunchKernel as *mut c_void,
        HookedSymbol::GetProcAddress => cuGetProcAddress as *mut c_void,
        HookedSymbol::GetProcAddressV2 => cuGetProcAddress_v2 as *mut c_void,
    }
}

/// Post-process a driver symbol lookup: wrapped names get our export, every
/// other pointer is kept unless it points back into this library.
///
/// # Safety
/// `symbol` must be null or a NUL-terminated string; `pfn` must be null or
/// valid for reads and writes.
pub(crate) unsafe fn substitute(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    cuda_version: c_int,
    code: CUresult,
) -> CUresult {
    if code != CUDA_SUCCESS || symbol.is_null() || pfn.is_null() {
        return code;
    }
    // SAFETY: checked non-null; NUL termination guaranteed by the caller.
    let Ok(name) = unsafe { CStr::from_ptr(symbol) }.to_str() else {
        return code;
    };
    match DISPATCHER.resolve_for_version(name, cuda_version) {
        Resolution::Wrapped(sym) => {
            // SAFETY: checked non-null.
            unsafe { *pfn = export_address(sym) };
            code
        }
        Resolution::Forward => {
            // SAFETY: checked non-null.
            let resolved = unsafe { *pfn };
            if resolved.is_null() {
                return code;
            }
            match guard_forward(resolved, name) {
                Ok(()) => code,
                Err(err) => {
                    warn!(symbol = name, error = %err, "refusing self-referential resolution");
                    // SAFETY: checked non-null.
                    unsafe { *pfn = std::ptr::null_mut() };
                    CUDA_ERROR_NOT_FOUND
                }
            }
        }
    }
}

/// # Safety
/// Same contract as the driver's `cuGetProcAddress`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cuGetProcAddress(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    cuda_version: c_int,
    flags: cuuint64_t,
) -> CUresult {
    let Ok(table) = forwarding_table() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    let Some(real) = table.get_proc_address else {
        return CUDA_ERROR_NOT_FOUND;
    };
    // SAFETY: arguments forwarded unchanged.
    let code = unsafe { real(symbol, pfn, cuda_version, flags) };
    // SAFETY: same pointers the driver just accepted.
    unsafe { substitute(symbol, pfn, cuda_version, code) }
}

/// # Safety
/// Same contract as the driver's `cuGetProcAddress_v2`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cuGetProcAddress_v2(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    cuda_version: c_int,
    flags: cuuint64_t,
    symbol_status: *mut CUdriverProcAddressQueryResult,
) -> CUresult {
    let Ok(table) = forwarding_table() else {
        return CUDA_ERROR_NOT_INITIALIZED;
    };
    let Some(real) = table.get_proc_address_v2 else {
        return CUDA_ERROR_NOT_FOUND;
    };
    // SAFETY: arguments forwarded unchanged.
    let code = unsafe { real(symbol, pfn, cuda_version, flags, symbol_status) };
    // SAFETY: same pointers the driver just accepted.
    let code = unsafe { substitute(symbol, pfn, cuda_version, code) };
    if code == CUDA_ERROR_NOT_FOUND && !symbol_status.is_null() {
        // SAFETY: checked non-null.
        unsafe { *symbol_status = CU_GET_PROC_ADDRESS_SYMBOL_NOT_FOUND };
    }
    code
}
