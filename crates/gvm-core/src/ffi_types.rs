//! Raw CUDA driver ABI types shared by the forwarding table and the exported
//! entry points.
//!
//! Only the handful of types and status codes the interposer touches are
//! declared here; everything else passes through as an opaque pointer.

#![allow(non_camel_case_types)]

use std::ffi::{c_int, c_uint, c_void};

/// Driver status code (`CUresult`).
pub type CUresult = c_int;
/// Device ordinal (`CUdevice`).
pub type CUdevice = c_int;
/// Device virtual address (`CUdeviceptr`, 64-bit on every supported target).
pub type CUdeviceptr = u64;
/// Opaque event handle (`CUevent`).
pub type CUevent = *mut c_void;
/// Opaque stream handle (`CUstream`). Null is the legacy default stream.
pub type CUstream = *mut c_void;
/// Opaque kernel function handle (`CUfunction`).
pub type CUfunction = *mut c_void;
/// `cuuint64_t`.
pub type cuuint64_t = u64;
/// `CUdriverProcAddressQueryResult` out-parameter of `cuGetProcAddress_v2`.
pub type CUdriverProcAddressQueryResult = c_int;

pub const CUDA_SUCCESS: CUresult = 0;
pub const CUDA_ERROR_INVALID_VALUE: CUresult = 1;
pub const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
pub const CUDA_ERROR_NOT_INITIALIZED: CUresult = 3;
pub const CUDA_ERROR_NOT_FOUND: CUresult = 500;
pub const CUDA_ERROR_NOT_READY: CUresult = 600;
pub const CUDA_ERROR_UNKNOWN: CUresult = 999;

/// `CU_MEM_ATTACH_GLOBAL`: managed memory accessible from any stream.
pub const CU_MEM_ATTACH_GLOBAL: c_uint = 0x1;
/// `CU_EVENT_DISABLE_TIMING`: the cheapest event flavour; completion-only.
pub const CU_EVENT_DISABLE_TIMING: c_uint = 0x2;

pub const CU_GET_PROC_ADDRESS_SUCCESS: CUdriverProcAddressQueryResult = 0;
pub const CU_GET_PROC_ADDRESS_SYMBOL_NOT_FOUND: CUdriverProcAddressQueryResult = 1;

/// `CUuuid`: 16 raw bytes identifying a physical device.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CUuuid {
    pub bytes: [u8; 16],
}

/// `cuMemAlloc_v2`
pub type PfnMemAlloc = unsafe extern "C" fn(*mut CUdeviceptr, usize) -> CUresult;
/// `cuMemAllocManaged`
pub type PfnMemAllocManaged = unsafe extern "C" fn(*mut CUdeviceptr, usize, c_uint) -> CUresult;
/// `cuMemAllocAsync`
pub type PfnMemAllocAsync = unsafe extern "C" fn(*mut CUdeviceptr, usize, CUstream) -> CUresult;
/// `cuMemFree_v2`
pub type PfnMemFree = unsafe extern "C" fn(CUdeviceptr) -> CUresult;
/// `cuMemGetInfo_v2`
pub type PfnMemGetInfo = unsafe extern "C" fn(*mut usize, *mut usize) -> CUresult;
/// `cuMemGetAddressRange_v2`
pub type PfnMemGetAddressRange =
    unsafe extern "C" fn(*mut CUdeviceptr, *mut usize, CUdeviceptr) -> CUresult;
/// `cuLaunchKernel`
pub type PfnLaunchKernel = unsafe extern "C" fn(
    CUfunction,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    c_uint,
    CUstream,
    *mut *mut c_void,
    *mut *mut c_void,
) -> CUresult;
/// `cuEventCreate`
pub type PfnEventCreate = unsafe extern "C" fn(*mut CUevent, c_uint) -> CUresult;
/// `cuEventRecord`
pub type PfnEventRecord = unsafe extern "C" fn(CUevent, CUstream) -> CUresult;
/// `cuEventQuery` / `cuEventSynchronize` / `cuEventDestroy_v2`
pub type PfnEventOp = unsafe extern "C" fn(CUevent) -> CUresult;
/// `cuCtxGetDevice`
pub type PfnCtxGetDevice = unsafe extern "C" fn(*mut CUdevice) -> CUresult;
/// `cuDeviceGetUuid`
pub type PfnDeviceGetUuid = unsafe extern "C" fn(*mut CUuuid, CUdevice) -> CUresult;
/// `cuDeviceGet`
pub type PfnDeviceGet = unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult;
/// `cuDeviceTotalMem_v2`
pub type PfnDeviceTotalMem = unsafe extern "C" fn(*mut usize, CUdevice) -> CUresult;
/// `cuDriverGetVersion` / `cuDeviceGetCount`
pub type PfnIntOut = unsafe extern "C" fn(*mut c_int) -> CUresult;
/// `cuInit`
pub type PfnInit = unsafe extern "C" fn(c_uint) -> CUresult;
/// `cuGetProcAddress` (pre-12.0 signature)
pub type PfnGetProcAddress = unsafe extern "C" fn(
    *const std::ffi::c_char,
    *mut *mut c_void,
    c_int,
    cuuint64_t,
) -> CUresult;
/// `cuGetProcAddress_v2`
pub type PfnGetProcAddressV2 = unsafe extern "C" fn(
    *const std::ffi::c_char,
    *mut *mut c_void,
    c_int,
    cuuint64_t,
    *mut CUdriverProcAddressQueryResult,
) -> CUresult;

/// Human-readable name for the status codes the interposer produces or inspects.
pub fn cu_result_name(code: CUresult) -> &'static str {
    match code {
        CUDA_SUCCESS => "CUDA_SUCCESS",
        CUDA_ERROR_INVALID_VALUE => "CUDA_ERROR_INVALID_VALUE",
        CUDA_ERROR_OUT_OF_MEMORY => "CUDA_ERROR_OUT_OF_MEMORY",
        CUDA_ERROR_NOT_INITIALIZED => "CUDA_ERROR_NOT_INITIALIZED",
        CUDA_ERROR_NOT_FOUND => "CUDA_ERROR_NOT_FOUND",
        CUDA_ERROR_NOT_READY => "CUDA_ERROR_NOT_READY",
        CUDA_ERROR_UNKNOWN => "CUDA_ERROR_UNKNOWN",
        _ => "CUDA_ERROR_OTHER",
    }
}
