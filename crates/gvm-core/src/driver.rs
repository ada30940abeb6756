//! The seam between the interposer and whatever executes device work.
//!
//! [`DriverApi`] is implemented by the real forwarding table in `gvm-cuda` and
//! by the in-memory simulator in `gvm-intercept::sim`.  Every method mirrors a
//! single driver entry point and reports failures as
//! [`InterceptError::Driver`](crate::error::InterceptError::Driver) carrying
//! the driver's own status code, so callers can hand it back unchanged.

use std::ffi::{c_uint, c_void};
use std::fmt;

use crate::error::Result;
use crate::ffi_types::{CUdeviceptr, CUevent, CUfunction, CUstream, CUuuid};

/// Device virtual address returned by an allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub CUdeviceptr);

/// Opaque asynchronous completion token (a driver event).
///
/// Ownership follows the ring slot that currently holds it; the handle is never
/// copied out of the ring protocol, hence no `Clone`.
#[derive(Debug, PartialEq, Eq)]
pub struct CompletionHandle(CUevent);

impl CompletionHandle {
    /// Wrap a raw event handle produced by the driver.
    pub fn from_raw(raw: CUevent) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_raw(&self) -> CUevent {
        self.0
    }
}

// SAFETY: driver event handles are process-global objects usable from any thread.
unsafe impl Send for CompletionHandle {}
unsafe impl Sync for CompletionHandle {}

/// Stream an operation was submitted on.  Null is the legacy default stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamHandle(pub CUstream);

impl StreamHandle {
    pub const DEFAULT: StreamHandle = StreamHandle(std::ptr::null_mut());
}

// SAFETY: stream handles are process-global driver objects usable from any thread.
unsafe impl Send for StreamHandle {}
unsafe impl Sync for StreamHandle {}

/// Identity of the device an event is attributed to when reporting to the
/// arbiter.  Wraps the device UUID.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(pub [u8; 16]);

impl DeviceIdentity {
    /// Placeholder used when the current device cannot be queried.
    pub const UNKNOWN: DeviceIdentity = DeviceIdentity([0; 16]);

    pub fn from_uuid(uuid: CUuuid) -> Self {
        Self(uuid.bytes)
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Display for DeviceIdentity {
    /// Formats like `nvidia-smi -L`: `GPU-xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "GPU-")?;
        for (i, byte) in b.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceIdentity({self})")
    }
}

/// Free/total device memory as reported by the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub free: u64,
    pub total: u64,
}

/// Grid/block dimensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dim3 {
    pub x: c_uint,
    pub y: c_uint,
    pub z: c_uint,
}

/// Arguments of a kernel launch, forwarded verbatim.
#[derive(Clone, Copy, Debug)]
pub struct KernelLaunch {
    pub function: CUfunction,
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: c_uint,
    pub stream: StreamHandle,
    pub kernel_params: *mut *mut c_void,
    pub extra: *mut *mut c_void,
}

impl KernelLaunch {
    /// A launch with no function or parameters.  The simulator accepts it;
    /// the real driver rejects it.
    pub fn empty(stream: StreamHandle) -> Self {
        Self {
            function: std::ptr::null_mut(),
            grid: Dim3 { x: 1, y: 1, z: 1 },
            block: Dim3 { x: 1, y: 1, z: 1 },
            shared_mem_bytes: 0,
            stream,
            kernel_params: std::ptr::null_mut(),
            extra: std::ptr::null_mut(),
        }
    }
}

/// The driver entry points the interposer depends on.
pub trait DriverApi: Send + Sync {
    /// `cuMemGetInfo_v2`.
    fn mem_get_info(&self) -> Result<MemInfo>;

    /// `cuMemAlloc_v2`.
    fn mem_alloc(&self, size: u64) -> Result<DevicePtr>;

    /// `cuMemAllocManaged` with global attach.
    fn mem_alloc_managed(&self, size: u64) -> Result<DevicePtr>;

    /// `cuMemAllocAsync`.
    fn mem_alloc_async(&self, size: u64, stream: StreamHandle) -> Result<DevicePtr>;

    /// `cuMemFree_v2`.
    fn mem_free(&self, ptr: DevicePtr) -> Result<()>;

    /// `cuMemGetAddressRange_v2`: base address and size of the allocation
    /// containing `ptr`.
    fn mem_get_address_range(&self, ptr: DevicePtr) -> Result<(DevicePtr, u64)>;

    /// `cuLaunchKernel`.
    ///
    /// # Safety
    /// `launch.kernel_params`/`launch.extra` must satisfy the driver's launch
    /// contract for `launch.function`.
    unsafe fn launch_kernel(&self, launch: &KernelLaunch) -> Result<()>;

    /// `cuEventCreate` (completion-only, timing disabled).
    fn event_create(&self) -> Result<CompletionHandle>;

    /// `cuEventRecord`.
    fn event_record(&self, event: &CompletionHandle, stream: StreamHandle) -> Result<()>;

    /// `cuEventQuery`: `Ok(true)` once every operation captured by the event
    /// has completed, `Ok(false)` while still pending.
    fn event_query(&self, event: &CompletionHandle) -> Result<bool>;

    /// `cuEventSynchronize`.
    fn event_synchronize(&self, event: &CompletionHandle) -> Result<()>;

    /// `cuEventDestroy_v2`.
    fn event_destroy(&self, event: CompletionHandle) -> Result<()>;

    /// Identity of the device bound to the calling thread's current context.
    fn current_device(&self) -> Result<DeviceIdentity>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_identity_formats_like_nvidia_smi() {
        let id = DeviceIdentity([
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ]);
        assert_eq!(id.to_string(), "GPU-12345678-9abc-def0-0123-456789abcdef");
        assert!(!id.is_unknown());
        assert!(DeviceIdentity::default().is_unknown());
    }
}
