//! [`DriverApi`] over the real forwarding table.

use std::ffi::c_int;

use serde::Serialize;
use tracing::{info, warn};

use gvm_core::driver::{
    CompletionHandle, DeviceIdentity, DevicePtr, DriverApi, KernelLaunch, MemInfo, StreamHandle,
};
use gvm_core::MIB;
use gvm_core::error::{InterceptError, Result, check_cu};
use gvm_core::ffi_types::{
    CU_EVENT_DISABLE_TIMING, CU_MEM_ATTACH_GLOBAL, CUDA_ERROR_NOT_READY, CUDA_SUCCESS, CUdevice,
    CUdeviceptr, CUevent, CUuuid,
};

use crate::sys::{CudaForwardingTable, forwarding_table};

/// Real-driver backend.  Cheap to copy; every instance shares the
/// process-wide forwarding table.
#[derive(Clone, Copy)]
pub struct CudaDriver {
    table: &'static CudaForwardingTable,
}

impl CudaDriver {
    /// Resolve the forwarding table (first call only) and wrap it.
    pub fn load() -> Result<Self> {
        let table = forwarding_table()?;
        info!(
            library = table.library_path.as_deref().unwrap_or("<unknown>"),
            mem_alloc_async = table.mem_alloc_async.is_some(),
            get_proc_address_v2 = table.get_proc_address_v2.is_some(),
            "CUDA driver forwarding table resolved"
        );
        Ok(Self { table })
    }

    pub fn table(&self) -> &'static CudaForwardingTable {
        self.table
    }

    /// `cuInit(0)`.  Idempotent in the driver.
    pub fn init(&self) -> Result<()> {
        // SAFETY: cuInit takes only a flags word.
        check_cu(unsafe { (self.table.init)(0) }, "cuInit")
    }

    pub fn driver_version(&self) -> Result<i32> {
        let mut version: c_int = 0;
        // SAFETY: valid out pointer.
        check_cu(
            unsafe { (self.table.driver_get_version)(&mut version) },
            "cuDriverGetVersion",
        )?;
        Ok(version)
    }

    pub fn device_count(&self) -> Result<i32> {
        let mut count: c_int = 0;
        // SAFETY: valid out pointer.
        check_cu(
            unsafe { (self.table.device_get_count)(&mut count) },
            "cuDeviceGetCount",
        )?;
        Ok(count)
    }

    /// UUID and capacity of device `ordinal`.  Needs no context.
    pub fn device_info(&self, ordinal: i32) -> Result<DeviceProbe> {
        let mut device: CUdevice = 0;
        // SAFETY: valid out pointer.
        check_cu(
            unsafe { (self.table.device_get)(&mut device, ordinal) },
            "cuDeviceGet",
        )?;
        let mut uuid = CUuuid::default();
        // SAFETY: valid out pointer and a device handle returned by the driver.
        check_cu(
            unsafe { (self.table.device_get_uuid)(&mut uuid, device) },
            "cuDeviceGetUuid",
        )?;
        let mut total = 0usize;
        // SAFETY: valid out pointer and a device handle returned by the driver.
        check_cu(
            unsafe { (self.table.device_total_mem)(&mut total, device) },
            "cuDeviceTotalMem_v2",
        )?;
        Ok(DeviceProbe {
            ordinal,
            uuid: DeviceIdentity::from_uuid(uuid).to_string(),
            total_mem_mib: total as u64 / MIB,
        })
    }

    /// Gather what the host driver offers, for `gvm probe`.
    pub fn probe(&self) -> DriverProbe {
        let init = self.init();
        let driver_version = self.driver_version().ok();
        let device_count = init.as_ref().ok().and_then(|_| self.device_count().ok());
        let devices = (0..device_count.unwrap_or(0))
            .filter_map(|ordinal| match self.device_info(ordinal) {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(ordinal, error = %err, "device query failed");
                    None
                }
            })
            .collect();
        DriverProbe {
            library_path: self.table.library_path.clone(),
            driver_version: driver_version.map(format_driver_version),
            device_count,
            devices,
            init_error: init.err().map(|e| e.to_string()),
            mem_alloc_async: self.table.mem_alloc_async.is_some(),
            get_proc_address: self.table.get_proc_address.is_some(),
            get_proc_address_v2: self.table.get_proc_address_v2.is_some(),
        }
    }
}

/// `12040` → `"12.4"`.
fn format_driver_version(raw: i32) -> String {
    format!("{}.{}", raw / 1000, (raw % 1000) / 10)
}

/// Snapshot of the host driver as seen through the forwarding table.
#[derive(Clone, Debug, Serialize)]
pub struct DriverProbe {
    pub library_path: Option<String>,
    pub driver_version: Option<String>,
    pub device_count: Option<i32>,
    pub devices: Vec<DeviceProbe>,
    pub init_error: Option<String>,
    pub mem_alloc_async: bool,
    pub get_proc_address: bool,
    pub get_proc_address_v2: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeviceProbe {
    pub ordinal: i32,
    pub uuid: String,
    pub total_mem_mib: u64,
}

fn bytes_to_usize(size: u64) -> Result<usize> {
    usize::try_from(size)
        .map_err(|_| InterceptError::Config(format!("allocation size {size} exceeds usize")))
}

impl DriverApi for CudaDriver {
    fn mem_get_info(&self) -> Result<MemInfo> {
        let mut free = 0usize;
        let mut total = 0usize;
        // SAFETY: valid out pointers.
        check_cu(
            unsafe { (self.table.mem_get_info)(&mut free, &mut total) },
            "cuMemGetInfo_v2",
        )?;
        Ok(MemInfo {
            free: free as u64,
            total: total as u64,
        })
    }

    fn mem_alloc(&self, size: u64) -> Result<DevicePtr> {
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: valid out pointer.
        check_cu(
            unsafe { (self.table.mem_alloc)(&mut ptr, bytes_to_usize(size)?) },
            "cuMemAlloc_v2",
        )?;
        Ok(DevicePtr(ptr))
    }

    fn mem_alloc_managed(&self, size: u64) -> Result<DevicePtr> {
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: valid out pointer; global attach is always a legal flag.
        check_cu(
            unsafe {
                (self.table.mem_alloc_managed)(&mut ptr, bytes_to_usize(size)?, CU_MEM_ATTACH_GLOBAL)
            },
            "cuMemAllocManaged",
        )?;
        Ok(DevicePtr(ptr))
    }

    fn mem_alloc_async(&self, size: u64, stream: StreamHandle) -> Result<DevicePtr> {
        let Some(alloc_async) = self.table.mem_alloc_async else {
            return Err(InterceptError::DriverLoad(
                "cuMemAllocAsync is not exported by this driver".into(),
            ));
        };
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: valid out pointer; the stream handle came from the application.
        check_cu(
            unsafe { alloc_async(&mut ptr, bytes_to_usize(size)?, stream.0) },
            "cuMemAllocAsync",
        )?;
        Ok(DevicePtr(ptr))
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<()> {
        // SAFETY: the driver validates the address itself.
        check_cu(unsafe { (self.table.mem_free)(ptr.0) }, "cuMemFree_v2")
    }

    fn mem_get_address_range(&self, ptr: DevicePtr) -> Result<(DevicePtr, u64)> {
        let mut base: CUdeviceptr = 0;
        let mut size = 0usize;
        // SAFETY: valid out pointers.
        check_cu(
            unsafe { (self.table.mem_get_address_range)(&mut base, &mut size, ptr.0) },
            "cuMemGetAddressRange_v2",
        )?;
        Ok((DevicePtr(base), size as u64))
    }

    unsafe fn launch_kernel(&self, launch: &KernelLaunch) -> Result<()> {
        // SAFETY: caller upholds the launch contract for the parameter arrays.
        let code = unsafe {
            (self.table.launch_kernel)(
                launch.function,
                launch.grid.x,
                launch.grid.y,
                launch.grid.z,
                launch.block.x,
                launch.block.y,
                launch.block.z,
                launch.shared_mem_bytes,
                launch.stream.0,
                launch.kernel_params,
                launch.extra,
            )
        };
        check_cu(code, "cuLaunchKernel")
    }

    fn event_create(&self) -> Result<CompletionHandle> {
        let mut event: CUevent = std::ptr::null_mut();
        // SAFETY: valid out pointer.
        check_cu(
            unsafe { (self.table.event_create)(&mut event, CU_EVENT_DISABLE_TIMING) },
            "cuEventCreate",
        )?;
        Ok(CompletionHandle::from_raw(event))
    }

    fn event_record(&self, event: &CompletionHandle, stream: StreamHandle) -> Result<()> {
        // SAFETY: the event is live while borrowed.
        check_cu(
            unsafe { (self.table.event_record)(event.as_raw(), stream.0) },
            "cuEventRecord",
        )
    }

    fn event_query(&self, event: &CompletionHandle) -> Result<bool> {
        // SAFETY: the event is live while borrowed.
        match unsafe { (self.table.event_query)(event.as_raw()) } {
            CUDA_SUCCESS => Ok(true),
            CUDA_ERROR_NOT_READY => Ok(false),
            code => Err(InterceptError::Driver {
                call: "cuEventQuery",
                code,
            }),
        }
    }

    fn event_synchronize(&self, event: &CompletionHandle) -> Result<()> {
        // SAFETY: the event is live while borrowed.
        check_cu(
            unsafe { (self.table.event_synchronize)(event.as_raw()) },
            "cuEventSynchronize",
        )
    }

    fn event_destroy(&self, event: CompletionHandle) -> Result<()> {
        // SAFETY: ownership of the event moves in here; it is not used again.
        check_cu(
            unsafe { (self.table.event_destroy)(event.as_raw()) },
            "cuEventDestroy_v2",
        )
    }

    fn current_device(&self) -> Result<DeviceIdentity> {
        let mut device: CUdevice = 0;
        // SAFETY: valid out pointer.
        check_cu(
            unsafe { (self.table.ctx_get_device)(&mut device) },
            "cuCtxGetDevice",
        )?;
        let mut uuid = CUuuid::default();
        // SAFETY: valid out pointer and a device ordinal returned by the driver.
        check_cu(
            unsafe { (self.table.device_get_uuid)(&mut uuid, device) },
            "cuDeviceGetUuid",
        )?;
        Ok(DeviceIdentity::from_uuid(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_version_formats_major_minor() {
        assert_eq!(format_driver_version(12040), "12.4");
        assert_eq!(format_driver_version(11080), "11.8");
    }

    #[test]
    #[ignore = "requires NVIDIA GPU + driver on host"]
    fn probe_reports_devices() {
        let driver = CudaDriver::load().expect("libcuda should load");
        driver.init().expect("cuInit");
        let probe = driver.probe();
        assert!(probe.device_count.unwrap_or(0) > 0);
    }
}
