//! Lazy, process-wide bootstrap of the interceptor.

use std::ffi::c_int;
use std::sync::{Arc, OnceLock};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gvm_core::arbiter::{Arbiter, ArbiterLocator, LogArbiter, NoArbiter};
use gvm_core::config::InterceptConfig;
use gvm_core::driver::{DeviceIdentity, DevicePtr, DriverApi, KernelLaunch, StreamHandle};
use gvm_core::error::{InterceptError, Result};
use gvm_cuda::CudaDriver;
use gvm_intercept::Interceptor;

pub const ENV_LOG: &str = "GVM_LOG";
pub const ENV_ARBITER: &str = "GVM_ARBITER";

unsafe extern "C" {
    fn atexit(callback: extern "C" fn()) -> c_int;
}

/// What the exported entry points forward to.
pub enum Runtime {
    /// Full interception.
    Active(Interceptor),
    /// The real driver loaded but the interceptor could not be set up;
    /// calls go straight through.
    Passthrough(CudaDriver),
    /// No driver to forward to.
    Unavailable(String),
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(bootstrap)
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    // The application may already own the global subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn arbiter_locator() -> Arc<dyn ArbiterLocator> {
    match std::env::var(ENV_ARBITER).as_deref() {
        Ok("none") | Ok("off") => Arc::new(NoArbiter),
        Ok("log") | Err(_) => log_locator(),
        Ok(other) => {
            warn!(value = other, "unknown {ENV_ARBITER}; using log arbiter");
            log_locator()
        }
    }
}

fn log_locator() -> Arc<dyn ArbiterLocator> {
    let arbiter = LogArbiter::new();
    Arc::new(move |_device: &DeviceIdentity| -> Option<Arc<dyn Arbiter>> {
        Some(arbiter.clone() as Arc<dyn Arbiter>)
    })
}

fn bootstrap() -> Runtime {
    init_logging();

    let driver = match CudaDriver::load() {
        Ok(driver) => driver,
        Err(err) => {
            error!(error = %err, code = err.error_code(), "CUDA driver unavailable");
            return Runtime::Unavailable(err.to_string());
        }
    };

    let interceptor = InterceptConfig::from_env().and_then(|config| {
        let interceptor = Interceptor::new(config, Arc::new(driver), arbiter_locator())?;
        interceptor.start()?;
        Ok(interceptor)
    });
    match interceptor {
        Ok(interceptor) => {
            // SAFETY: registering a plain extern "C" callback.
            if unsafe { atexit(on_exit) } != 0 {
                warn!("atexit registration failed; ring will not be drained at exit");
            }
            info!("GVM interception active");
            Runtime::Active(interceptor)
        }
        Err(err) => {
            error!(
                error = %err,
                code = err.error_code(),
                "interceptor setup failed; forwarding without interception"
            );
            Runtime::Passthrough(driver)
        }
    }
}

extern "C" fn on_exit() {
    let Some(Runtime::Active(interceptor)) = RUNTIME.get() else {
        return;
    };
    match interceptor.stop() {
        Ok(Some(report)) => {
            let stats = interceptor.stats();
            info!(
                retired = report.retired,
                drained = report.drained,
                submitted = stats.launches.submitted,
                allocated_bytes = stats.admission.allocated_bytes,
                "GVM interception stopped"
            );
        }
        Ok(None) => warn!("completion monitor detached at exit"),
        Err(err) => warn!(error = %err, "failed to stop interceptor at exit"),
    }
}

impl Runtime {
    fn unavailable(reason: &str) -> InterceptError {
        InterceptError::DriverLoad(reason.to_string())
    }

    pub fn mem_alloc(&self, size: u64) -> Result<DevicePtr> {
        match self {
            Self::Active(interceptor) => interceptor.mem_alloc(size),
            Self::Passthrough(driver) => driver.mem_alloc(size),
            Self::Unavailable(reason) => Err(Self::unavailable(reason)),
        }
    }

    pub fn mem_alloc_async(&self, size: u64, stream: StreamHandle) -> Result<DevicePtr> {
        match self {
            Self::Active(interceptor) => interceptor.mem_alloc_async(size, stream),
            Self::Passthrough(driver) => driver.mem_alloc_async(size, stream),
            Self::Unavailable(reason) => Err(Self::unavailable(reason)),
        }
    }

    pub fn mem_free(&self, ptr: DevicePtr) -> Result<()> {
        match self {
            Self::Active(interceptor) => interceptor.mem_free(ptr),
            Self::Passthrough(driver) => driver.mem_free(ptr),
            Self::Unavailable(reason) => Err(Self::unavailable(reason)),
        }
    }

    /// # Safety
    /// `launch` must satisfy the driver's launch contract.
    pub unsafe fn launch_kernel(&self, launch: &KernelLaunch) -> Result<()> {
        match self {
            // SAFETY: forwarded from this function's contract.
            Self::Active(interceptor) => unsafe { interceptor.launch_kernel(launch) },
            // SAFETY: forwarded from this function's contract.
            Self::Passthrough(driver) => unsafe { driver.launch_kernel(launch) },
            Self::Unavailable(reason) => Err(Self::unavailable(reason)),
        }
    }
}
