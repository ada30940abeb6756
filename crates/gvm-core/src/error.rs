//! Typed error hierarchy for the interposer.
//!
//! Uses `thiserror` for library-grade errors.  Wrapped entry points turn these
//! back into driver status codes with [`InterceptError::cu_result`], so the
//! application only ever sees the driver's own contract plus the added
//! out-of-memory admission case.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`InterceptError::error_code`]
//! for structured telemetry without string parsing.

use crate::ffi_types::{
    CUDA_ERROR_OUT_OF_MEMORY, CUDA_ERROR_UNKNOWN, CUresult, cu_result_name,
};

/// All errors originating from the interposer.
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    // ── Driver ────────────────────────────────────────────────────────
    #[error("{call} failed with {} ({code})", code_name(.code))]
    Driver { call: &'static str, code: CUresult },

    #[error("Failed to load the CUDA driver: {0}")]
    DriverLoad(String),

    #[error("Refusing forwarding target: {0}")]
    SymbolGuard(String),

    // ── Admission ─────────────────────────────────────────────────────
    #[error(
        "Out of memory: requested {requested} bytes with {allocated} of {total} bytes allocated"
    )]
    OutOfMemory {
        requested: u64,
        allocated: u64,
        total: u64,
    },

    // ── Ring buffer ───────────────────────────────────────────────────
    #[error("Completion ring is full")]
    RingFull,

    // ── Arbiter ───────────────────────────────────────────────────────
    #[error("Arbiter report failed: {0}")]
    Arbiter(String),

    // ── Configuration ─────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),

    // ── Invariants ────────────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // ── Lifecycle ─────────────────────────────────────────────────────
    #[error("Interceptor already started")]
    AlreadyStarted,

    #[error("Interceptor is not running")]
    NotRunning,

    #[error("Failed to spawn monitor thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl InterceptError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: driver
    /// - 2xx: admission
    /// - 3xx: ring buffer
    /// - 4xx: arbiter
    /// - 5xx: configuration
    /// - 6xx: invariants
    /// - 7xx: lifecycle
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Driver { .. } => 100,
            Self::DriverLoad(_) => 101,
            Self::SymbolGuard(_) => 102,
            Self::OutOfMemory { .. } => 200,
            Self::RingFull => 300,
            Self::Arbiter(_) => 400,
            Self::Config(_) => 500,
            Self::InvariantViolation(_) => 600,
            Self::AlreadyStarted => 700,
            Self::NotRunning => 701,
            Self::Spawn(_) => 702,
        }
    }

    /// Driver status code handed back to the application for this error.
    ///
    /// Driver failures pass through unchanged; admission rejections become
    /// `CUDA_ERROR_OUT_OF_MEMORY`.
    pub fn cu_result(&self) -> CUresult {
        match self {
            Self::Driver { code, .. } => *code,
            Self::OutOfMemory { .. } => CUDA_ERROR_OUT_OF_MEMORY,
            _ => CUDA_ERROR_UNKNOWN,
        }
    }

    /// Whether tracking can continue after logging this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RingFull | Self::Arbiter(_) | Self::OutOfMemory { .. }
        )
    }
}

fn code_name(code: &CUresult) -> &'static str {
    cu_result_name(*code)
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, InterceptError>;

/// Turn a raw driver status into a `Result`.
#[inline]
pub fn check_cu(code: CUresult, call: &'static str) -> Result<()> {
    if code == crate::ffi_types::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(InterceptError::Driver { call, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi_types::{CUDA_ERROR_INVALID_VALUE, CUDA_SUCCESS};

    #[test]
    fn driver_errors_pass_their_code_through() {
        let err = InterceptError::Driver {
            call: "cuMemAlloc_v2",
            code: CUDA_ERROR_INVALID_VALUE,
        };
        assert_eq!(err.cu_result(), CUDA_ERROR_INVALID_VALUE);
        assert!(err.to_string().contains("CUDA_ERROR_INVALID_VALUE"));
    }

    #[test]
    fn admission_rejection_maps_to_out_of_memory() {
        let err = InterceptError::OutOfMemory {
            requested: 500,
            allocated: 600,
            total: 1024,
        };
        assert_eq!(err.cu_result(), CUDA_ERROR_OUT_OF_MEMORY);
        assert_eq!(err.error_code(), 200);
        assert!(err.is_recoverable());
    }

    #[test]
    fn check_cu_accepts_success_only() {
        assert!(check_cu(CUDA_SUCCESS, "cuInit").is_ok());
        let err = check_cu(CUDA_ERROR_OUT_OF_MEMORY, "cuMemAlloc_v2")
            .expect_err("non-zero status must fail");
        assert_eq!(err.cu_result(), CUDA_ERROR_OUT_OF_MEMORY);
    }

    #[test]
    fn internal_faults_surface_as_unknown() {
        assert_eq!(InterceptError::RingFull.cu_result(), CUDA_ERROR_UNKNOWN);
        assert!(!InterceptError::InvariantViolation("x".into()).is_recoverable());
    }
}
