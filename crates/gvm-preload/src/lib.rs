//! `LD_PRELOAD` library exporting the intercepted CUDA driver entry points.
//!
//! The first intercepted call bootstraps the [`runtime::Runtime`]: it loads
//! the real driver, reads the `GVM_*` environment and starts the completion
//! monitor. If interception cannot be set up, calls are forwarded unchanged.

pub mod exports;
pub mod runtime;

pub use runtime::{Runtime, runtime};
