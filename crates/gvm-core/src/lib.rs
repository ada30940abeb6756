#![doc = include_str!("../README.md")]

pub mod arbiter;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod ffi_types;

/// Bytes per MiB, used for diagnostics and config conversions.
pub const MIB: u64 = 1024 * 1024;
