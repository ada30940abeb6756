#![doc = include_str!("../README.md")]

pub mod driver;
pub mod sys;

pub use driver::{CudaDriver, DeviceProbe, DriverProbe};
