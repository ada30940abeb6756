#![doc = include_str!("../README.md")]

pub mod admission;
pub mod dispatch;
pub mod interceptor;
pub mod monitor;
pub mod sim;
pub mod tracker;

pub use admission::{AdmissionController, AdmissionStats};
pub use dispatch::{Dispatcher, HookedSymbol, Resolution};
pub use interceptor::{InterceptStats, Interceptor};
pub use monitor::{CompletionMonitor, MonitorReport};
pub use tracker::{LaunchRecord, LaunchStats, LaunchTracker, RecordKind};
