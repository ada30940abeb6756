//! Which driver symbols are wrapped.
//!
//! When the driver (or the runtime on top of it) resolves an entry point by
//! name, a [`HookedSymbol`] name resolves to the interposer's wrapper and every
//! other name is left to the driver's own resolution.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// First driver API version whose `cuGetProcAddress` hands out the
/// five-argument `cuGetProcAddress_v2`.
pub const GET_PROC_ADDRESS_V2_VERSION: i32 = 12_000;

/// The wrapped entry points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum HookedSymbol {
    MemAlloc,
    MemAllocV2,
    MemAllocAsync,
    MemFree,
    MemFreeV2,
    LaunchKernel,
    GetProcAddress,
    GetProcAddressV2,
}

impl HookedSymbol {
    pub const ALL: [HookedSymbol; 8] = [
        HookedSymbol::MemAlloc,
        HookedSymbol::MemAllocV2,
        HookedSymbol::MemAllocAsync,
        HookedSymbol::MemFree,
        HookedSymbol::MemFreeV2,
        HookedSymbol::LaunchKernel,
        HookedSymbol::GetProcAddress,
        HookedSymbol::GetProcAddressV2,
    ];

    /// Exported symbol name.
    pub fn name(self) -> &'static str {
        match self {
            Self::MemAlloc => "cuMemAlloc",
            Self::MemAllocV2 => "cuMemAlloc_v2",
            Self::MemAllocAsync => "cuMemAllocAsync",
            Self::MemFree => "cuMemFree",
            Self::MemFreeV2 => "cuMemFree_v2",
            Self::LaunchKernel => "cuLaunchKernel",
            Self::GetProcAddress => "cuGetProcAddress",
            Self::GetProcAddressV2 => "cuGetProcAddress_v2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|sym| sym.name() == name)
    }

    /// The variant a versioned lookup of this symbol's base name resolves to.
    ///
    /// `cuGetProcAddress` is queried by base name; from 12.0 on the driver
    /// answers with the `_v2` signature, so the wrapper must match it.
    pub fn for_version(self, cuda_version: i32) -> Self {
        match self {
            Self::GetProcAddress if cuda_version >= GET_PROC_ADDRESS_V2_VERSION => {
                Self::GetProcAddressV2
            }
            other => other,
        }
    }
}

/// Outcome of resolving a symbol name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Hand out the interposer's wrapper.
    Wrapped(HookedSymbol),
    /// Keep whatever the driver resolved.
    Forward,
}

/// Name-based resolution with counters for `gvm` diagnostics.
#[derive(Debug, Default)]
pub struct Dispatcher {
    wrapped: AtomicU64,
    forwarded: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub wrapped: u64,
    pub forwarded: u64,
}

impl Dispatcher {
    pub const fn new() -> Self {
        Self {
            wrapped: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
        }
    }

    pub fn resolve(&self, name: &str) -> Resolution {
        match HookedSymbol::from_name(name) {
            Some(sym) => {
                self.wrapped.fetch_add(1, Ordering::Relaxed);
                Resolution::Wrapped(sym)
            }
            None => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                Resolution::Forward
            }
        }
    }

    /// [`resolve`](Self::resolve) for a lookup made on behalf of a given
    /// driver API version.
    pub fn resolve_for_version(&self, name: &str, cuda_version: i32) -> Resolution {
        match self.resolve(name) {
            Resolution::Wrapped(sym) => Resolution::Wrapped(sym.for_version(cuda_version)),
            Resolution::Forward => Resolution::Forward,
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            wrapped: self.wrapped.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
        }
    }
}
