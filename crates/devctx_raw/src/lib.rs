//! Low level interface to a device platform driver.
//!
//! This crate is the equivalent of a `-sys` crate: it describes the native driver ABI in terms of
//! opaque handles, numeric codes and status values, without any attempt at safety or ownership.
//! Every [`Driver`] method returns a [`Status`] and writes its results through `&mut`
//! out-parameters, mirroring the C entry points it stands in for. The safe wrapper lives in the
//! `devctx` crate.
//!
//! Attribute calls (`ctx_get_*`/`ctx_set_*` without a context argument) act on the context that
//! is current on the *calling thread*, exactly like the native driver does.
//!
//! A complete software implementation of the driver is provided in [`sim`], which is what tests
//! and machines without devices use.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod sim;

use std::fmt;

/// Ordinal of a device as assigned by the platform.
pub type RawDevice = i32;

/// Opaque native context handle. The null handle means "no context".
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct RawContext(u64);

impl RawContext {
    /// The null handle, returned by the driver when no context is current.
    pub const NULL: RawContext = RawContext(0);

    pub const fn from_raw(raw: u64) -> Self {
        RawContext(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RawContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for RawContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Status code returned by every driver entry point.
///
/// Codes are numbered like the CUDA driver's `CUresult` so that diagnostics read the same.
#[repr(u32)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Status {
    Success = 0,
    InvalidValue = 1,
    OutOfMemory = 2,
    NotInitialized = 3,
    Deinitialized = 4,
    DeviceUnavailable = 46,
    NoDevice = 100,
    InvalidDevice = 101,
    InvalidContext = 201,
    ContextAlreadyCurrent = 202,
    UnsupportedLimit = 215,
    ContextAlreadyInUse = 216,
    InvalidHandle = 400,
    PrimaryContextActive = 708,
    ContextIsDestroyed = 709,
    NotPermitted = 800,
    NotSupported = 801,
    Unknown = 999,
}

impl Status {
    /// The numeric value of this status.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Short human readable explanation, the equivalent of `cuGetErrorString`.
    pub fn description(self) -> &'static str {
        match self {
            Status::Success => "no error",
            Status::InvalidValue => "invalid argument",
            Status::OutOfMemory => "out of memory",
            Status::NotInitialized => "initialization error",
            Status::Deinitialized => "driver shutting down",
            Status::DeviceUnavailable => "device unavailable",
            Status::NoDevice => "no device is detected",
            Status::InvalidDevice => "invalid device ordinal",
            Status::InvalidContext => "invalid device context",
            Status::ContextAlreadyCurrent => "context already current",
            Status::UnsupportedLimit => "limit is not supported on this architecture",
            Status::ContextAlreadyInUse => "exclusive-thread device already in use by a different thread",
            Status::InvalidHandle => "invalid resource handle",
            Status::PrimaryContextActive => "primary context active",
            Status::ContextIsDestroyed => "context is destroyed",
            Status::NotPermitted => "operation not permitted",
            Status::NotSupported => "operation not supported",
            Status::Unknown => "unknown error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.description(), self.code())
    }
}

/// Stream priority reported as the least priority when a device does not bound it.
pub const UNBOUNDED_PRIORITY: i32 = -1;

/// Raw cache configuration codes.
pub mod cache_config {
    pub const PREFER_NONE: u32 = 0;
    pub const PREFER_SHARED: u32 = 1;
    pub const PREFER_L1: u32 = 2;
    pub const PREFER_EQUAL: u32 = 3;
}

/// Raw shared memory bank size codes.
pub mod shared_config {
    pub const DEFAULT_BANK_SIZE: u32 = 0;
    pub const FOUR_BYTE_BANK_SIZE: u32 = 1;
    pub const EIGHT_BYTE_BANK_SIZE: u32 = 2;
}

/// Raw resource limit codes.
pub mod limit {
    pub const STACK_SIZE: u32 = 0;
    pub const PRINTF_FIFO_SIZE: u32 = 1;
    pub const MALLOC_HEAP_SIZE: u32 = 2;
    pub const DEV_RUNTIME_SYNC_DEPTH: u32 = 3;
    pub const DEV_RUNTIME_PENDING_LAUNCH_COUNT: u32 = 4;
    pub const MAX_L2_FETCH_GRANULARITY: u32 = 5;

    /// Number of limit codes understood by the driver.
    pub const COUNT: usize = 6;
}

/// Raw context creation flag bits.
pub mod ctx_flags {
    pub const SCHED_AUTO: u32 = 0x00;
    pub const SCHED_SPIN: u32 = 0x01;
    pub const SCHED_YIELD: u32 = 0x02;
    pub const SCHED_BLOCKING_SYNC: u32 = 0x04;
    pub const SCHED_MASK: u32 = 0x07;
    pub const MAP_HOST: u32 = 0x08;
    pub const LMEM_RESIZE_TO_MAX: u32 = 0x10;
    pub const FLAGS_MASK: u32 = 0x1f;
}

/// The native driver entry points.
///
/// Implementations must keep the notion of "current context" per calling OS thread.
pub trait Driver: Send + Sync + fmt::Debug {
    fn init(&self, flags: u32) -> Status;
    fn driver_get_version(&self, version: &mut i32) -> Status;

    fn device_get_count(&self, count: &mut i32) -> Status;
    fn device_get(&self, device: &mut RawDevice, ordinal: i32) -> Status;
    fn device_get_name(&self, name: &mut String, device: RawDevice) -> Status;

    fn device_primary_ctx_retain(&self, ctx: &mut RawContext, device: RawDevice) -> Status;
    fn device_primary_ctx_release(&self, device: RawDevice) -> Status;
    fn device_primary_ctx_reset(&self, device: RawDevice) -> Status;
    fn device_primary_ctx_set_flags(&self, device: RawDevice, flags: u32) -> Status;
    fn device_primary_ctx_get_state(
        &self,
        device: RawDevice,
        flags: &mut u32,
        active: &mut bool,
    ) -> Status;

    fn ctx_create(&self, ctx: &mut RawContext, flags: u32, device: RawDevice) -> Status;
    fn ctx_destroy(&self, ctx: RawContext) -> Status;
    fn ctx_get_current(&self, ctx: &mut RawContext) -> Status;
    /// Binds `ctx` to the calling thread; [`RawContext::NULL`] unbinds.
    fn ctx_set_current(&self, ctx: RawContext) -> Status;
    fn ctx_get_api_version(&self, ctx: RawContext, version: &mut u32) -> Status;

    fn ctx_get_device(&self, device: &mut RawDevice) -> Status;
    fn ctx_get_flags(&self, flags: &mut u32) -> Status;
    fn ctx_set_flags(&self, flags: u32) -> Status;
    fn ctx_get_cache_config(&self, config: &mut u32) -> Status;
    fn ctx_set_cache_config(&self, config: u32) -> Status;
    fn ctx_get_shared_mem_config(&self, config: &mut u32) -> Status;
    fn ctx_set_shared_mem_config(&self, config: u32) -> Status;
    fn ctx_get_limit(&self, value: &mut usize, limit: u32) -> Status;
    fn ctx_set_limit(&self, limit: u32, value: usize) -> Status;
    fn ctx_get_stream_priority_range(&self, least: &mut i32, greatest: &mut i32) -> Status;
    fn ctx_synchronize(&self) -> Status;
}
