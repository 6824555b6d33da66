//! Device context handling.
//!
//! # Contexts
//!
//! A [`Context`] is a cheap, cloneable handle to a native context. Every clone shares ownership
//! of the native object: the primary context of a device is released, and an explicitly created
//! context destroyed, exactly once, when the last clone is dropped. Two `Context` values compare
//! equal iff they wrap the same native handle.
//!
//! # The context stack
//!
//! The driver keeps one current context per OS thread. devctx mirrors it with a per-thread
//! [`ContextStack`]: pushing makes a context current, popping makes the previous entry current
//! again (or nothing, once the stack is empty). The stack is only ever changed after the driver
//! accepted the change, so the top entry and the driver's current context never disagree.
//!
//! [`CurrentContext`] exposes the calling thread's stack. A separately owned [`ContextStack`] can
//! be used instead where an explicit, injectable stack is more convenient, for example in tests.
//! Use one or the other on a given thread, not both.
//!
//! # Scoped overrides
//!
//! [`ScopedOverride`] pushes a context when created and pops it again when dropped, whichever way
//! the scope is left:
//!
//! ```
//! # use devctx::prelude::*;
//! # use devctx::sys::sim::SimDriver;
//! # use std::sync::Arc;
//! # use std::error::Error;
//! # fn main() -> Result<(), Box<dyn Error>> {
//! # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
//! let device = platform.get_device(0)?;
//! let outer = device.create_context(ContextFlags::MAP_HOST)?;
//! let inner = device.create_context(ContextFlags::MAP_HOST)?;
//!
//! CurrentContext::push(&outer)?;
//! {
//!     let _guard = ScopedOverride::new(&inner)?;
//!     assert_eq!(CurrentContext::get_current()?, inner);
//! }
//! assert_eq!(CurrentContext::get_current()?, outer);
//! # CurrentContext::pop()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Attributes
//!
//! Cache preference, shared memory bank size, stream priorities, resource limits and context
//! flags are read and written through the current context. The accessors on [`Context`] make
//! their context current for the duration of the driver call when it isn't already, and leave
//! the stack exactly as they found it.

mod attributes;
mod scoped;
mod stack;

pub use scoped::{ScopedOverride, StackHandle, ThreadStack};
pub use stack::{ContextStack, CurrentContext};

use crate::device::Device;
use crate::error::{DevResult, DropResult, ToResult};
use crate::sys::{self, Driver, RawContext, RawDevice};
use crate::ApiVersion;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{trace, warn};

/// This enumeration represents configuration settings for devices which share hardware resources
/// between L1 cache and shared memory.
///
/// Note that this is only a preference - the driver will use the requested configuration if
/// possible, but it is free to choose a different configuration if required to execute functions.
#[repr(u32)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum CacheConfig {
    /// No preference for shared memory or L1 (default)
    PreferNone = sys::cache_config::PREFER_NONE,
    /// Prefer larger shared memory and smaller L1 cache
    PreferShared = sys::cache_config::PREFER_SHARED,
    /// Prefer larger L1 cache and smaller shared memory
    PreferL1 = sys::cache_config::PREFER_L1,
    /// Prefer equal-sized L1 cache and shared memory
    PreferEqual = sys::cache_config::PREFER_EQUAL,
}

impl CacheConfig {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            sys::cache_config::PREFER_NONE => Some(CacheConfig::PreferNone),
            sys::cache_config::PREFER_SHARED => Some(CacheConfig::PreferShared),
            sys::cache_config::PREFER_L1 => Some(CacheConfig::PreferL1),
            sys::cache_config::PREFER_EQUAL => Some(CacheConfig::PreferEqual),
            _ => None,
        }
    }
}

/// This enumeration represents the limited resources which can be accessed through
/// [`Context::resource_limit`] and [`Context::set_resource_limit`].
#[repr(u32)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum ResourceLimit {
    /// The size in bytes of each GPU thread stack
    StackSize = sys::limit::STACK_SIZE,
    /// The size in bytes of the FIFO used by the `printf()` device system call.
    PrintfFifoSize = sys::limit::PRINTF_FIFO_SIZE,
    /// The size in bytes of the heap used by the `malloc()` and `free()` device system calls.
    MallocHeapSize = sys::limit::MALLOC_HEAP_SIZE,
    /// The maximum nesting depth of a grid at which a thread can safely wait on child grids.
    DeviceRuntimeSynchronizeDepth = sys::limit::DEV_RUNTIME_SYNC_DEPTH,
    /// The maximum number of outstanding device runtime launches.
    DeviceRuntimePendingLaunchCount = sys::limit::DEV_RUNTIME_PENDING_LAUNCH_COUNT,
    /// L2 cache fetch granularity
    MaxL2FetchGranularity = sys::limit::MAX_L2_FETCH_GRANULARITY,
}

/// This enumeration represents the options for configuring the shared memory bank size.
#[repr(u32)]
#[non_exhaustive]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum SharedMemoryConfig {
    /// Set shared-memory bank size to the default.
    DefaultBankSize = sys::shared_config::DEFAULT_BANK_SIZE,
    /// Set shared-memory bank width to four bytes
    FourByteBankSize = sys::shared_config::FOUR_BYTE_BANK_SIZE,
    /// Set shared-memory bank width to eight bytes
    EightByteBankSize = sys::shared_config::EIGHT_BYTE_BANK_SIZE,
}

impl SharedMemoryConfig {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            sys::shared_config::DEFAULT_BANK_SIZE => Some(SharedMemoryConfig::DefaultBankSize),
            sys::shared_config::FOUR_BYTE_BANK_SIZE => Some(SharedMemoryConfig::FourByteBankSize),
            sys::shared_config::EIGHT_BYTE_BANK_SIZE => Some(SharedMemoryConfig::EightByteBankSize),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Bit flags for initializing a context.
    ///
    /// If you're not sure which flags to use, `MAP_HOST | SCHED_AUTO` is a good default.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u32 {
        /// Instructs the driver to actively spin when waiting for results from the device.
        const SCHED_SPIN = sys::ctx_flags::SCHED_SPIN;

        /// Instructs the driver to yield its thread when waiting for results from the device.
        const SCHED_YIELD = sys::ctx_flags::SCHED_YIELD;

        /// Instructs the driver to block the CPU thread on a synchronization primitive when
        /// waiting for the device to finish work.
        const SCHED_BLOCKING_SYNC = sys::ctx_flags::SCHED_BLOCKING_SYNC;

        /// Lets the driver choose between spinning and yielding. This is the default.
        const SCHED_AUTO = sys::ctx_flags::SCHED_AUTO;

        /// Support mapped pinned host allocations.
        const MAP_HOST = sys::ctx_flags::MAP_HOST;

        /// Don't reduce local memory after resizing local memory for a kernel.
        const LMEM_RESIZE_TO_MAX = sys::ctx_flags::LMEM_RESIZE_TO_MAX;
    }
}

/// How a context's host thread waits for the device. Stored in the scheduling bits of
/// [`ContextFlags`].
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum SchedulingPolicy {
    /// Let the platform choose based on the number of active contexts and processors.
    Auto,
    /// Actively spin while waiting for results.
    Spin,
    /// Yield the host thread while waiting for results.
    Yield,
    /// Block the host thread on a synchronization primitive.
    BlockingSync,
}

impl SchedulingPolicy {
    pub(crate) fn from_flags(flags: ContextFlags) -> Self {
        match flags.bits() & sys::ctx_flags::SCHED_MASK {
            sys::ctx_flags::SCHED_SPIN => SchedulingPolicy::Spin,
            sys::ctx_flags::SCHED_YIELD => SchedulingPolicy::Yield,
            sys::ctx_flags::SCHED_BLOCKING_SYNC => SchedulingPolicy::BlockingSync,
            _ => SchedulingPolicy::Auto,
        }
    }

    pub(crate) fn apply(self, flags: ContextFlags) -> ContextFlags {
        let cleared = flags.bits() & !sys::ctx_flags::SCHED_MASK;
        let sched = match self {
            SchedulingPolicy::Auto => sys::ctx_flags::SCHED_AUTO,
            SchedulingPolicy::Spin => sys::ctx_flags::SCHED_SPIN,
            SchedulingPolicy::Yield => sys::ctx_flags::SCHED_YIELD,
            SchedulingPolicy::BlockingSync => sys::ctx_flags::SCHED_BLOCKING_SYNC,
        };
        ContextFlags::from_bits_truncate(cleared | sched)
    }
}

/// Struct representing a range of stream priorities.
///
/// By convention, lower numbers imply greater priorities. The range of meaningful stream
/// priorities is given by `[greatest, least]` - that is (numerically), `greatest <= least`,
/// unless `least` is [`StreamPriorityRange::UNBOUNDED`].
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct StreamPriorityRange {
    /// The least stream priority
    pub least: i32,
    /// The greatest stream priority
    pub greatest: i32,
}

impl StreamPriorityRange {
    /// Reported as `least` when the platform puts no bound on the lowest priority.
    pub const UNBOUNDED: i32 = sys::UNBOUNDED_PRIORITY;

    /// `(highest_priority, lowest_priority)`, in the platform's numbering.
    pub fn as_pair(&self) -> (i32, i32) {
        (self.greatest, self.least)
    }

    /// Whether `least` is [`StreamPriorityRange::UNBOUNDED`].
    pub fn is_unbounded(&self) -> bool {
        self.least == Self::UNBOUNDED
    }

    /// Whether the range respects `greatest <= least`. Unbounded ranges always do.
    pub fn is_well_ordered(&self) -> bool {
        self.is_unbounded() || self.greatest <= self.least
    }
}

struct ContextInner {
    handle: RawContext,
    device: RawDevice,
    primary: bool,
    driver: Arc<dyn Driver>,
}

impl ContextInner {
    fn release(&self) -> DevResult<()> {
        if self.primary {
            self.driver.device_primary_ctx_release(self.device).to_result()
        } else {
            self.driver.ctx_destroy(self.handle).to_result()
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.handle.is_null() {
            return;
        }
        if let Err(e) = self.release() {
            warn!(
                handle = %self.handle,
                device = self.device,
                primary = self.primary,
                error = %e,
                "failed to release context"
            );
        }
    }
}

/// Rebinds a previously current handle when dropped, unless [`finish`](Self::finish) did already.
struct RestoreCurrent<'a> {
    driver: &'a dyn Driver,
    previous: RawContext,
    armed: bool,
}

impl RestoreCurrent<'_> {
    fn finish(mut self) -> DevResult<()> {
        self.armed = false;
        self.driver.ctx_set_current(self.previous).to_result()
    }
}

impl Drop for RestoreCurrent<'_> {
    fn drop(&mut self) {
        if self.armed {
            let status = self.driver.ctx_set_current(self.previous);
            if status != sys::Status::Success {
                warn!(previous = %self.previous, %status, "failed to restore the current context");
            }
        }
    }
}

/// Handle to a device context.
///
/// Cloning shares ownership; the native context is released when the last clone is dropped.
/// See the [module-level documentation](self) for details.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.handle.hash(state);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.inner.handle)
            .field("device", &self.inner.device)
            .field("primary", &self.inner.primary)
            .finish()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.inner.primary { "primary" } else { "created" };
        write!(
            f,
            "{kind} context {} on device {}",
            self.inner.handle, self.inner.device
        )
    }
}

impl Context {
    pub(crate) fn from_parts(
        handle: RawContext,
        device: RawDevice,
        primary: bool,
        driver: Arc<dyn Driver>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                handle,
                device,
                primary,
                driver,
            }),
        }
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        &*self.inner.driver
    }

    /// Returns the raw handle to this context.
    pub fn as_raw(&self) -> RawContext {
        self.inner.handle
    }

    /// Ordinal of the device this context belongs to.
    pub fn device_id(&self) -> u32 {
        self.inner.device as u32
    }

    /// The device this context belongs to.
    pub fn device(&self) -> Device {
        Device::from_parts(self.inner.device, self.inner.driver.clone())
    }

    /// Whether this is the primary context of its device, as opposed to one created with
    /// [`Device::create_context`].
    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    /// Number of `Context` values currently sharing this native context, stack entries included.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether the driver reports this context as current on the calling thread.
    pub fn is_current(&self) -> DevResult<bool> {
        let mut raw = RawContext::NULL;
        self.driver().ctx_get_current(&mut raw).to_result()?;
        Ok(raw == self.inner.handle)
    }

    /// Get the API version used to create this context.
    ///
    /// This is not necessarily the latest version supported by the driver.
    pub fn api_version(&self) -> DevResult<ApiVersion> {
        let mut version = 0u32;
        self.driver()
            .ctx_get_api_version(self.inner.handle, &mut version)
            .to_result()?;
        Ok(ApiVersion::from_raw(version as i32))
    }

    /// Block until all work on this context has completed.
    pub fn synchronize(&self) -> DevResult<()> {
        self.with_current(|driver| driver.ctx_synchronize().to_result())
    }

    /// Run `f` against the driver with this context current, then make whatever was current
    /// before current again.
    ///
    /// Only the driver's binding is switched; no context stack is touched, so this is correct
    /// under [`CurrentContext`] and under a separately owned [`ContextStack`] alike.
    pub(crate) fn with_current<T, F>(&self, f: F) -> DevResult<T>
    where
        F: FnOnce(&dyn Driver) -> DevResult<T>,
    {
        let driver = self.driver();
        let mut previous = RawContext::NULL;
        driver.ctx_get_current(&mut previous).to_result()?;
        if previous == self.inner.handle {
            return f(driver);
        }
        driver.ctx_set_current(self.inner.handle).to_result()?;
        trace!(handle = %self.inner.handle, %previous, "temporarily switched context");
        let restore = RestoreCurrent {
            driver,
            previous,
            armed: true,
        };
        let out = f(driver);
        if let Err(e) = restore.finish() {
            if out.is_ok() {
                return Err(e);
            }
            warn!(%previous, error = %e, "failed to restore the current context after an error");
        }
        out
    }

    /// Destroy this handle, returning an error if the native release fails.
    ///
    /// Only the last holder actually releases anything; for any other holder this just drops
    /// the handle. On failure the error is returned together with the context, which still
    /// holds its reference.
    pub fn drop(ctx: Context) -> DropResult<Context> {
        let mut inner = match Arc::try_unwrap(ctx.inner) {
            Ok(inner) => inner,
            Err(_shared) => return Ok(()),
        };
        match inner.release() {
            Ok(()) => {
                inner.handle = RawContext::NULL;
                Ok(())
            }
            Err(e) => {
                let ctx = Context {
                    inner: Arc::new(inner),
                };
                Err((e, ctx))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::DevError;
    use crate::sys::sim::SimDriver;
    use crate::sys::Status;
    use crate::InitFlags;
    use std::error::Error;

    #[test]
    fn test_scheduling_policy_round_trip_through_flags() {
        let flags = ContextFlags::MAP_HOST | ContextFlags::SCHED_SPIN;
        assert_eq!(SchedulingPolicy::from_flags(flags), SchedulingPolicy::Spin);
        let changed = SchedulingPolicy::BlockingSync.apply(flags);
        assert_eq!(
            changed,
            ContextFlags::MAP_HOST | ContextFlags::SCHED_BLOCKING_SYNC
        );
        assert_eq!(
            SchedulingPolicy::Auto.apply(changed),
            ContextFlags::MAP_HOST
        );
    }

    #[test]
    fn test_stream_priority_ordering() {
        let bounded = StreamPriorityRange {
            least: 0,
            greatest: -5,
        };
        assert!(bounded.is_well_ordered());
        assert_eq!(bounded.as_pair(), (-5, 0));

        let unbounded = StreamPriorityRange {
            least: StreamPriorityRange::UNBOUNDED,
            greatest: 3,
        };
        assert!(unbounded.is_unbounded());
        assert!(unbounded.is_well_ordered());

        let inverted = StreamPriorityRange {
            least: -5,
            greatest: 0,
        };
        assert!(!inverted.is_well_ordered());
    }

    #[test]
    fn test_raw_codes() {
        assert_eq!(CacheConfig::from_raw(2), Some(CacheConfig::PreferL1));
        assert_eq!(CacheConfig::from_raw(9), None);
        assert_eq!(
            SharedMemoryConfig::from_raw(2),
            Some(SharedMemoryConfig::EightByteBankSize)
        );
    }

    #[test]
    fn test_with_current_keeps_closure_error() -> Result<(), Box<dyn Error>> {
        let platform = crate::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
        let device = platform.get_device(0)?;
        let outer = device.create_context(ContextFlags::MAP_HOST)?;
        let inner = device.create_context(ContextFlags::MAP_HOST)?;
        let driver = platform.driver().clone();
        driver.ctx_set_current(outer.as_raw()).to_result()?;

        // the previous binding vanishes while the closure runs, so restoring it fails too
        let result: DevResult<()> = inner.with_current(|driver| {
            driver.ctx_destroy(outer.as_raw()).to_result()?;
            Err(DevError::InvalidLimitValue)
        });
        assert_eq!(result, Err(DevError::InvalidLimitValue));

        let result = inner.with_current(|_| Ok(5));
        assert_eq!(result, Ok(5));
        driver.ctx_set_current(RawContext::NULL).to_result()?;
        Ok(())
    }

    #[test]
    fn test_with_current_reports_restore_failure() -> Result<(), Box<dyn Error>> {
        let platform = crate::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
        let device = platform.get_device(0)?;
        let outer = device.create_context(ContextFlags::MAP_HOST)?;
        let inner = device.create_context(ContextFlags::MAP_HOST)?;
        let driver = platform.driver().clone();
        driver.ctx_set_current(outer.as_raw()).to_result()?;

        let result = inner.with_current(|driver| driver.ctx_destroy(outer.as_raw()).to_result());
        assert_eq!(result, Err(DevError::Platform(Status::InvalidContext)));
        driver.ctx_set_current(RawContext::NULL).to_result()?;
        Ok(())
    }

    #[test]
    fn test_drop_returns_context_when_release_fails() -> Result<(), Box<dyn Error>> {
        let platform = crate::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
        let device = platform.get_device(0)?;
        let ctx = device.create_context(ContextFlags::MAP_HOST)?;
        let raw = ctx.as_raw();
        platform.driver().ctx_destroy(raw).to_result()?;

        match Context::drop(ctx) {
            Ok(()) => panic!("releasing a destroyed context should fail"),
            Err((e, ctx)) => {
                assert_eq!(e, DevError::Platform(Status::InvalidContext));
                assert_eq!(ctx.as_raw(), raw);
                assert_eq!(ctx.holders(), 1);
            }
        }
        Ok(())
    }

    #[test]
    fn test_drop_of_shared_handle_keeps_context_alive() -> Result<(), Box<dyn Error>> {
        let driver = Arc::new(SimDriver::default());
        let platform = crate::init(driver.clone(), InitFlags::empty())?;
        let ctx = platform.get_device(0)?.create_context(ContextFlags::MAP_HOST)?;
        let other = ctx.clone();
        assert_eq!(Context::drop(ctx), Ok(()));
        assert_eq!(driver.live_contexts(), 1);
        assert_eq!(Context::drop(other), Ok(()));
        assert_eq!(driver.live_contexts(), 0);
        Ok(())
    }
}
