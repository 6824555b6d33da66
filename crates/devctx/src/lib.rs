//! Safe, per-thread management of device contexts.
//!
//! # Contexts and the current context
//!
//! A device context is akin to a process on the host - it owns the memory space, resource limits
//! and configuration used to run work on one device. Every device has exactly one *primary*
//! context, which the platform reference counts across all of its holders, and any number of
//! explicitly created contexts.
//!
//! The driver keeps one "current" context per OS thread, and most driver calls implicitly act on
//! it. devctx tracks it with a per-thread [`ContextStack`](context::ContextStack): the top of the
//! stack is always what the platform reports as current. On top of that sit
//!
//! * [`CurrentContext`](context::CurrentContext), the calling thread's stack (push, pop, set, get),
//! * [`ScopedOverride`](context::ScopedOverride), a guard that makes a context current for the
//!   rest of a scope and restores the previous one on every exit path,
//! * the attribute accessors on [`Context`](context::Context), which transparently make their
//!   context current for the duration of the driver call.
//!
//! # Drivers
//!
//! The platform itself is reached through the [`sys::Driver`] trait. [`sys::sim::SimDriver`] is a
//! complete in-memory implementation, useful for tests and for machines without devices.
//!
//! # Usage:
//!
//! ```
//! use devctx::prelude::*;
//! use devctx::sys::sim::SimDriver;
//! use std::sync::Arc;
//! # use std::error::Error;
//! # fn main() -> Result<(), Box<dyn Error>> {
//! let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
//! let device = platform.get_device(0)?;
//! let context = device.primary_context()?;
//!
//! CurrentContext::push(&context)?;
//! assert_eq!(CurrentContext::get_current()?, context);
//! context.set_cache_config(CacheConfig::PreferL1)?;
//! assert_eq!(CurrentContext::pop()?, context);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod context;
pub mod device;
pub mod error;
pub mod prelude;

pub use devctx_raw as sys;

use crate::context::{Context, CurrentContext};
use crate::device::Platform;
use crate::error::{DevResult, ToResult};
use crate::sys::sim::SimDriver;
use crate::sys::Driver;
use bitflags::bitflags;
use std::sync::Arc;
use tracing::debug;

bitflags! {
    /// Bit flags for initializing the driver. Currently, no flags are defined,
    /// so `InitFlags::empty()` is the only valid value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InitFlags: u32 {
        // We need to give bitflags at least one constant.
        #[doc(hidden)]
        const _ZERO = 0;
    }
}

/// Initialize `driver` and wrap it in a [`Platform`].
///
/// This must be called before anything else is done with the driver. Initializing the same
/// driver more than once is allowed.
pub fn init(driver: Arc<dyn Driver>, flags: InitFlags) -> DevResult<Platform> {
    driver.init(flags.bits()).to_result()?;
    debug!(flags = flags.bits(), "driver initialized");
    Ok(Platform::new(driver))
}

/// Shortcut for setting up a [`SimDriver`] described by the environment and making the primary
/// context of its first device current on this thread.
///
/// **The returned context stays on this thread's context stack** until it is popped.
#[must_use = "The context must be kept around or popped, or later calls will act on a stale stack entry"]
pub fn quick_init() -> DevResult<Context> {
    let platform = init(Arc::new(SimDriver::from_env()), InitFlags::empty())?;
    let device = platform.get_device(0)?;
    let ctx = device.primary_context()?;
    CurrentContext::push(&ctx)?;
    Ok(ctx)
}

/// Struct representing a driver API version number.
#[derive(Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone)]
pub struct ApiVersion {
    version: i32,
}

impl ApiVersion {
    pub(crate) fn from_raw(version: i32) -> Self {
        Self { version }
    }

    /// Return the major version number - eg. the 12 in version 12.4
    #[inline]
    pub fn major(self) -> i32 {
        self.version / 1000
    }

    /// Return the minor version number - eg. the 4 in version 12.4
    #[inline]
    pub fn minor(self) -> i32 {
        (self.version % 1000) / 10
    }
}


// Fake module with a private trait used to prevent outside code from implementing certain traits.
pub(crate) mod private {
    pub trait Sealed {}
}
