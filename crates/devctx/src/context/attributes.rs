//! Context attributes.
//!
//! The driver only exposes these for the calling thread's current context. The free functions
//! here talk to whatever is current; the methods on [`Context`] switch to their context first and
//! the associated functions on [`CurrentContext`] use the top of the thread's stack.

use super::{
    CacheConfig, Context, ContextFlags, CurrentContext, ResourceLimit, SchedulingPolicy,
    SharedMemoryConfig, StreamPriorityRange,
};
use crate::device::Device;
use crate::error::{DevError, DevResult, ToResult};
use crate::sys::{Driver, RawDevice, Status};
use tracing::debug;

fn unknown_reply() -> DevError {
    DevError::Platform(Status::Unknown)
}

fn get_cache_config(driver: &dyn Driver) -> DevResult<CacheConfig> {
    let mut raw = 0u32;
    driver.ctx_get_cache_config(&mut raw).to_result()?;
    CacheConfig::from_raw(raw).ok_or_else(unknown_reply)
}

fn set_cache_config(driver: &dyn Driver, config: CacheConfig) -> DevResult<()> {
    driver.ctx_set_cache_config(config as u32).to_result()
}

fn get_shared_memory_config(driver: &dyn Driver) -> DevResult<SharedMemoryConfig> {
    let mut raw = 0u32;
    driver.ctx_get_shared_mem_config(&mut raw).to_result()?;
    SharedMemoryConfig::from_raw(raw).ok_or_else(unknown_reply)
}

fn set_shared_memory_config(driver: &dyn Driver, config: SharedMemoryConfig) -> DevResult<()> {
    driver.ctx_set_shared_mem_config(config as u32).to_result()
}

fn get_stream_priority_range(driver: &dyn Driver) -> DevResult<StreamPriorityRange> {
    let mut least = 0;
    let mut greatest = 0;
    driver
        .ctx_get_stream_priority_range(&mut least, &mut greatest)
        .to_result()?;
    Ok(StreamPriorityRange { least, greatest })
}

fn get_resource_limit(driver: &dyn Driver, resource: ResourceLimit) -> DevResult<usize> {
    let mut limit = 0usize;
    driver.ctx_get_limit(&mut limit, resource as u32).to_result()?;
    Ok(limit)
}

fn set_resource_limit(driver: &dyn Driver, resource: ResourceLimit, limit: usize) -> DevResult<()> {
    match driver.ctx_set_limit(resource as u32, limit) {
        Status::InvalidValue => Err(DevError::InvalidLimitValue),
        status => status.to_result(),
    }
}

fn get_flags(driver: &dyn Driver) -> DevResult<ContextFlags> {
    let mut flags = 0u32;
    driver.ctx_get_flags(&mut flags).to_result()?;
    Ok(ContextFlags::from_bits_truncate(flags))
}

fn set_flags(driver: &dyn Driver, flags: ContextFlags) -> DevResult<()> {
    driver.ctx_set_flags(flags.bits()).to_result()
}

fn get_device(driver: &dyn Driver) -> DevResult<RawDevice> {
    let mut device: RawDevice = 0;
    driver.ctx_get_device(&mut device).to_result()?;
    Ok(device)
}

impl Context {
    /// Returns the preferred cache configuration of this context.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_context(ContextFlags::MAP_HOST)?;
    /// assert_eq!(context.cache_config()?, CacheConfig::PreferNone);
    /// # Ok(())
    /// # }
    /// ```
    pub fn cache_config(&self) -> DevResult<CacheConfig> {
        self.with_current(get_cache_config)
    }

    /// Sets the preferred cache configuration of this context.
    ///
    /// On devices where the L1 cache and shared memory use the same hardware resources, this
    /// sets the preferred cache configuration. This is only a preference. The driver will use the
    /// requested configuration if possible, but it is free to choose a different configuration if
    /// required to execute functions.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.primary_context()?;
    /// context.set_cache_config(CacheConfig::PreferShared)?;
    /// assert_eq!(context.cache_config()?, CacheConfig::PreferShared);
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_cache_config(&self, config: CacheConfig) -> DevResult<()> {
        self.with_current(|driver| set_cache_config(driver, config))
    }

    /// Returns the shared memory bank size of this context.
    pub fn shared_memory_config(&self) -> DevResult<SharedMemoryConfig> {
        self.with_current(get_shared_memory_config)
    }

    /// Sets the shared memory bank size of this context.
    ///
    /// Devices with a fixed bank size accept the request and keep reporting their own size.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.primary_context()?;
    /// context.set_shared_memory_config(SharedMemoryConfig::EightByteBankSize)?;
    /// assert_eq!(
    ///     context.shared_memory_config()?,
    ///     SharedMemoryConfig::EightByteBankSize
    /// );
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_shared_memory_config(&self, config: SharedMemoryConfig) -> DevResult<()> {
        self.with_current(|driver| set_shared_memory_config(driver, config))
    }

    /// Returns the stream priority range of this context.
    ///
    /// See [`StreamPriorityRange`] for how priorities are ordered.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.primary_context()?;
    /// let range = context.stream_priority_range()?;
    /// assert!(range.is_well_ordered());
    /// # Ok(())
    /// # }
    /// ```
    pub fn stream_priority_range(&self) -> DevResult<StreamPriorityRange> {
        self.with_current(get_stream_priority_range)
    }

    /// Returns the given resource limit of this context.
    pub fn resource_limit(&self, resource: ResourceLimit) -> DevResult<usize> {
        self.with_current(|driver| get_resource_limit(driver, resource))
    }

    /// Sets a resource limit of this context.
    ///
    /// No bound is enforced here; values the platform refuses come back as
    /// [`DevError::InvalidLimitValue`].
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.primary_context()?;
    /// context.set_resource_limit(ResourceLimit::PrintfFifoSize, 2048)?;
    /// assert_eq!(context.resource_limit(ResourceLimit::PrintfFifoSize)?, 2048);
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_resource_limit(&self, resource: ResourceLimit, limit: usize) -> DevResult<()> {
        self.with_current(|driver| set_resource_limit(driver, resource, limit))?;
        debug!(handle = %self.as_raw(), ?resource, limit, "resource limit set");
        Ok(())
    }

    /// Returns the flags of this context.
    pub fn flags(&self) -> DevResult<ContextFlags> {
        self.with_current(get_flags)
    }

    /// Changes the flags of this context.
    ///
    /// The flags of a primary context are changed through its device and apply to every holder.
    /// Other contexts only accept changes to the scheduling policy and
    /// [`ContextFlags::LMEM_RESIZE_TO_MAX`].
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_context(ContextFlags::MAP_HOST)?;
    /// context.set_flags(ContextFlags::MAP_HOST | ContextFlags::SCHED_YIELD)?;
    /// assert!(context.flags()?.contains(ContextFlags::SCHED_YIELD));
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_flags(&self, flags: ContextFlags) -> DevResult<()> {
        if self.is_primary() {
            self.driver()
                .device_primary_ctx_set_flags(self.inner.device, flags.bits())
                .to_result()
        } else {
            self.with_current(|driver| set_flags(driver, flags))
        }
    }

    /// How the host thread waits for work on this context.
    pub fn scheduling_policy(&self) -> DevResult<SchedulingPolicy> {
        Ok(SchedulingPolicy::from_flags(self.flags()?))
    }

    /// Replaces the scheduling bits of this context's flags, keeping the other flags.
    pub fn set_scheduling_policy(&self, policy: SchedulingPolicy) -> DevResult<()> {
        self.set_flags(policy.apply(self.flags()?))
    }

    /// Whether the host thread blocks on a synchronization primitive while waiting.
    pub fn sync_scheduling_policy(&self) -> DevResult<bool> {
        Ok(self.scheduling_policy()? == SchedulingPolicy::BlockingSync)
    }

    /// Whether local memory grown for a launch is kept after the launch instead of being
    /// shrunk back.
    pub fn keeps_larger_local_mem_after_resize(&self) -> DevResult<bool> {
        Ok(self.flags()?.contains(ContextFlags::LMEM_RESIZE_TO_MAX))
    }

    /// Sets or clears [`ContextFlags::LMEM_RESIZE_TO_MAX`] on this context.
    pub fn set_keep_larger_local_mem_after_resize(&self, keep: bool) -> DevResult<()> {
        let mut flags = self.flags()?;
        flags.set(ContextFlags::LMEM_RESIZE_TO_MAX, keep);
        self.set_flags(flags)
    }

    /// Whether pinned host memory can be mapped into this context's address space.
    pub fn can_map_host_memory(&self) -> DevResult<bool> {
        Ok(self.flags()?.contains(ContextFlags::MAP_HOST))
    }
}

impl CurrentContext {
    /// Returns the preferred cache configuration for the current context.
    ///
    /// On devices where the L1 cache and shared memory use the same hardware resources, this
    /// function returns the preferred cache configuration for the current context. For devices
    /// where the size of the L1 cache and shared memory are fixed, this will always return
    /// `CacheConfig::PreferNone`.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// let cache_config = CurrentContext::get_cache_config()?;
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn get_cache_config() -> DevResult<CacheConfig> {
        get_cache_config(Self::get_current()?.driver())
    }

    /// Sets the preferred cache configuration for the current context.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// CurrentContext::set_cache_config(CacheConfig::PreferL1)?;
    /// assert_eq!(context.cache_config()?, CacheConfig::PreferL1);
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_cache_config(config: CacheConfig) -> DevResult<()> {
        set_cache_config(Self::get_current()?.driver(), config)
    }

    /// Returns the shared memory bank size of the current context.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// let shared_memory_config = CurrentContext::get_shared_memory_config()?;
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn get_shared_memory_config() -> DevResult<SharedMemoryConfig> {
        get_shared_memory_config(Self::get_current()?.driver())
    }

    /// Sets the shared memory bank size of the current context.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// CurrentContext::set_shared_memory_config(SharedMemoryConfig::DefaultBankSize)?;
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_shared_memory_config(config: SharedMemoryConfig) -> DevResult<()> {
        set_shared_memory_config(Self::get_current()?.driver(), config)
    }

    /// Returns the stream priority range for the current context.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// let priority_range = CurrentContext::get_stream_priority_range()?;
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn get_stream_priority_range() -> DevResult<StreamPriorityRange> {
        get_stream_priority_range(Self::get_current()?.driver())
    }

    /// Returns the given resource limit for the current context.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// let stack_size = CurrentContext::get_resource_limit(ResourceLimit::StackSize)?;
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn get_resource_limit(resource: ResourceLimit) -> DevResult<usize> {
        get_resource_limit(Self::get_current()?.driver(), resource)
    }

    /// Sets the given resource limit for the current context.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// CurrentContext::set_resource_limit(ResourceLimit::StackSize, 2048)?;
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_resource_limit(resource: ResourceLimit, limit: usize) -> DevResult<()> {
        set_resource_limit(Self::get_current()?.driver(), resource, limit)
    }

    /// Returns the flags of the current context.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// let flags = CurrentContext::get_flags()?;
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn get_flags() -> DevResult<ContextFlags> {
        get_flags(Self::get_current()?.driver())
    }

    /// Sets the flags of the current context. See [`Context::set_flags`].
    pub fn set_flags(flags: ContextFlags) -> DevResult<()> {
        Self::get_current()?.set_flags(flags)
    }

    /// Returns the device of the current context.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// assert_eq!(CurrentContext::get_device()?, device);
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn get_device() -> DevResult<Device> {
        let ctx = Self::get_current()?;
        let id = get_device(ctx.driver())?;
        Ok(Device::from_parts(id, ctx.inner.driver.clone()))
    }

    /// Block until all work on the current context has completed.
    ///
    /// # Example
    ///
    /// ```
    /// # use devctx::prelude::*;
    /// # use devctx::sys::sim::SimDriver;
    /// # use std::error::Error;
    /// # use std::sync::Arc;
    /// #
    /// # fn main() -> Result<(), Box<dyn Error>> {
    /// # let platform = devctx::init(Arc::new(SimDriver::default()), InitFlags::empty())?;
    /// # let device = platform.get_device(0)?;
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// CurrentContext::synchronize()?;
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn synchronize() -> DevResult<()> {
        Self::get_current()?.driver().ctx_synchronize().to_result()
    }
}
