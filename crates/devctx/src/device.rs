//! Functions and types for enumerating devices and obtaining their contexts.

use crate::context::{Context, ContextFlags, CurrentContext};
use crate::error::{DevError, DevResult, ToResult};
use crate::sys::{Driver, RawContext, RawDevice};
use crate::ApiVersion;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// An initialized driver, the entry point for device enumeration.
///
/// Cloning a `Platform` is cheap; all clones talk to the same driver.
#[derive(Clone)]
pub struct Platform {
    driver: Arc<dyn Driver>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

impl Platform {
    pub(crate) fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// The driver this platform was initialized with.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Returns the latest API version supported by the driver.
    pub fn driver_version(&self) -> DevResult<ApiVersion> {
        let mut version = 0;
        self.driver.driver_get_version(&mut version).to_result()?;
        Ok(ApiVersion::from_raw(version))
    }

    /// Get the number of devices.
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
    /// let count = platform.device_count()?;
    /// assert_eq!(count, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub fn device_count(&self) -> DevResult<u32> {
        let mut count = 0i32;
        self.driver.device_get_count(&mut count).to_result()?;
        Ok(count.max(0) as u32)
    }

    /// Get a handle to the `id`'th device. Fails with [`DevError::InvalidDevice`] unless
    /// `id < device_count()`.
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
    /// let device = platform.get_device(0)?;
    /// assert!(matches!(platform.get_device(7), Err(DevError::InvalidDevice)));
    /// # Ok(())
    /// # }
    /// ```
    pub fn get_device(&self, id: u32) -> DevResult<Device> {
        let ordinal = i32::try_from(id).map_err(|_| DevError::InvalidDevice)?;
        let mut device: RawDevice = 0;
        self.driver.device_get(&mut device, ordinal).to_result()?;
        Ok(Device {
            id: device,
            driver: self.driver.clone(),
        })
    }

    /// Return an iterator over all devices.
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
    /// for device in platform.devices()? {
    ///     let device = device?;
    ///     println!("Device Name: {}", device.name()?);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn devices(&self) -> DevResult<Devices> {
        let count = self.device_count()?;
        Ok(Devices {
            platform: self.clone(),
            range: 0..count,
        })
    }

    /// The raw handle the driver reports as current on the calling thread, or
    /// [`RawContext::NULL`].
    ///
    /// This bypasses the context stack entirely and is meant for checking that the stack and the
    /// driver agree.
    pub fn current_raw(&self) -> DevResult<RawContext> {
        let mut raw = RawContext::NULL;
        self.driver.ctx_get_current(&mut raw).to_result()?;
        Ok(raw)
    }
}

/// Opaque handle to a device.
///
/// Two `Device` values are equal when they name the same ordinal.
#[derive(Clone)]
pub struct Device {
    id: RawDevice,
    driver: Arc<dyn Driver>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("id", &self.id).finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl Device {
    pub(crate) fn from_parts(id: RawDevice, driver: Arc<dyn Driver>) -> Self {
        Self { id, driver }
    }

    /// The platform assigned ordinal of this device.
    pub fn id(&self) -> u32 {
        self.id as u32
    }

    /// Returns the raw ordinal of this device.
    pub fn as_raw(&self) -> RawDevice {
        self.id
    }

    /// Returns the name of this device.
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
    /// let device_name = device.name()?;
    /// println!("Device Name: {}", device_name);
    /// # Ok(())
    /// # }
    /// ```
    pub fn name(&self) -> DevResult<String> {
        let mut name = String::new();
        self.driver.device_get_name(&mut name, self.id).to_result()?;
        Ok(name)
    }

    /// Retains the primary context of this device.
    ///
    /// The platform keeps one primary context per device and counts its holders; every call made
    /// while another holder is alive returns a context equal to the earlier ones. The primary
    /// context is released once the last clone of every returned [`Context`] is dropped.
    ///
    /// This does **not** push the context onto any stack.
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
    /// let first = device.primary_context()?;
    /// let second = device.primary_context()?;
    /// assert_eq!(first, second);
    /// assert!(first.is_primary());
    /// assert!(CurrentContext::get_current().is_err());
    /// # Ok(())
    /// # }
    /// ```
    pub fn primary_context(&self) -> DevResult<Context> {
        let mut raw = RawContext::NULL;
        self.driver
            .device_primary_ctx_retain(&mut raw, self.id)
            .to_result()?;
        debug!(device = self.id, handle = %raw, "retained primary context");
        Ok(Context::from_parts(raw, self.id, true, self.driver.clone()))
    }

    /// Creates a new, non-primary context on this device, owned by the returned value.
    ///
    /// The calling thread's context stack is left unchanged.
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
    /// let context = device.create_context(ContextFlags::MAP_HOST | ContextFlags::SCHED_AUTO)?;
    /// assert!(!context.is_primary());
    /// assert_eq!(CurrentContext::depth(), 0);
    /// # Ok(())
    /// # }
    /// ```
    pub fn create_context(&self, flags: ContextFlags) -> DevResult<Context> {
        let mut raw = RawContext::NULL;
        self.driver
            .ctx_create(&mut raw, flags.bits(), self.id)
            .to_result()?;
        debug!(device = self.id, flags = flags.bits(), handle = %raw, "created context");
        Ok(Context::from_parts(raw, self.id, false, self.driver.clone()))
    }

    /// Creates a new context and pushes it onto the calling thread's context stack.
    ///
    /// If the push fails the new context is destroyed before the error is returned, so the stack
    /// is never left pointing at a context the caller doesn't hold.
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
    /// assert_eq!(CurrentContext::get_current()?, context);
    /// CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn create_and_push(&self, flags: ContextFlags) -> DevResult<Context> {
        let ctx = self.create_context(flags)?;
        CurrentContext::push(&ctx)?;
        Ok(ctx)
    }

    /// Flags of the primary context, and whether it is currently active.
    pub fn primary_context_state(&self) -> DevResult<(ContextFlags, bool)> {
        let mut flags = 0u32;
        let mut active = false;
        self.driver
            .device_primary_ctx_get_state(self.id, &mut flags, &mut active)
            .to_result()?;
        Ok((ContextFlags::from_bits_truncate(flags), active))
    }

    /// Block until all work on the primary context of this device has completed.
    pub fn synchronize(&self) -> DevResult<()> {
        self.primary_context()?.synchronize()
    }

    /// Resets the primary context of this device, restoring its attributes to their defaults.
    ///
    /// Nothing else should be relying on the primary context's state when this is called.
    pub fn reset(&self) -> DevResult<()> {
        self.driver.device_primary_ctx_reset(self.id).to_result()
    }
}

/// Iterator over all available devices. See [`Platform::devices`].
#[derive(Debug)]
pub struct Devices {
    platform: Platform,
    range: Range<u32>,
}

impl Iterator for Devices {
    type Item = DevResult<Device>;

    fn next(&mut self) -> Option<DevResult<Device>> {
        self.range.next().map(|id| self.platform.get_device(id))
    }
}
