//! A software implementation of [`Driver`].
//!
//! `SimDriver` keeps all state in memory behind a single lock. It follows the native driver's
//! rules closely enough to exercise context management without hardware:
//!
//! * the current context is tracked per OS thread, and a thread's binding is forgotten when the
//!   thread exits;
//! * the primary context of a device is created on first retain and destroyed when its retain
//!   count drops back to zero, so a later retain hands out a new handle;
//! * attribute calls act on the calling thread's current context and fail with
//!   [`Status::InvalidContext`] when there is none;
//! * using a destroyed handle fails with [`Status::InvalidContext`].
//!
//! Unlike `cuCtxCreate`, [`Driver::ctx_create`] does not bind the new context to the calling
//! thread.

mod config;

pub use config::{SimConfig, SimDeviceSpec, DEVICES_ENV, DRIVER_VERSION_ENV};

use crate::{cache_config, ctx_flags, limit, shared_config, Driver, RawContext, RawDevice, Status};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

#[derive(Clone, Debug)]
struct ContextState {
    device: RawDevice,
    primary: bool,
    flags: u32,
    cache: u32,
    shared: u32,
    limits: [usize; limit::COUNT],
}

impl ContextState {
    fn fresh(spec: &SimDeviceSpec, device: RawDevice, primary: bool, flags: u32) -> Self {
        Self {
            device,
            primary,
            flags,
            cache: cache_config::PREFER_NONE,
            shared: shared_config::FOUR_BYTE_BANK_SIZE,
            limits: spec.default_limits,
        }
    }
}

#[derive(Debug)]
struct PrimarySlot {
    handle: RawContext,
    retains: u32,
    flags: u32,
}

#[derive(Debug)]
struct SimState {
    initialized: bool,
    next_handle: u64,
    contexts: HashMap<RawContext, ContextState>,
    primaries: Vec<PrimarySlot>,
    created: Vec<usize>,
    current: HashMap<ThreadId, RawContext>,
}

impl SimState {
    fn allocate(&mut self, state: ContextState) -> RawContext {
        self.next_handle += 1;
        // keep handles looking like aligned pointers
        let handle = RawContext::from_raw(0x5000_0000 + (self.next_handle << 8));
        self.contexts.insert(handle, state);
        handle
    }

    fn forget(&mut self, handle: RawContext) {
        self.contexts.remove(&handle);
        self.current.retain(|_, ctx| *ctx != handle);
    }

    fn current_ctx(&mut self) -> Result<&mut ContextState, Status> {
        let handle = self
            .current
            .get(&thread::current().id())
            .copied()
            .ok_or(Status::InvalidContext)?;
        self.contexts.get_mut(&handle).ok_or(Status::InvalidContext)
    }
}

/// Drivers the owning thread is bound in. Dropped with the thread's locals, which unbinds it.
struct ThreadBindings {
    thread: ThreadId,
    drivers: Vec<Weak<Mutex<SimState>>>,
}

impl ThreadBindings {
    fn register(&mut self, state: &Arc<Mutex<SimState>>) {
        self.drivers.retain(|weak| weak.strong_count() > 0);
        if !self
            .drivers
            .iter()
            .any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(state)))
        {
            self.drivers.push(Arc::downgrade(state));
        }
    }
}

impl Drop for ThreadBindings {
    fn drop(&mut self) {
        for state in self.drivers.iter().filter_map(Weak::upgrade) {
            if let Some(handle) = state.lock().current.remove(&self.thread) {
                trace!(handle = %handle, "binding of exited thread dropped");
            }
        }
    }
}

thread_local! {
    static BINDINGS: RefCell<ThreadBindings> = RefCell::new(ThreadBindings {
        thread: thread::current().id(),
        drivers: Vec::new(),
    });
}

/// In-memory device platform.
#[derive(Debug)]
pub struct SimDriver {
    config: SimConfig,
    state: Arc<Mutex<SimState>>,
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimDriver {
    /// A driver exposing the devices of `config`. It still has to be initialized through
    /// [`Driver::init`] before use.
    pub fn new(config: SimConfig) -> Self {
        let primaries = config
            .devices
            .iter()
            .map(|spec| PrimarySlot {
                handle: RawContext::NULL,
                retains: 0,
                flags: spec.primary_flags,
            })
            .collect();
        let created = vec![0; config.devices.len()];
        Self {
            config,
            state: Arc::new(Mutex::new(SimState {
                initialized: false,
                next_handle: 0,
                contexts: HashMap::new(),
                primaries,
                created,
                current: HashMap::new(),
            })),
        }
    }

    /// A driver described by [`SimConfig::from_env`].
    pub fn from_env() -> Self {
        Self::new(SimConfig::from_env())
    }

    /// The configuration this driver was built from.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Number of threads that currently have a context bound.
    pub fn bound_threads(&self) -> usize {
        self.state.lock().current.len()
    }

    /// Number of live contexts of any kind.
    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    /// Retain count of the primary context of `device`, zero when it is inactive or the device
    /// does not exist.
    pub fn primary_retain_count(&self, device: RawDevice) -> u32 {
        let state = self.state.lock();
        usize::try_from(device)
            .ok()
            .and_then(|ordinal| state.primaries.get(ordinal))
            .map_or(0, |slot| slot.retains)
    }

    fn call<F>(&self, f: F) -> Status
    where
        F: FnOnce(&SimConfig, &mut SimState) -> Result<(), Status>,
    {
        let mut state = self.state.lock();
        if !state.initialized {
            return Status::NotInitialized;
        }
        match f(&self.config, &mut *state) {
            Ok(()) => Status::Success,
            Err(status) => status,
        }
    }
}

fn device_spec(config: &SimConfig, device: RawDevice) -> Result<(usize, &SimDeviceSpec), Status> {
    let ordinal = usize::try_from(device).map_err(|_| Status::InvalidDevice)?;
    config
        .devices
        .get(ordinal)
        .map(|spec| (ordinal, spec))
        .ok_or(Status::InvalidDevice)
}

fn check_flags(flags: u32) -> Result<(), Status> {
    if flags & !ctx_flags::FLAGS_MASK != 0 || (flags & ctx_flags::SCHED_MASK).count_ones() > 1 {
        return Err(Status::InvalidValue);
    }
    Ok(())
}

impl Driver for SimDriver {
    fn init(&self, flags: u32) -> Status {
        if flags != 0 {
            return Status::InvalidValue;
        }
        let mut state = self.state.lock();
        if !state.initialized {
            debug!(devices = self.config.devices.len(), "simulated driver initialized");
            state.initialized = true;
        }
        Status::Success
    }

    fn driver_get_version(&self, version: &mut i32) -> Status {
        *version = self.config.driver_version;
        Status::Success
    }

    fn device_get_count(&self, count: &mut i32) -> Status {
        self.call(|config, _| {
            *count = i32::try_from(config.devices.len()).map_err(|_| Status::Unknown)?;
            Ok(())
        })
    }

    fn device_get(&self, device: &mut RawDevice, ordinal: i32) -> Status {
        self.call(|config, _| {
            device_spec(config, ordinal)?;
            *device = ordinal;
            Ok(())
        })
    }

    fn device_get_name(&self, name: &mut String, device: RawDevice) -> Status {
        self.call(|config, _| {
            let (_, spec) = device_spec(config, device)?;
            name.clone_from(&spec.name);
            Ok(())
        })
    }

    fn device_primary_ctx_retain(&self, ctx: &mut RawContext, device: RawDevice) -> Status {
        self.call(|config, state| {
            let (ordinal, spec) = device_spec(config, device)?;
            if spec.prohibited {
                return Err(Status::DeviceUnavailable);
            }
            if state.primaries[ordinal].handle.is_null() {
                let flags = state.primaries[ordinal].flags;
                let handle = state.allocate(ContextState::fresh(spec, device, true, flags));
                debug!(device, handle = %handle, "primary context activated");
                state.primaries[ordinal].handle = handle;
            }
            let slot = &mut state.primaries[ordinal];
            slot.retains += 1;
            *ctx = slot.handle;
            Ok(())
        })
    }

    fn device_primary_ctx_release(&self, device: RawDevice) -> Status {
        self.call(|config, state| {
            let (ordinal, _) = device_spec(config, device)?;
            let slot = &mut state.primaries[ordinal];
            if slot.retains == 0 {
                return Err(Status::InvalidContext);
            }
            slot.retains -= 1;
            if slot.retains == 0 {
                let handle = std::mem::replace(&mut slot.handle, RawContext::NULL);
                debug!(device, handle = %handle, "primary context deactivated");
                state.forget(handle);
            }
            Ok(())
        })
    }

    fn device_primary_ctx_reset(&self, device: RawDevice) -> Status {
        self.call(|config, state| {
            let (ordinal, spec) = device_spec(config, device)?;
            let slot = &state.primaries[ordinal];
            let (handle, flags) = (slot.handle, slot.flags);
            if let Some(ctx) = state.contexts.get_mut(&handle) {
                *ctx = ContextState::fresh(spec, device, true, flags);
            }
            Ok(())
        })
    }

    fn device_primary_ctx_set_flags(&self, device: RawDevice, flags: u32) -> Status {
        self.call(|config, state| {
            let (ordinal, _) = device_spec(config, device)?;
            check_flags(flags)?;
            let slot = &mut state.primaries[ordinal];
            slot.flags = flags;
            let handle = slot.handle;
            if let Some(ctx) = state.contexts.get_mut(&handle) {
                ctx.flags = flags;
            }
            Ok(())
        })
    }

    fn device_primary_ctx_get_state(
        &self,
        device: RawDevice,
        flags: &mut u32,
        active: &mut bool,
    ) -> Status {
        self.call(|config, state| {
            let (ordinal, _) = device_spec(config, device)?;
            let slot = &state.primaries[ordinal];
            *flags = slot.flags;
            *active = !slot.handle.is_null();
            Ok(())
        })
    }

    fn ctx_create(&self, ctx: &mut RawContext, flags: u32, device: RawDevice) -> Status {
        self.call(|config, state| {
            let (ordinal, spec) = device_spec(config, device)?;
            if spec.prohibited {
                return Err(Status::DeviceUnavailable);
            }
            check_flags(flags)?;
            if state.created[ordinal] >= spec.max_contexts {
                return Err(Status::OutOfMemory);
            }
            state.created[ordinal] += 1;
            let handle = state.allocate(ContextState::fresh(spec, device, false, flags));
            debug!(device, flags, handle = %handle, "context created");
            *ctx = handle;
            Ok(())
        })
    }

    fn ctx_destroy(&self, ctx: RawContext) -> Status {
        self.call(|_, state| {
            let device = match state.contexts.get(&ctx) {
                Some(existing) if !existing.primary => existing.device,
                _ => return Err(Status::InvalidContext),
            };
            if let Some(count) = usize::try_from(device)
                .ok()
                .and_then(|ordinal| state.created.get_mut(ordinal))
            {
                *count = count.saturating_sub(1);
            }
            state.forget(ctx);
            debug!(device, handle = %ctx, "context destroyed");
            Ok(())
        })
    }

    fn ctx_get_current(&self, ctx: &mut RawContext) -> Status {
        self.call(|_, state| {
            *ctx = state
                .current
                .get(&thread::current().id())
                .copied()
                .unwrap_or(RawContext::NULL);
            Ok(())
        })
    }

    fn ctx_set_current(&self, ctx: RawContext) -> Status {
        let status = self.call(|_, state| {
            let thread = thread::current().id();
            if ctx.is_null() {
                state.current.remove(&thread);
            } else {
                if !state.contexts.contains_key(&ctx) {
                    return Err(Status::InvalidContext);
                }
                state.current.insert(thread, ctx);
            }
            trace!(handle = %ctx, "current context bound");
            Ok(())
        });
        if status == Status::Success && !ctx.is_null() {
            // ignored once the thread's locals are being torn down
            let _ = BINDINGS.try_with(|bindings| bindings.borrow_mut().register(&self.state));
        }
        status
    }

    fn ctx_get_api_version(&self, ctx: RawContext, version: &mut u32) -> Status {
        self.call(|config, state| {
            if !state.contexts.contains_key(&ctx) {
                return Err(Status::InvalidContext);
            }
            *version = config.api_version;
            Ok(())
        })
    }

    fn ctx_get_device(&self, device: &mut RawDevice) -> Status {
        self.call(|_, state| {
            *device = state.current_ctx()?.device;
            Ok(())
        })
    }

    fn ctx_get_flags(&self, flags: &mut u32) -> Status {
        self.call(|_, state| {
            *flags = state.current_ctx()?.flags;
            Ok(())
        })
    }

    fn ctx_set_flags(&self, flags: u32) -> Status {
        self.call(|_, state| {
            check_flags(flags)?;
            let ctx = state.current_ctx()?;
            if (flags ^ ctx.flags) & ctx_flags::MAP_HOST != 0 {
                return Err(Status::InvalidValue);
            }
            ctx.flags = flags;
            Ok(())
        })
    }

    fn ctx_get_cache_config(&self, config: &mut u32) -> Status {
        self.call(|_, state| {
            *config = state.current_ctx()?.cache;
            Ok(())
        })
    }

    fn ctx_set_cache_config(&self, config: u32) -> Status {
        self.call(|_, state| {
            if config > cache_config::PREFER_EQUAL {
                return Err(Status::InvalidValue);
            }
            state.current_ctx()?.cache = config;
            Ok(())
        })
    }

    fn ctx_get_shared_mem_config(&self, config: &mut u32) -> Status {
        self.call(|sim, state| {
            let ctx = state.current_ctx()?;
            let (_, spec) = device_spec(sim, ctx.device)?;
            *config = if spec.configurable_banks {
                ctx.shared
            } else {
                shared_config::FOUR_BYTE_BANK_SIZE
            };
            Ok(())
        })
    }

    fn ctx_set_shared_mem_config(&self, config: u32) -> Status {
        self.call(|_, state| {
            if config > shared_config::EIGHT_BYTE_BANK_SIZE {
                return Err(Status::InvalidValue);
            }
            state.current_ctx()?.shared = config;
            Ok(())
        })
    }

    fn ctx_get_limit(&self, value: &mut usize, limit: u32) -> Status {
        self.call(|_, state| {
            let ctx = state.current_ctx()?;
            *value = *ctx
                .limits
                .get(limit as usize)
                .ok_or(Status::UnsupportedLimit)?;
            Ok(())
        })
    }

    fn ctx_set_limit(&self, limit: u32, value: usize) -> Status {
        self.call(|sim, state| {
            let ctx = state.current_ctx()?;
            let (_, spec) = device_spec(sim, ctx.device)?;
            let slot = ctx
                .limits
                .get_mut(limit as usize)
                .ok_or(Status::UnsupportedLimit)?;
            if value > spec.limit_ceiling {
                return Err(Status::InvalidValue);
            }
            *slot = value;
            Ok(())
        })
    }

    fn ctx_get_stream_priority_range(&self, least: &mut i32, greatest: &mut i32) -> Status {
        self.call(|sim, state| {
            let device = state.current_ctx()?.device;
            let (_, spec) = device_spec(sim, device)?;
            *least = spec.least_priority;
            *greatest = spec.greatest_priority;
            Ok(())
        })
    }

    fn ctx_synchronize(&self) -> Status {
        self.call(|_, state| state.current_ctx().map(|_| ()))
    }
}
