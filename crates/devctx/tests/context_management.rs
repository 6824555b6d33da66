use devctx::context::{SchedulingPolicy, StreamPriorityRange};
use devctx::prelude::*;
use devctx::sys::sim::{SimConfig, SimDeviceSpec, SimDriver};
use std::error::Error;
use std::sync::Arc;

fn platform(config: SimConfig) -> Result<Platform, Box<dyn Error>> {
    Ok(devctx::init(Arc::new(SimDriver::new(config)), InitFlags::empty())?)
}

fn toggled_cache(config: CacheConfig) -> CacheConfig {
    if config == CacheConfig::PreferL1 {
        CacheConfig::PreferShared
    } else {
        CacheConfig::PreferL1
    }
}

fn check_context(ctx: &Context) -> Result<(), Box<dyn Error>> {
    let depth = CurrentContext::depth();

    let cache = ctx.cache_config()?;
    let wanted = toggled_cache(cache);
    ctx.set_cache_config(wanted)?;
    assert_eq!(ctx.cache_config()?, wanted);

    let banks = ctx.shared_memory_config()?;
    let wanted = if banks == SharedMemoryConfig::FourByteBankSize {
        SharedMemoryConfig::EightByteBankSize
    } else {
        SharedMemoryConfig::FourByteBankSize
    };
    ctx.set_shared_memory_config(wanted)?;
    assert_eq!(ctx.shared_memory_config()?, wanted);

    let priorities = ctx.stream_priority_range()?;
    if priorities.least != StreamPriorityRange::UNBOUNDED {
        assert!(priorities.greatest <= priorities.least);
    }

    let fifo = ctx.resource_limit(ResourceLimit::PrintfFifoSize)?;
    let wanted = if fifo <= 1024 { 2 * fifo } else { fifo - 512 };
    ctx.set_resource_limit(ResourceLimit::PrintfFifoSize, wanted)?;
    assert_eq!(ctx.resource_limit(ResourceLimit::PrintfFifoSize)?, wanted);

    let _ = ctx.sync_scheduling_policy()?;
    let _ = ctx.keeps_larger_local_mem_after_resize()?;
    let _ = ctx.can_map_host_memory()?;

    assert_eq!(CurrentContext::depth(), depth);
    Ok(())
}

#[test]
fn context_management_walkthrough() -> Result<(), Box<dyn Error>> {
    let platform = platform(SimConfig::with_devices(2))?;
    let device = platform.get_device(0)?;

    let primary = device.primary_context()?;
    assert_eq!(primary.device_id(), device.id());
    assert_eq!(primary.device(), device);
    assert!(primary.is_primary());
    CurrentContext::push(&primary)?;
    check_context(&primary)?;
    assert_eq!(CurrentContext::pop()?, primary);

    let created = device.create_context(ContextFlags::MAP_HOST | ContextFlags::SCHED_AUTO)?;
    assert!(!created.is_primary());
    assert_eq!(created.device_id(), device.id());
    check_context(&created)?;

    let ctx0 = device.create_context(ContextFlags::MAP_HOST)?;
    let ctx1 = device.create_context(ContextFlags::MAP_HOST)?;
    CurrentContext::set_current(&ctx0)?;
    assert_eq!(CurrentContext::get_current()?, ctx0);
    assert_eq!(platform.current_raw()?, ctx0.as_raw());
    CurrentContext::set_current(&ctx1)?;
    assert_eq!(CurrentContext::get_current()?, ctx1);
    assert_eq!(CurrentContext::depth(), 1);

    let ctx2 = device.create_context(ContextFlags::MAP_HOST)?;
    {
        let _guard = ScopedOverride::new(&ctx2)?;
        assert_eq!(CurrentContext::get_current()?, ctx2);
    }
    assert_eq!(CurrentContext::get_current()?, ctx1);

    let ctx3 = device.create_and_push(ContextFlags::MAP_HOST)?;
    {
        let _guard = ScopedOverride::new(&ctx3)?;
        assert_eq!(CurrentContext::get_current()?, ctx3);
    }
    assert_eq!(CurrentContext::pop()?, ctx3);
    assert_eq!(CurrentContext::get_current()?, ctx1);

    device.synchronize()?;
    device.reset()?;
    assert_eq!(CurrentContext::pop()?, ctx1);
    assert_eq!(CurrentContext::depth(), 0);
    Ok(())
}

#[test]
fn primary_cache_preference_toggles() -> Result<(), Box<dyn Error>> {
    let platform = platform(SimConfig::default())?;
    let primary = platform.get_device(0)?.primary_context()?;
    CurrentContext::push(&primary)?;

    let before = CurrentContext::get_cache_config()?;
    let opposite = toggled_cache(before);
    primary.set_cache_config(opposite)?;
    assert_eq!(primary.cache_config()?, opposite);
    assert_eq!(CurrentContext::get_cache_config()?, opposite);

    CurrentContext::pop()?;
    Ok(())
}

#[test]
fn set_replaces_without_growing() -> Result<(), Box<dyn Error>> {
    let platform = platform(SimConfig::default())?;
    let device = platform.get_device(0)?;
    let x = device.create_context(ContextFlags::empty())?;
    let y = device.create_context(ContextFlags::empty())?;
    assert_ne!(x, y);

    CurrentContext::push(&x)?;
    let depth = CurrentContext::depth();
    CurrentContext::set_current(&x)?;
    CurrentContext::set_current(&y)?;
    assert_eq!(CurrentContext::get_current()?, y);
    assert_eq!(CurrentContext::depth(), depth);
    assert_eq!(CurrentContext::pop()?, y);
    Ok(())
}

#[test]
fn pops_come_back_in_reverse_order() -> Result<(), Box<dyn Error>> {
    let platform = platform(SimConfig::default())?;
    let device = platform.get_device(0)?;
    let x = device.create_context(ContextFlags::empty())?;
    let y = device.create_context(ContextFlags::empty())?;

    CurrentContext::push(&x)?;
    CurrentContext::push(&y)?;
    assert_eq!(CurrentContext::pop()?, y);
    assert_eq!(CurrentContext::pop()?, x);
    assert_eq!(CurrentContext::pop().unwrap_err(), DevError::EmptyStack);
    Ok(())
}

#[test]
fn override_restores_after_error() -> Result<(), Box<dyn Error>> {
    let spec = SimDeviceSpec::new("strict").limit_ceiling(4096);
    let platform = platform(SimConfig::empty().device(spec))?;
    let device = platform.get_device(0)?;
    let a = device.primary_context()?;
    let b = device.create_context(ContextFlags::MAP_HOST)?;

    CurrentContext::push(&a)?;
    let result = CurrentContext::with_override(&b, || {
        CurrentContext::set_resource_limit(ResourceLimit::MallocHeapSize, 1 << 20)
    })?;
    assert_eq!(result, Err(DevError::InvalidLimitValue));
    assert_eq!(CurrentContext::get_current()?, a);
    assert_eq!(platform.current_raw()?, a.as_raw());
    CurrentContext::pop()?;
    Ok(())
}

#[test]
fn primary_context_survives_while_held() -> Result<(), Box<dyn Error>> {
    let platform = platform(SimConfig::default())?;
    let device = platform.get_device(0)?;
    let first = device.primary_context()?;
    let second = device.primary_context()?;
    assert_eq!(first, second);

    let raw = first.as_raw();
    drop(first);
    assert_eq!(device.primary_context()?.as_raw(), raw);
    drop(second);
    assert!(!device.primary_context_state()?.1);
    Ok(())
}

#[test]
fn explicit_drop_reports_success() -> Result<(), Box<dyn Error>> {
    let platform = platform(SimConfig::default())?;
    let ctx = platform.get_device(0)?.create_context(ContextFlags::empty())?;
    let copy = ctx.clone();
    assert!(Context::drop(copy).is_ok());
    assert_eq!(ctx.holders(), 1);
    assert!(Context::drop(ctx).is_ok());
    Ok(())
}

#[test]
fn explicit_stack_is_independent_object() -> Result<(), Box<dyn Error>> {
    let platform = platform(SimConfig::default())?;
    let device = platform.get_device(0)?;
    let x = device.create_context(ContextFlags::SCHED_SPIN)?;
    let y = device.create_context(ContextFlags::SCHED_YIELD)?;

    let mut stack = ContextStack::new();
    stack.push(&x)?;
    let policy = stack.with_override(&y, |stack| {
        assert_eq!(stack.depth(), 2);
        stack.get().and_then(|ctx| ctx.scheduling_policy())
    })??;
    assert_eq!(policy, SchedulingPolicy::Yield);
    assert_eq!(x.scheduling_policy()?, SchedulingPolicy::Spin);
    assert_eq!(stack.get()?, x);
    assert_eq!(stack.pop()?, x);
    Ok(())
}

#[test]
fn context_display() -> Result<(), Box<dyn Error>> {
    let platform = platform(SimConfig::default())?;
    let primary = platform.get_device(0)?.primary_context()?;
    let text = primary.to_string();
    assert!(text.starts_with("primary context 0x"));
    assert!(text.ends_with("on device 0"));
    assert_eq!(primary.api_version()?.major(), 3);
    Ok(())
}
