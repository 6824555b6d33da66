use devctx::prelude::*;
use devctx::sys::sim::{SimConfig, SimDriver};
use std::error::Error;
use std::sync::{Arc, Barrier};
use std::thread;

fn platform() -> Result<Platform, Box<dyn Error>> {
    Ok(devctx::init(
        Arc::new(SimDriver::new(SimConfig::with_devices(2))),
        InitFlags::empty(),
    )?)
}

#[test]
fn stacks_are_per_thread() -> Result<(), Box<dyn Error>> {
    let platform = platform()?;
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2u32)
        .map(|id| {
            let platform = platform.clone();
            let barrier = barrier.clone();
            thread::spawn(move || -> DevResult<()> {
                let device = platform.get_device(id)?;
                let ctx = device.create_and_push(ContextFlags::MAP_HOST)?;
                barrier.wait();
                assert_eq!(CurrentContext::get_current()?, ctx);
                assert_eq!(CurrentContext::depth(), 1);
                assert_eq!(CurrentContext::get_device()?.id(), id);
                barrier.wait();
                assert_eq!(CurrentContext::pop()?, ctx);
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().map_err(|_| "worker panicked")??;
    }
    assert_eq!(CurrentContext::depth(), 0);
    assert!(platform.current_raw()?.is_null());
    Ok(())
}

#[test]
fn same_context_on_many_threads() -> Result<(), Box<dyn Error>> {
    let platform = platform()?;
    let primary = platform.get_device(0)?.primary_context()?;
    CurrentContext::push(&primary)?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let primary = primary.clone();
            let platform = platform.clone();
            thread::spawn(move || -> DevResult<()> {
                assert_eq!(
                    CurrentContext::get_current().unwrap_err(),
                    DevError::NoCurrentContext
                );
                let _guard = ScopedOverride::new(&primary)?;
                assert_eq!(platform.get_device(0)?.primary_context()?, primary);
                primary.set_cache_config(CacheConfig::PreferEqual)?;
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.join().map_err(|_| "worker panicked")??;
    }
    assert_eq!(CurrentContext::get_current()?, primary);
    assert_eq!(primary.cache_config()?, CacheConfig::PreferEqual);
    assert_eq!(CurrentContext::pop()?, primary);
    Ok(())
}
