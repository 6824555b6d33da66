use super::{Context, ScopedOverride};
use crate::error::{DevError, DevResult, ToResult};
use crate::sys::RawContext;
use std::cell::RefCell;
use std::marker::PhantomData;
use tracing::{error, trace};

/// A LIFO stack of contexts whose top is the driver's current context for the calling thread.
///
/// Every mutation asks the driver first and only touches the stack once the driver accepted the
/// change, so a failed call leaves both exactly as they were.
///
/// Most code uses the calling thread's stack through [`CurrentContext`]. A `ContextStack` value
/// of your own behaves the same way and can be handed around explicitly; it must stay on the
/// thread that uses it, and it should not be mixed with [`CurrentContext`] on the same thread.
///
/// A stack is bound to the thread that created it, so it is neither `Send` nor `Sync`:
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<devctx::context::ContextStack>();
/// ```
///
/// ```compile_fail
/// use devctx::context::ContextStack;
/// let stack = ContextStack::new();
/// std::thread::spawn(move || drop(stack));
/// ```
#[derive(Debug, Default)]
pub struct ContextStack {
    entries: Vec<Context>,
    _thread_bound: PhantomData<*const ()>,
}

impl ContextStack {
    /// An empty stack. Nothing is made current until the first push.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            _thread_bound: PhantomData,
        }
    }

    /// Number of contexts on the stack.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been pushed, or everything pushed was popped again.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The top entry, without asking the driver.
    pub fn top(&self) -> Option<&Context> {
        self.entries.last()
    }

    /// Push `ctx` onto the stack, making it current.
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
    /// let ctx = device.create_context(ContextFlags::MAP_HOST)?;
    /// let mut stack = ContextStack::new();
    /// stack.push(&ctx)?;
    /// assert_eq!(stack.get()?, ctx);
    /// # stack.pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn push(&mut self, ctx: &Context) -> DevResult<()> {
        ctx.driver().ctx_set_current(ctx.as_raw()).to_result()?;
        self.entries.push(ctx.clone());
        trace!(handle = %ctx.as_raw(), depth = self.entries.len(), "pushed context");
        Ok(())
    }

    /// Pop the top context off the stack and return it. The entry below it, if any, becomes
    /// current again; otherwise nothing is current afterwards.
    ///
    /// Fails with [`DevError::EmptyStack`] when there is nothing to pop.
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
    /// let ctx = device.primary_context()?;
    /// let mut stack = ContextStack::new();
    /// stack.push(&ctx)?;
    /// assert_eq!(stack.pop()?, ctx);
    /// assert!(stack.pop().is_err());
    /// # Ok(())
    /// # }
    /// ```
    pub fn pop(&mut self) -> DevResult<Context> {
        let depth = self.entries.len();
        let top = self.entries.last().ok_or(DevError::EmptyStack)?;
        let status = match depth.checked_sub(2).map(|below| &self.entries[below]) {
            Some(next) => next.driver().ctx_set_current(next.as_raw()),
            None => top.driver().ctx_set_current(RawContext::NULL),
        };
        status.to_result()?;
        let popped = self.entries.pop().ok_or(DevError::EmptyStack)?;
        trace!(handle = %popped.as_raw(), depth = self.entries.len(), "popped context");
        Ok(popped)
    }

    /// Replace the top of the stack with `ctx`, leaving the depth unchanged. On an empty stack
    /// this is the same as [`push`](Self::push).
    pub fn set(&mut self, ctx: &Context) -> DevResult<()> {
        let Some(top) = self.entries.last_mut() else {
            return self.push(ctx);
        };
        ctx.driver().ctx_set_current(ctx.as_raw()).to_result()?;
        let replaced = std::mem::replace(top, ctx.clone());
        trace!(
            handle = %ctx.as_raw(),
            replaced = %replaced.as_raw(),
            depth = self.entries.len(),
            "set current context"
        );
        Ok(())
    }

    /// Returns the current context.
    ///
    /// The top entry is checked against what the driver reports as current; a mismatch means
    /// something bypassed the stack and is reported as [`DevError::StackInconsistency`].
    pub fn get(&self) -> DevResult<Context> {
        let top = self.entries.last().ok_or(DevError::NoCurrentContext)?;
        let mut current = RawContext::NULL;
        top.driver().ctx_get_current(&mut current).to_result()?;
        if current != top.as_raw() {
            error!(
                expected = %top.as_raw(),
                reported = %current,
                "context stack disagrees with the driver"
            );
            return Err(DevError::StackInconsistency);
        }
        Ok(top.clone())
    }

    /// Pop every entry, leaving nothing current.
    ///
    /// Stops at the first entry the driver refuses to unbind, leaving it and everything below
    /// it in place.
    pub fn clear(&mut self) -> DevResult<()> {
        while !self.entries.is_empty() {
            self.pop()?;
        }
        Ok(())
    }

    /// Run `f` with `ctx` pushed onto this stack, popping it again however `f` returns.
    ///
    /// `f` gets the stack back so it can nest further overrides.
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
    /// let outer = device.primary_context()?;
    /// let inner = device.create_context(ContextFlags::MAP_HOST)?;
    /// let mut stack = ContextStack::new();
    /// stack.push(&outer)?;
    /// let seen = stack.with_override(&inner, |stack| stack.get())??;
    /// assert_eq!(seen, inner);
    /// assert_eq!(stack.get()?, outer);
    /// # stack.pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_override<R, F>(&mut self, ctx: &Context, f: F) -> DevResult<R>
    where
        F: FnOnce(&mut ContextStack) -> R,
    {
        let mut guard = ScopedOverride::on(self, ctx)?;
        let out = f(guard.stack());
        guard.finish()?;
        Ok(out)
    }
}

thread_local! {
    static THREAD_STACK: RefCell<ContextStack> = const { RefCell::new(ContextStack::new()) };
}

/// Type representing the top context in the thread-local context stack.
///
/// All functions act on the calling thread only. Entries are torn down with their thread.
#[derive(Debug)]
pub struct CurrentContext;

impl CurrentContext {
    pub(crate) fn with_stack<R, F>(f: F) -> R
    where
        F: FnOnce(&mut ContextStack) -> R,
    {
        THREAD_STACK.with(|stack| f(&mut stack.borrow_mut()))
    }

    /// Push the given context onto the calling thread's stack, making it current.
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
    /// CurrentContext::push(&context)?;
    /// assert_eq!(CurrentContext::get_current()?, context);
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn push(ctx: &Context) -> DevResult<()> {
        Self::with_stack(|stack| stack.push(ctx))
    }

    /// Pop the current context off the calling thread's stack and return it. The previous
    /// context, if any, becomes current again.
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
    /// let first = device.create_context(ContextFlags::MAP_HOST)?;
    /// let second = device.create_context(ContextFlags::MAP_HOST)?;
    /// CurrentContext::push(&first)?;
    /// CurrentContext::push(&second)?;
    /// assert_eq!(CurrentContext::pop()?, second);
    /// assert_eq!(CurrentContext::get_current()?, first);
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn pop() -> DevResult<Context> {
        Self::with_stack(ContextStack::pop)
    }

    /// Make `ctx` current without changing the depth of the stack. On an empty stack this pushes
    /// `ctx`.
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
    /// let first = device.create_context(ContextFlags::MAP_HOST)?;
    /// let second = device.create_context(ContextFlags::MAP_HOST)?;
    /// CurrentContext::push(&first)?;
    /// CurrentContext::set_current(&second)?;
    /// assert_eq!(CurrentContext::depth(), 1);
    /// assert_eq!(CurrentContext::get_current()?, second);
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_current(ctx: &Context) -> DevResult<()> {
        Self::with_stack(|stack| stack.set(ctx))
    }

    /// Returns the current context, or [`DevError::NoCurrentContext`].
    ///
    /// The result is checked against the driver, see [`ContextStack::get`].
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
    /// assert!(CurrentContext::get_current().is_err());
    /// let context = device.create_and_push(ContextFlags::MAP_HOST)?;
    /// assert_eq!(CurrentContext::get_current()?, context);
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn get_current() -> DevResult<Context> {
        Self::with_stack(|stack| stack.get())
    }

    /// Number of contexts on the calling thread's stack.
    pub fn depth() -> usize {
        Self::with_stack(|stack| stack.depth())
    }

    /// Run `f` with `ctx` current, restoring the previous context afterwards, including when `f`
    /// unwinds.
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
    /// CurrentContext::with_override(&context, || {
    ///     CurrentContext::set_cache_config(CacheConfig::PreferL1)
    /// })??;
    /// assert_eq!(context.cache_config()?, CacheConfig::PreferL1);
    /// assert_eq!(CurrentContext::depth(), 0);
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_override<R, F>(ctx: &Context, f: F) -> DevResult<R>
    where
        F: FnOnce() -> R,
    {
        let guard = ScopedOverride::new(ctx)?;
        let out = f();
        guard.finish()?;
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::ContextFlags;
    use crate::device::Platform;
    use crate::sys::sim::{SimConfig, SimDriver};
    use crate::InitFlags;
    use std::error::Error;
    use std::sync::Arc;

    fn test_platform() -> Result<Platform, Box<dyn Error>> {
        let sim = Arc::new(SimDriver::new(SimConfig::with_devices(1)));
        Ok(crate::init(sim, InitFlags::empty())?)
    }

    #[test]
    fn test_push_get_pop_round_trip() -> Result<(), Box<dyn Error>> {
        let platform = test_platform()?;
        let device = platform.get_device(0)?;
        for ctx in [
            device.primary_context()?,
            device.create_context(ContextFlags::MAP_HOST)?,
        ] {
            CurrentContext::push(&ctx)?;
            assert_eq!(CurrentContext::get_current()?, ctx);
            assert_eq!(platform.current_raw()?, ctx.as_raw());
            assert_eq!(CurrentContext::pop()?, ctx);
            assert!(platform.current_raw()?.is_null());
        }
        Ok(())
    }

    #[test]
    fn test_pop_restores_entry_below() -> Result<(), Box<dyn Error>> {
        let platform = test_platform()?;
        let device = platform.get_device(0)?;
        let x = device.create_context(ContextFlags::empty())?;
        let y = device.create_context(ContextFlags::empty())?;

        let mut stack = ContextStack::new();
        stack.push(&x)?;
        stack.push(&y)?;
        assert_eq!(stack.pop()?, y);
        assert_eq!(platform.current_raw()?, x.as_raw());
        assert_eq!(stack.pop()?, x);
        assert_eq!(stack.pop().unwrap_err(), DevError::EmptyStack);
        assert!(platform.current_raw()?.is_null());
        Ok(())
    }

    #[test]
    fn test_set_keeps_depth() -> Result<(), Box<dyn Error>> {
        let platform = test_platform()?;
        let device = platform.get_device(0)?;
        let x = device.create_context(ContextFlags::empty())?;
        let y = device.create_context(ContextFlags::empty())?;

        let mut stack = ContextStack::new();
        stack.push(&x)?;
        stack.set(&x)?;
        stack.set(&y)?;
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.get()?, y);
        assert_eq!(platform.current_raw()?, y.as_raw());
        stack.clear()?;
        Ok(())
    }

    #[test]
    fn test_set_on_empty_stack_pushes() -> Result<(), Box<dyn Error>> {
        let platform = test_platform()?;
        let ctx = platform.get_device(0)?.primary_context()?;
        assert_eq!(CurrentContext::depth(), 0);
        CurrentContext::set_current(&ctx)?;
        assert_eq!(CurrentContext::depth(), 1);
        assert_eq!(CurrentContext::get_current()?, ctx);
        assert_eq!(CurrentContext::pop()?, ctx);
        Ok(())
    }

    #[test]
    fn test_get_on_empty_stack() {
        assert_eq!(
            CurrentContext::get_current().unwrap_err(),
            DevError::NoCurrentContext
        );
        assert_eq!(CurrentContext::pop().unwrap_err(), DevError::EmptyStack);
    }

    #[test]
    fn test_get_detects_bypassed_stack() -> Result<(), Box<dyn Error>> {
        let platform = test_platform()?;
        let device = platform.get_device(0)?;
        let x = device.create_context(ContextFlags::empty())?;
        let y = device.create_context(ContextFlags::empty())?;

        let mut stack = ContextStack::new();
        stack.push(&x)?;
        platform.driver().ctx_set_current(y.as_raw());
        assert_eq!(stack.get().unwrap_err(), DevError::StackInconsistency);
        Ok(())
    }

    #[test]
    fn test_failed_push_leaves_stack_alone() -> Result<(), Box<dyn Error>> {
        let platform = test_platform()?;
        let device = platform.get_device(0)?;
        let x = device.create_context(ContextFlags::empty())?;
        let doomed = device.create_context(ContextFlags::empty())?;
        platform.driver().ctx_destroy(doomed.as_raw());

        let mut stack = ContextStack::new();
        stack.push(&x)?;
        assert!(matches!(stack.push(&doomed), Err(DevError::Platform(_))));
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.get()?, x);
        Ok(())
    }

    #[test]
    fn test_stack_entries_keep_contexts_alive() -> Result<(), Box<dyn Error>> {
        let platform = test_platform()?;
        let ctx = platform.get_device(0)?.create_context(ContextFlags::empty())?;
        let raw = ctx.as_raw();
        CurrentContext::push(&ctx)?;
        drop(ctx);
        let current = CurrentContext::get_current()?;
        assert_eq!(current.as_raw(), raw);
        assert_eq!(current.holders(), 2);
        drop(current);
        CurrentContext::pop()?;
        Ok(())
    }

    #[test]
    fn test_with_override_closure() -> Result<(), Box<dyn Error>> {
        let platform = test_platform()?;
        let device = platform.get_device(0)?;
        let outer = device.primary_context()?;
        let inner = device.create_context(ContextFlags::empty())?;

        CurrentContext::push(&outer)?;
        let seen = CurrentContext::with_override(&inner, CurrentContext::get_current)??;
        assert_eq!(seen, inner);
        assert_eq!(CurrentContext::get_current()?, outer);
        assert_eq!(CurrentContext::pop()?, outer);

        let mut stack = ContextStack::new();
        let depth = stack.with_override(&inner, |stack| {
            stack.with_override(&outer, |stack| stack.depth())
        })??;
        assert_eq!(depth, 2);
        assert!(stack.is_empty());
        Ok(())
    }
}
