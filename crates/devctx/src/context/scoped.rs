use super::{Context, ContextStack, CurrentContext};
use crate::error::{DevError, DevResult};
use crate::private::Sealed;
use std::marker::PhantomData;
use std::thread;
use tracing::{error, trace};

/// A context stack a [`ScopedOverride`] can push onto.
///
/// Implemented for [`ThreadStack`] (the calling thread's stack behind [`CurrentContext`]) and for
/// `&mut ContextStack`. This trait is sealed.
pub trait StackHandle: Sealed {
    #[doc(hidden)]
    fn with_stack<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut ContextStack) -> R;
}

/// The calling thread's context stack, as used by [`CurrentContext`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadStack;

impl Sealed for ThreadStack {}

impl StackHandle for ThreadStack {
    fn with_stack<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut ContextStack) -> R,
    {
        CurrentContext::with_stack(f)
    }
}

impl Sealed for &mut ContextStack {}

impl StackHandle for &mut ContextStack {
    fn with_stack<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut ContextStack) -> R,
    {
        f(&mut **self)
    }
}

/// Makes a context current for as long as the guard lives.
///
/// Creating the guard pushes the context; dropping it pops the context again, on every way out
/// of the scope: normal exit, `?`, or unwinding. Guards nest in LIFO order.
///
/// Dropping the guard when something else is on top of the stack means the push/pop discipline
/// was broken. The guard then pops whatever is on top so the stack and the driver agree again,
/// and logs the inconsistency; debug builds panic as well. Use [`finish`](Self::finish) instead
/// of dropping to get the inconsistency back as a [`DevError::StackInconsistency`].
///
/// The guard is tied to the thread that created it and is neither `Send` nor `Sync`.
#[must_use = "the context is popped again as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ScopedOverride<S: StackHandle = ThreadStack> {
    stack: S,
    ctx: Context,
    armed: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl ScopedOverride<ThreadStack> {
    /// Push `ctx` onto the calling thread's stack until the guard is dropped.
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
    /// CurrentContext::push(&outer)?;
    /// {
    ///     let _guard = ScopedOverride::new(&inner)?;
    ///     assert_eq!(CurrentContext::get_current()?, inner);
    /// }
    /// assert_eq!(CurrentContext::get_current()?, outer);
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(ctx: &Context) -> DevResult<Self> {
        Self::on(ThreadStack, ctx)
    }
}

impl<'a> ScopedOverride<&'a mut ContextStack> {
    /// The stack this guard pushed onto, for nesting further overrides on it.
    pub fn stack(&mut self) -> &mut ContextStack {
        &mut *self.stack
    }
}

impl<S: StackHandle> ScopedOverride<S> {
    /// Push `ctx` onto `stack` until the guard is dropped.
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
    /// {
    ///     let mut guard = ScopedOverride::on(&mut stack, &ctx)?;
    ///     assert_eq!(guard.stack().get()?, ctx);
    /// }
    /// assert!(stack.is_empty());
    /// # Ok(())
    /// # }
    /// ```
    pub fn on(mut stack: S, ctx: &Context) -> DevResult<Self> {
        stack.with_stack(|stack| stack.push(ctx))?;
        Ok(Self {
            stack,
            ctx: ctx.clone(),
            armed: true,
            _thread_bound: PhantomData,
        })
    }

    /// The context this guard made current.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Pop the context now and report how it went.
    ///
    /// Fails with [`DevError::StackInconsistency`] if the top of the stack is not the context
    /// this guard pushed. The stack is then left untouched.
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
    /// let a = device.primary_context()?;
    /// let b = device.create_context(ContextFlags::MAP_HOST)?;
    /// let guard = ScopedOverride::new(&a)?;
    /// CurrentContext::set_current(&b)?;
    /// assert_eq!(guard.finish(), Err(DevError::StackInconsistency));
    /// # CurrentContext::pop()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn finish(mut self) -> DevResult<()> {
        self.armed = false;
        let expected = &self.ctx;
        self.stack.with_stack(|stack| match stack.top() {
            Some(top) if top == expected => stack.pop().map(drop),
            top => {
                error!(
                    expected = %expected.as_raw(),
                    found = ?top.map(Context::as_raw),
                    "scoped override finished out of order"
                );
                Err(DevError::StackInconsistency)
            }
        })
    }
}

impl<S: StackHandle> Drop for ScopedOverride<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let expected = &self.ctx;
        let restored = self.stack.with_stack(|stack| match stack.top() {
            Some(top) if top == expected => stack.pop().map(|_| true),
            Some(_) => stack.pop().map(|_| false),
            None => Ok(false),
        });
        match restored {
            Ok(true) => trace!(handle = %expected.as_raw(), "scoped override ended"),
            Ok(false) => {
                error!(
                    expected = %expected.as_raw(),
                    "context stack discipline violated, popped the top entry instead"
                );
                if cfg!(debug_assertions) && !thread::panicking() {
                    panic!(
                        "scoped override for {} did not find its context on top of the stack",
                        expected
                    );
                }
            }
            Err(e) => error!(
                expected = %expected.as_raw(),
                error = %e,
                "failed to restore the previous context"
            ),
        }
    }
}
