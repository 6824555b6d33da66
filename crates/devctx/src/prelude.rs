//! This module re-exports a number of commonly-used types for working with devctx.
//!
//! This allows the user to `use devctx::prelude::*;` and have the most commonly-used types
//! available quickly.

pub use crate::context::{
    CacheConfig, Context, ContextFlags, ContextStack, CurrentContext, ResourceLimit,
    ScopedOverride, SharedMemoryConfig,
};
pub use crate::device::{Device, Platform};
pub use crate::error::{DevError, DevResult};
pub use crate::InitFlags;
