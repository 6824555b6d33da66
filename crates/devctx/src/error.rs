//! Types for error handling
//!
//! # Error handling in devctx:
//!
//! Every fallible operation returns a [`DevResult`]. Errors reported by the driver keep their
//! original [`Status`] inside [`DevError::Platform`] unless they have a more specific meaning to
//! the context stack (an invalid device ordinal, exhausted context resources, a rejected limit).
//!
//! [`DevError::StackInconsistency`] is different from the rest: it means the push/pop discipline
//! of a context stack was broken by the caller, and it is never recovered from silently.

use crate::sys::Status;
use std::error::Error;
use std::fmt;

/// Error enum which represents everything that can go wrong while managing contexts.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DevError {
    /// The device ordinal is outside the enumerated range.
    InvalidDevice,
    /// A pop was attempted on a stack without entries.
    EmptyStack,
    /// No context is current on the calling thread.
    NoCurrentContext,
    /// The platform could not allocate the state for a new context.
    ResourceExhausted,
    /// The platform rejected the requested resource limit value.
    InvalidLimitValue,
    /// The context stack and the platform disagree about what is current, or a scoped override
    /// found something other than its own context on top of the stack.
    StackInconsistency,
    /// Any other non-success status from the driver, preserved verbatim.
    Platform(Status),
}

impl DevError {
    /// The driver status code behind this error, if it came from the driver.
    pub fn code(&self) -> Option<u32> {
        match self {
            DevError::Platform(status) => Some(status.code()),
            DevError::InvalidDevice => Some(Status::InvalidDevice.code()),
            DevError::ResourceExhausted => Some(Status::OutOfMemory.code()),
            DevError::InvalidLimitValue => Some(Status::InvalidValue.code()),
            _ => None,
        }
    }
}

impl fmt::Display for DevError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DevError::InvalidDevice => write!(f, "Invalid device ordinal"),
            DevError::EmptyStack => write!(f, "The context stack is empty"),
            DevError::NoCurrentContext => write!(f, "No context is current on this thread"),
            DevError::ResourceExhausted => write!(f, "Out of resources for a new context"),
            DevError::InvalidLimitValue => write!(f, "Resource limit value rejected by the platform"),
            DevError::StackInconsistency => write!(f, "Context stack discipline violated"),
            DevError::Platform(status) => write!(f, "Platform error: {status}"),
        }
    }
}

impl Error for DevError {}

/// Result type for most devctx functions.
pub type DevResult<T> = Result<T, DevError>;

/// Special result type for `drop` functions which includes the un-dropped value with the error.
pub type DropResult<T> = Result<(), (DevError, T)>;

pub(crate) trait ToResult {
    fn to_result(self) -> DevResult<()>;
}

impl ToResult for Status {
    fn to_result(self) -> DevResult<()> {
        match self {
            Status::Success => Ok(()),
            Status::InvalidDevice => Err(DevError::InvalidDevice),
            Status::OutOfMemory => Err(DevError::ResourceExhausted),
            other => Err(DevError::Platform(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Status::Success.to_result(), Ok(()));
        assert_eq!(Status::InvalidDevice.to_result(), Err(DevError::InvalidDevice));
        assert_eq!(Status::OutOfMemory.to_result(), Err(DevError::ResourceExhausted));
        assert_eq!(
            Status::ContextIsDestroyed.to_result(),
            Err(DevError::Platform(Status::ContextIsDestroyed))
        );
    }

    #[test]
    fn test_platform_code_is_preserved() {
        let err = DevError::Platform(Status::DeviceUnavailable);
        assert_eq!(err.code(), Some(46));
        assert_eq!(DevError::EmptyStack.code(), None);
        assert!(err.to_string().contains("code 46"));
    }
}
