//! Error types shared by every layer of the crate.
//!
//! Recoverable failures are returned as [`Error`]. Failures of the native layer are first
//! reported to the device's [`DebugCallback`] together with the failing call, then folded into
//! [`Error::Fail`] (or [`Error::OutOfMemory`] when the native allocator ran dry), so backend
//! specific error codes never cross the public API.

use std::borrow::Cow;

use crate::{
    debug::{DebugCallback, DebugMessageSource, DebugMessageType},
    native::NativeError,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The caller violated an API contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An allocator is exhausted or a native allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The requested capability or native object does not exist.
    #[error("not available: {0}")]
    NotAvailable(&'static str),

    /// A bounded wait did not observe its condition in time.
    #[error("wait timed out")]
    TimeOut,

    #[error("{context}")]
    Fail {
        context: Cow<'static, str>,
        #[source]
        source: Option<NativeError>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn fail(context: impl Into<Cow<'static, str>>) -> Self {
        Error::Fail {
            context: context.into(),
            source: None,
        }
    }
}

#[doc(hidden)]
pub fn report_native_error(
    debug: &dyn DebugCallback,
    error: NativeError,
    call: &'static str,
    file: &'static str,
    line: u32,
) -> Error {
    let context = format!("{call} failed at {file}:{line}: {error}");
    debug.handle_message(DebugMessageType::Error, DebugMessageSource::Driver, &context);
    match error {
        NativeError::OutOfMemory => Error::OutOfMemory,
        other => Error::Fail {
            context: context.into(),
            source: Some(other),
        },
    }
}

/// Evaluates a native driver call and converts its error, reporting the call site to the
/// device's debug callback.
macro_rules! native_call {
    ($device:expr, $call:expr) => {
        match $call {
            Ok(value) => Ok(value),
            Err(error) => Err($crate::error::report_native_error(
                $device.debug_callback(),
                error,
                stringify!($call),
                file!(),
                line!(),
            )),
        }
    };
}
pub(crate) use native_call;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::DebugMessageLog;

    #[test]
    fn native_errors_are_reported_before_conversion() {
        let log = DebugMessageLog::default();
        let err = report_native_error(
            &log,
            NativeError::InvalidHandle,
            "driver.record_event(event, stream)",
            "sync.rs",
            42,
        );
        assert!(matches!(
            err,
            Error::Fail {
                source: Some(NativeError::InvalidHandle),
                ..
            }
        ));
        let messages = log.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ty, DebugMessageType::Error);
        assert!(messages[0].message.contains("driver.record_event"));
        assert!(messages[0].message.contains("sync.rs:42"));
    }

    #[test]
    fn native_out_of_memory_keeps_its_kind() {
        let log = DebugMessageLog::default();
        let err = report_native_error(&log, NativeError::OutOfMemory, "alloc", "a.rs", 1);
        assert_eq!(err, Error::OutOfMemory);
    }
}
