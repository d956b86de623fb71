//! Crate error type and the context helpers used to wrap it.

use std::fmt::Debug;

pub mod error;
pub mod result;

/// Attaches the object being worked on and the function that failed.
pub trait WithDebugObjectAndFnName<S: Into<String>, O: Debug + Send + 'static> {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self;
}

/// Wraps an error under a human-readable message.
pub trait WithMsg<S: Into<String>> {
    fn with_msg(self, msg: S) -> Self;
}
