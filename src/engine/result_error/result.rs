use crate::engine::result_error::error::Error;
use crate::engine::result_error::{WithDebugObjectAndFnName, WithMsg};
use std::fmt::Debug;

pub type Result<T> = std::result::Result<T, Error>;

impl<S: Into<String>, O: Debug + Send + 'static, R> WithDebugObjectAndFnName<S, O> for Result<R> {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        self.map_err(|e| e.with_debug_object_and_fn_name(obj, fn_name))
    }
}

impl<R, S: Into<String>> WithMsg<S> for Result<R> {
    fn with_msg(self, msg: S) -> Self {
        self.map_err(|e| e.with_msg(msg))
    }
}

/// Collapses a pipeline's status code into a `Result`, the way the tools report it.
pub fn status_to_result<F: FnOnce(i32) -> Error>(status: i32, on_failure: F) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(on_failure(status))
    }
}
