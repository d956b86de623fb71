pub mod bu;
pub mod command;
pub mod config;
pub mod format;
pub mod gc;
pub mod labels;
pub mod lookup;
pub mod partition;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod result_error;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod ui;
pub mod validate;
pub mod volume;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
