use crate::engine::result_error::{WithDebugObjectAndFnName, WithMsg};
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

/// Status reported when an external tool could not be started at all.
pub const TOOL_LAUNCH_STATUS: i32 = -1;
/// Status reported when no backup or restore handler could be resolved.
pub const HANDLER_NOT_FOUND_STATUS: i32 = -2;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error("Unable to find volume for {0:?}")]
    VolumeNotFound(PathBuf),
    #[error("Unable to find mounted volume: {0:?}")]
    NotMounted(PathBuf),
    #[error("Can't mount {}:\n{}", mount_point.display(), indent::indent_all_with("  ", error.to_string()))]
    Mount {
        mount_point: PathBuf,
        error: Box<Error>,
    },
    #[error("Error while formatting {}:\n{}", path.display(), indent::indent_all_with("  ", error.to_string()))]
    Format { path: PathBuf, error: Box<Error> },
    #[error("Unable to execute {program}: {error}")]
    ToolLaunch {
        program: String,
        error: std::io::Error,
    },
    #[error("{program} exited with status {status}")]
    ToolExit { program: String, status: i32 },
    #[error("Error finding an appropriate handler for {}:\n{}", path.display(), indent::indent_all_with("  ", error.to_string()))]
    HandlerNotFound { path: PathBuf, error: Box<Error> },
    #[error("Can't use backup path {0:?}")]
    BackupPathUnavailable(PathBuf),
    #[error("Checksum verification failed for {}", .0.display())]
    Verification(PathBuf),
    #[error("Restoring security labels of {} failed:\n{}", path.display(), indent::indent_all_with("  ", error.to_string()))]
    Labels { path: PathBuf, error: Box<Error> },
    #[error("{0}")]
    Usage(String),
    #[error("Unknown partition {0:?}")]
    UnknownPartition(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl Error {
    /// Numeric status of the failure, as seen by the device pipeline and the process exit code.
    ///
    /// A tool that ran and failed reports its own exit code. Wrappers report the status of the
    /// error they wrap.
    pub fn status(&self) -> i32 {
        match self {
            Error::ToolExit { status, .. } => *status,
            Error::ToolLaunch { .. } => TOOL_LAUNCH_STATUS,
            Error::HandlerNotFound { .. } => HANDLER_NOT_FOUND_STATUS,
            Error::Mount { error, .. }
            | Error::Format { error, .. }
            | Error::Labels { error, .. } => error.status(),
            Error::WithMsg { error, .. } | Error::WithDebugObjAndFnName { error, .. } => {
                error.status()
            }
            _ => 1,
        }
    }
}
