//! Optional security-label collaborator.
//!
//! Devices that enforce file security labels need them captured next to each archive and
//! reapplied after extraction. The engine only calls into this interface when a labels backend
//! has been attached with [`Nandroid::with_labels`](crate::engine::pipeline::Nandroid::with_labels).

use crate::engine::result_error::result::Result;
use std::path::{Path, PathBuf};

/// Partitions whose labels are captured and restored.
pub const LABELED_PARTITIONS: [&str; 3] = ["/data", "/system", "/cache"];

/// Subtree skipped when relabeling from policy.
pub const RELABEL_EXCLUDE: &str = "/data/media/";

pub trait SecurityLabels {
    /// Records the label of every entry below `root` into `labels_file`.
    fn capture_labels(&mut self, root: &Path, labels_file: &Path) -> Result<()>;

    /// Reapplies labels below `root`, from `labels_file` when given, otherwise from the
    /// device's labeling policy, skipping `exclude`.
    fn restore_labels(&mut self, labels_file: Option<&Path>, root: &Path, exclude: &Path) -> Result<()>;
}

pub fn is_labeled<P: AsRef<Path>>(mount_point: P) -> bool {
    LABELED_PARTITIONS
        .iter()
        .any(|p| mount_point.as_ref() == Path::new(p))
}

/// `<backup dir>/<name>.context`
pub fn labels_file<P: AsRef<Path>>(backup_dir: P, name: &str) -> PathBuf {
    backup_dir.as_ref().join(format!("{name}.context"))
}
