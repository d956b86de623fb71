//! Content-store garbage-collection gate.
//!
//! The blob store is shared by every backup under the same tree and is kept alive only by the
//! `.dup` descriptors of earlier runs. Collection therefore runs once per backup run, before
//! the run writes any descriptor of its own.

use crate::engine::command::{Capture, ProcessSpawner, ToolCommand, ToolPipeline};
use crate::engine::config::NandroidConfig;
use crate::engine::session::BackupSession;
use crate::engine::ui::Ui;
use itertools::Itertools;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DESCRIPTOR_EXT: &str = "dup";

/// Collects garbage in `blob_dir` unless this session already did.
///
/// Failure only means space is not reclaimed; it is logged and the run continues.
pub fn maybe_collect(
    session: &mut BackupSession,
    spawner: &dyn ProcessSpawner,
    ui: &mut dyn Ui,
    config: &NandroidConfig,
    blob_dir: &Path,
) {
    if !session.mark_gc_collected() {
        tracing::trace!("Blob store already collected this run");
        return;
    }

    ui.print("Freeing space...");
    let descriptors = find_descriptors(config.descriptor_root_for(blob_dir));
    tracing::info!(
        "Collecting garbage in {:?} against {} descriptors",
        blob_dir,
        descriptors.len()
    );
    let pipeline = ToolPipeline::single(
        ToolCommand::new(&config.tools().dedupe)
            .arg("gc")
            .arg(blob_dir)
            .args(&descriptors),
        Capture::Stdout,
    );
    match spawner.spawn_streaming(&pipeline, &mut |line| tracing::trace!("{}", line.trim_end())) {
        Ok(0) => {}
        Ok(status) => tracing::warn!("Blob store collection exited with status {}", status),
        Err(e) => tracing::warn!("Blob store collection failed: {}", e),
    }
    ui.print("Done freeing space.");
}

/// Every `.dup` descriptor below `root`. A missing root has none.
pub fn find_descriptors<P: AsRef<Path>>(root: P) -> Vec<PathBuf> {
    WalkDir::new(root.as_ref())
        .into_iter()
        .filter_map(|res| match res {
            Ok(de) => Some(de),
            Err(e) => {
                tracing::debug!("Skipping unreadable entry while searching descriptors: {}", e);
                None
            }
        })
        .filter(|de| de.file_type().is_file())
        .map(|de| de.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == DESCRIPTOR_EXT))
        .sorted()
        .collect()
}
