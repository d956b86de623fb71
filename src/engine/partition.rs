//! Backup and restore of a single partition.
//!
//! Raw-media partitions (`mtd`, `bml`, `emmc`) are imaged whole through the volume collaborator
//! and never touch the handler registry. Everything else is mounted, scanned for a progress
//! estimate and handed to the resolved handler.

use crate::engine::config::NandroidConfig;
use crate::engine::format::{BackupHandler, RestoreHandler};
use crate::engine::gc;
use crate::engine::labels::{self, RELABEL_EXCLUDE};
use crate::engine::pipeline::Nandroid;
use crate::engine::lookup::{locate_backup_artifact, ArtifactLookup};
use crate::engine::progress::{estimate_entries, run_streaming};
use crate::engine::registry::{
    backup_artifact, backup_pipeline, resolve_backup_strategy, resolve_restore_strategy,
    restore_pipeline,
};
use crate::engine::command::ProcessSpawner;
use crate::engine::result_error::error::Error;
use crate::engine::result_error::result::Result;
use crate::engine::session::BackupSession;
use crate::engine::ui::Ui;
use crate::engine::volume::{partition_name, FsType, PartitionDescriptor, RawTarget, Volumes};
use std::fs::File;
use std::path::{Path, PathBuf};

const DATA: &str = "/data";
const DATA_MEDIA: &str = "/data/media";

/// Where partition backups are written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupTarget {
    Directory(PathBuf),
    /// This process's standard output.
    Stream,
}

/// Where partition backups are read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreSource {
    Directory(PathBuf),
    /// This process's standard input.
    Stream,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionOutcome {
    Completed,
    /// Nothing to do: the device lacks the partition or the backup lacks its artifact.
    Skipped,
}

#[derive(Clone, Copy, Debug)]
enum PartitionPhase {
    Mounting,
    ScanningForProgressEstimate,
    Locating,
    Formatting,
    Running,
    Labeling,
}

fn enter(mount_point: &Path, phase: PartitionPhase) {
    tracing::debug!("{}: {:?}", mount_point.display(), phase);
}

fn raw_image(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.img"))
}

impl<V: Volumes, U: Ui, P: ProcessSpawner> Nandroid<V, U, P> {
    fn is_data_media_data(&self, path: &Path) -> bool {
        path == Path::new(DATA) && self.volumes.is_data_media()
    }

    /// Reads whether the user asked for file-by-file progress to be hidden.
    fn progress_wanted(&mut self) -> bool {
        let marker = self.config.hide_progress_path();
        if let Err(e) = self.volumes.ensure_mounted(&marker) {
            tracing::debug!("Primary storage unavailable for {:?}: {}", marker, e);
        }
        !marker.exists()
    }

    /// Backs up the partition mounted at `root`, as a raw image when its media calls for one.
    pub fn backup_partition(
        &mut self,
        session: &mut BackupSession,
        target: &BackupTarget,
        root: &Path,
    ) -> Result<PartitionOutcome> {
        let Some(volume) = self.volumes.volume_for_path(root) else {
            tracing::info!("No volume for {:?}, skipping backup", root);
            return Ok(PartitionOutcome::Skipped);
        };
        if !volume.fs_type().is_raw() {
            return self.backup_partition_extended(session, target, root, true);
        }

        let name = partition_name(root);
        let raw_target = match target {
            BackupTarget::Directory(dir) => RawTarget::File(raw_image(dir, &name)),
            BackupTarget::Stream => RawTarget::Stream,
        };
        self.ui.print(&format!("Backing up {name} image..."));
        self.volumes
            .backup_raw(&volume, &raw_target)
            .inspect_err(|_| self.ui.print(&format!("Error while backing up {name} image!")))?;
        self.ui.print(&format!("Backup of {name} image completed."));
        Ok(PartitionOutcome::Completed)
    }

    /// Backs up the files below `mount_point` with the handler the registry resolves.
    ///
    /// `mount_point` may also be a directory inside a volume. The volume stays mounted
    /// afterwards unless `unmount_when_finished` is set.
    pub fn backup_partition_extended(
        &mut self,
        session: &mut BackupSession,
        target: &BackupTarget,
        mount_point: &Path,
        unmount_when_finished: bool,
    ) -> Result<PartitionOutcome> {
        let name = partition_name(mount_point);
        let progress = self.progress_wanted();
        session.set_progress_enabled(progress);

        self.ui.print(&format!("Backing up {name}..."));
        enter(mount_point, PartitionPhase::Mounting);
        self.volumes
            .ensure_mounted(mount_point)
            .inspect_err(|_| self.ui.print(&format!("Can't mount {}!", mount_point.display())))?;

        enter(mount_point, PartitionPhase::ScanningForProgressEstimate);
        let exclude = self
            .is_data_media_data(mount_point)
            .then(|| Path::new(DATA_MEDIA));
        let estimate = estimate_entries(&self.spawner, &self.config.tools().find, mount_point, exclude);
        session.progress_mut().reset(estimate);
        self.ui.reset_progress();
        self.ui.show_progress();

        let filesystem = self
            .volumes
            .volume_for_path(mount_point)
            .and_then(|v| self.volumes.mounted_filesystem(v.mount_point()))
            .unwrap_or_else(|| FsType::Auto.to_string());
        let stem = match target {
            BackupTarget::Directory(dir) => dir.join(format!("{name}.{filesystem}")),
            BackupTarget::Stream => PathBuf::new(),
        };

        let handler = resolve_backup_strategy(session, &self.volumes, mount_point)
            .map_err(|e| {
                self.ui.print("Error finding an appropriate backup handler.");
                Error::HandlerNotFound {
                    path: mount_point.into(),
                    error: Box::new(e),
                }
            })?;

        enter(mount_point, PartitionPhase::Running);
        let res = self.run_backup_handler(session, handler, mount_point, &stem);

        if labels::is_labeled(mount_point) && self.labels.is_some() {
            match (&res, target) {
                (Ok(()), BackupTarget::Directory(dir)) => {
                    self.capture_labels(mount_point, &labels::labels_file(dir, &name))
                }
                _ => tracing::info!("Skipping security labels of {:?}", mount_point),
            }
        }

        if unmount_when_finished {
            if let Err(e) = self.volumes.ensure_unmounted(mount_point) {
                tracing::warn!("Unmounting {:?} after backup failed: {}", mount_point, e);
            }
        }
        if let Err(e) = res {
            self.ui.print(&format!(
                "Error while making a backup image of {}!",
                mount_point.display()
            ));
            return Err(e);
        }
        self.ui.print(&format!("Backup of {name} completed."));
        Ok(PartitionOutcome::Completed)
    }

    fn capture_labels(&mut self, root: &Path, labels_file: &Path) {
        let Some(labels) = self.labels.as_mut() else {
            return;
        };
        enter(root, PartitionPhase::Labeling);
        self.ui.print("Backing up selinux context...");
        match labels.capture_labels(root, labels_file) {
            Ok(()) => self.ui.print("Backup selinux context completed."),
            Err(e) => tracing::warn!("Backup selinux context error: {}", e),
        }
    }

    fn run_backup_handler(
        &mut self,
        session: &mut BackupSession,
        handler: BackupHandler,
        source: &Path,
        stem: &Path,
    ) -> Result<()> {
        let run_dir = stem.parent().unwrap_or(Path::new("."));
        let blob_dir = self.config.blob_dir_for(run_dir);
        match handler {
            BackupHandler::Tar | BackupHandler::TarGz => {
                // parts are appended as `<artifact>.a`, ...; the bare name marks the archive
                if let Some(artifact) = backup_artifact(handler, stem) {
                    File::create(artifact)?;
                }
            }
            BackupHandler::Dedupe => {
                std::fs::create_dir_all(&blob_dir)?;
                gc::maybe_collect(session, &self.spawner, &mut self.ui, &self.config, &blob_dir);
            }
            BackupHandler::Yaffs2Image | BackupHandler::TarDump => {}
        }
        let pipeline = backup_pipeline(
            &self.config,
            handler,
            source,
            stem,
            &blob_dir,
            self.is_data_media_data(source),
        );
        run_streaming(&self.spawner, &mut self.ui, session, &pipeline)
    }

    /// Restores the partition mounted at `root`, from a raw image when its media calls for one.
    pub fn restore_partition(
        &mut self,
        session: &mut BackupSession,
        source: &RestoreSource,
        root: &Path,
    ) -> Result<PartitionOutcome> {
        let Some(volume) = self.volumes.volume_for_path(root) else {
            tracing::info!("No volume for {:?}, skipping restore", root);
            return Ok(PartitionOutcome::Skipped);
        };
        if !volume.fs_type().is_raw() {
            return self.restore_partition_extended(session, source, root, true);
        }

        let name = partition_name(root);
        let raw_source = match source {
            RestoreSource::Directory(dir) => {
                let image = raw_image(dir, &name);
                if !image.exists() {
                    self.ui.print(&format!(
                        "{name} file not found. Skipping restore of {}.",
                        root.display()
                    ));
                    return Ok(PartitionOutcome::Skipped);
                }
                RawTarget::File(image)
            }
            RestoreSource::Stream => RawTarget::Stream,
        };
        self.ui.print(&format!("Erasing {name} before restore..."));
        self.volumes
            .format_volume(root)
            .inspect_err(|_| self.ui.print(&format!("Error while erasing {name} image!")))?;
        self.ui.print(&format!("Restoring {name} image..."));
        self.volumes
            .restore_raw(&volume, &raw_source)
            .inspect_err(|_| self.ui.print(&format!("Error while flashing {name} image!")))?;
        Ok(PartitionOutcome::Completed)
    }

    /// Restores the files below `mount_point` from the artifact found in `source`.
    ///
    /// The target is reformatted with the filesystem the artifact names, or cleared when the
    /// clear policy says so. A missing artifact skips the partition.
    pub fn restore_partition_extended(
        &mut self,
        session: &mut BackupSession,
        source: &RestoreSource,
        mount_point: &Path,
        unmount_when_finished: bool,
    ) -> Result<PartitionOutcome> {
        let name = partition_name(mount_point);
        let volume = self.volumes.volume_for_path(mount_point);
        let volume_root = volume.as_ref().filter(|v| v.mount_point() == mount_point);

        enter(mount_point, PartitionPhase::Locating);
        let (artifact, filesystem, handler) = match source {
            RestoreSource::Stream => (
                PathBuf::new(),
                volume_root.map(|v| v.fs_type().clone()),
                Some(RestoreHandler::TarUndump),
            ),
            RestoreSource::Directory(dir) => match locate_backup_artifact(dir, &name, Path::exists) {
                ArtifactLookup::Legacy(path) => (path, None, None),
                ArtifactLookup::Found(candidate) => {
                    tracing::info!("Found new backup image: {:?}", candidate.path());
                    let handler = candidate.restore_handler();
                    (candidate.path().clone(), Some(candidate.filesystem().clone()), Some(handler))
                }
                ArtifactLookup::NotFound => {
                    self.ui.print(&format!(
                        "{name} file not found. Skipping restore of {}.",
                        mount_point.display()
                    ));
                    return Ok(PartitionOutcome::Skipped);
                }
            },
        };

        let progress = self.progress_wanted();
        session.set_progress_enabled(progress);
        session.progress_mut().reset(0);

        self.ui.print(&format!("Restoring {name}..."));
        enter(mount_point, PartitionPhase::Formatting);
        let reformat = reformat_with(
            &self.config,
            volume_root,
            filesystem,
            self.is_data_media_data(mount_point),
        );
        let formatted = match (&reformat, volume_root) {
            (Some(fs), Some(v)) => self.volumes.format_device(v.blk_device(), mount_point, fs),
            _ => self.volumes.format_volume(mount_point),
        };
        formatted.map_err(|e| {
            self.ui.print(&format!("Error while formatting {}!", mount_point.display()));
            Error::Format {
                path: mount_point.into(),
                error: Box::new(e),
            }
        })?;

        enter(mount_point, PartitionPhase::Mounting);
        self.volumes
            .ensure_mounted(mount_point)
            .inspect_err(|_| self.ui.print(&format!("Can't mount {}!", mount_point.display())))?;

        let handler = match handler {
            Some(handler) => handler,
            None => resolve_restore_strategy(
                session,
                &self.volumes,
                mount_point,
                *self.config.prefer_tar(),
            )
            .map_err(|e| {
                self.ui.print("Error finding an appropriate restore handler.");
                Error::HandlerNotFound {
                    path: mount_point.into(),
                    error: Box::new(e),
                }
            })?,
        };

        enter(mount_point, PartitionPhase::Running);
        restore_pipeline(&self.config, handler, &artifact, mount_point)
            .and_then(|pipeline| run_streaming(&self.spawner, &mut self.ui, session, &pipeline))
            .inspect_err(|_| {
                self.ui
                    .print(&format!("Error while restoring {}!", mount_point.display()))
            })?;

        if labels::is_labeled(mount_point) && self.labels.is_some() {
            match source {
                RestoreSource::Directory(dir) => {
                    self.restore_labels(mount_point, &labels::labels_file(dir, &name))?
                }
                RestoreSource::Stream => {
                    tracing::warn!("Cannot restore security labels of {:?} from a stream", mount_point)
                }
            }
        }

        if unmount_when_finished {
            if let Err(e) = self.volumes.ensure_unmounted(mount_point) {
                tracing::warn!("Unmounting {:?} after restore failed: {}", mount_point, e);
            }
        }
        Ok(PartitionOutcome::Completed)
    }

    fn restore_labels(&mut self, root: &Path, labels_file: &Path) -> Result<()> {
        let Some(labels) = self.labels.as_mut() else {
            return Ok(());
        };
        enter(root, PartitionPhase::Labeling);
        self.ui.print("Restoring selinux context...");
        if let Err(e) = labels.restore_labels(Some(labels_file), root, Path::new(RELABEL_EXCLUDE)) {
            tracing::debug!("Labels from {:?} not applied: {}", labels_file, e);
            self.ui.print(&format!(
                "Restorecon from {}.context error, trying regular restorecon.",
                partition_name(root)
            ));
            labels
                .restore_labels(None, root, Path::new(RELABEL_EXCLUDE))
                .map_err(|e| Error::Labels {
                    path: root.into(),
                    error: Box::new(e),
                })
                .inspect_err(|e| tracing::error!("{}", e))?;
        }
        self.ui.print("Restore selinux context completed.");
        Ok(())
    }
}

/// Filesystem to recreate the target with, or `None` when it is cleared instead.
///
/// Targets that are not a volume's own mount point are always cleared.
fn reformat_with(
    config: &NandroidConfig,
    volume_root: Option<&PartitionDescriptor>,
    filesystem: Option<FsType>,
    is_data_media_data: bool,
) -> Option<FsType> {
    let declared = volume_root?.fs_type();
    let filesystem = filesystem?;
    (!config
        .clear_policy()
        .should_clear(Some(declared), is_data_media_data))
    .then_some(filesystem)
}
