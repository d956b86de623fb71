//! Device-level backup and restore runs.
//!
//! A run is strictly sequential: partitions are processed in a fixed order and the first one
//! that fails ends the run with its error. Partitions the device or the backup lacks are
//! skipped, never failed.

use crate::engine::command::{Capture, ProcessSpawner, ToolCommand, ToolPipeline};
use crate::engine::config::NandroidConfig;
use crate::engine::format::BackupFormat;
use crate::engine::labels::SecurityLabels;
use crate::engine::partition::{BackupTarget, RestoreSource};
use crate::engine::result_error::error::Error;
use crate::engine::result_error::result::{status_to_result, Result};
use crate::engine::result_error::WithMsg;
use crate::engine::session::BackupSession;
use crate::engine::ui::{BackgroundIcon, Ui};
use crate::engine::volume::{RawTarget, Volumes};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Which categories a restore run touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestoreFlags {
    pub boot: bool,
    pub system: bool,
    pub data: bool,
    pub cache: bool,
    pub sd_ext: bool,
    pub wimax: bool,
}

impl Default for RestoreFlags {
    fn default() -> Self {
        Self {
            boot: true,
            system: true,
            data: true,
            cache: true,
            sd_ext: true,
            wimax: false,
        }
    }
}

/// The backup/restore engine bound to one device's collaborators.
pub struct Nandroid<V: Volumes, U: Ui, P: ProcessSpawner> {
    pub(crate) config: NandroidConfig,
    pub(crate) volumes: V,
    pub(crate) ui: U,
    pub(crate) spawner: P,
    pub(crate) labels: Option<Box<dyn SecurityLabels>>,
}

impl<V: Volumes, U: Ui, P: ProcessSpawner> Nandroid<V, U, P> {
    pub fn new(config: NandroidConfig, volumes: V, ui: U, spawner: P) -> Self {
        Self {
            config,
            volumes,
            ui,
            spawner,
            labels: None,
        }
    }

    /// Enables security-label capture and restore for `/data`, `/system` and `/cache`.
    pub fn with_labels<L: SecurityLabels + 'static>(mut self, labels: L) -> Self {
        self.labels = Some(Box::new(labels));
        self
    }

    pub fn config(&self) -> &NandroidConfig {
        &self.config
    }

    fn configured_format(&mut self) -> BackupFormat {
        let tag_file = self.config.format_file_path();
        if let Err(e) = self.volumes.ensure_mounted(&tag_file) {
            tracing::debug!("Primary storage unavailable for {:?}: {}", tag_file, e);
        }
        BackupFormat::read_default(tag_file)
    }

    fn run_tool(&self, pipeline: ToolPipeline) -> Result<()> {
        let program = pipeline.program();
        let status = self.spawner.spawn_streaming(&pipeline, &mut |line| {
            tracing::debug!("{}: {}", program, line.trim_end());
        })?;
        status_to_result(status, |status| Error::ToolExit { program, status })
    }

    /// Backs every partition up into `backup_path`, created if missing.
    ///
    /// `forced` overrides the persisted default format for this run.
    pub fn backup(&mut self, backup_path: &Path, forced: Option<BackupFormat>) -> Result<()> {
        let configured = self.configured_format();
        let mut session = BackupSession::new(configured, forced);
        tracing::info!(
            "Backing up to {:?} with {} (forced: {:?})",
            backup_path,
            session.default_format(),
            forced
        );
        self.ui.set_background(BackgroundIcon::Installing);

        let res = self.prepare_backup_path(backup_path).and_then(|_| {
            self.volumes.set_perf_mode(true);
            self.backup_partitions(&mut session, backup_path)
        });
        self.finish_run();
        res
    }

    fn prepare_backup_path(&mut self, backup_path: &Path) -> Result<()> {
        self.volumes
            .ensure_mounted(backup_path)
            .inspect_err(|_| self.ui.print("Can't mount backup path."))?;
        self.report_free_space(backup_path)?;
        std::fs::create_dir_all(backup_path)
            .map_err(Error::from)
            .with_msg(format!("Creating backup directory {:?} failed", backup_path))
    }

    /// Puts perf mode and the progress display back, whatever the outcome of the run.
    fn finish_run(&mut self) {
        self.volumes.set_perf_mode(false);
        self.ui.set_background(BackgroundIcon::None);
        self.ui.reset_progress();
    }

    fn report_free_space(&mut self, backup_path: &Path) -> Result<()> {
        let lookup = if self.volumes.is_data_media_volume_path(backup_path) {
            Path::new("/data")
        } else {
            backup_path
        };
        let Some(volume) = self.volumes.volume_for_path(lookup) else {
            self.ui.print("Unable to find volume for backup path.");
            return Err(Error::BackupPathUnavailable(backup_path.into()));
        };
        let free = self
            .volumes
            .free_space(volume.mount_point())
            .inspect_err(|_| self.ui.print("Unable to stat backup path."))?;
        let free_mb = free / BYTES_PER_MB;
        self.ui.print(&format!("SD Card space free: {free_mb}MB"));
        if free_mb < *self.config.low_space_warning_mb() {
            self.ui
                .print("There may not be enough free space to complete backup... continuing...");
        }
        Ok(())
    }

    fn backup_partitions(&mut self, session: &mut BackupSession, backup_path: &Path) -> Result<()> {
        let target = BackupTarget::Directory(backup_path.to_path_buf());

        self.backup_partition(session, &target, Path::new("/boot"))?;
        self.backup_partition(session, &target, Path::new("/recovery"))?;
        self.backup_wimax(backup_path)?;
        self.backup_partition(session, &target, Path::new("/system"))?;
        self.backup_partition(session, &target, Path::new("/preload"))?;
        self.backup_partition(session, &target, Path::new("/data"))?;
        if self.volumes.has_datadata() {
            self.backup_partition(session, &target, Path::new("/datadata"))?;
        }

        let android_secure = self.config.android_secure_path();
        if android_secure.exists() {
            self.backup_partition_extended(session, &target, &android_secure, false)?;
        } else {
            self.ui.print(
                "No .android_secure found. Skipping backup of applications on external storage.",
            );
        }

        self.backup_partition_extended(session, &target, Path::new("/cache"), false)?;

        let sd_ext = Path::new("/sd-ext");
        match self.volumes.volume_for_path(sd_ext) {
            Some(v) if *v.present() => match self.volumes.ensure_mounted(sd_ext) {
                Ok(()) => {
                    self.backup_partition(session, &target, sd_ext)?;
                }
                Err(e) => tracing::info!(
                    "Could not mount sd-ext. sd-ext backup may not be supported on this device. Skipping backup of sd-ext: {}",
                    e
                ),
            },
            _ => tracing::info!("No sd-ext found. Skipping backup of sd-ext."),
        }

        self.ui.print("Generating md5 sum...");
        self.run_tool(ToolPipeline::single(
            ToolCommand::new(&self.config.tools().checksum_generate).arg(backup_path),
            Capture::Stdout,
        ))
        .inspect_err(|_| self.ui.print("Error while generating md5 sum!"))?;

        let log = self.config.session_log();
        if let Err(e) = std::fs::copy(log, backup_path.join("recovery.log")) {
            tracing::warn!("Copying session log {:?} failed: {}", log, e);
        }
        open_permissions(backup_path);
        self.volumes.sync();
        self.ui.print("\nBackup complete!");
        Ok(())
    }

    fn backup_wimax(&mut self, backup_path: &Path) -> Result<()> {
        let Some(volume) = self
            .volumes
            .volume_for_path(Path::new("/wimax"))
            .filter(|v| *v.present())
        else {
            return Ok(());
        };
        self.ui.print("Backing up WiMAX...");
        let image = backup_path.join(wimax_image_name(self.config.serial_number()));
        self.volumes
            .backup_raw(&volume, &RawTarget::File(image))
            .inspect_err(|_| self.ui.print("Error while dumping WiMAX image!"))
    }

    /// Restores the categories selected by `flags` from `backup_path`.
    ///
    /// The checksum manifest is verified before any partition is touched, unless the
    /// skip-checksum marker exists.
    pub fn restore(&mut self, backup_path: &Path, flags: RestoreFlags) -> Result<()> {
        let configured = self.configured_format();
        let mut session = BackupSession::new(configured, None);
        tracing::info!("Restoring from {:?} ({:?})", backup_path, flags);
        self.ui.set_background(BackgroundIcon::Installing);
        self.ui.show_indeterminate_progress();

        let res = self
            .volumes
            .ensure_mounted(backup_path)
            .inspect_err(|_| self.ui.print("Can't mount backup path"))
            .and_then(|_| {
                self.volumes.set_perf_mode(true);
                self.verify_checksums(backup_path)
            })
            .and_then(|_| self.restore_partitions(&mut session, backup_path, flags));
        self.finish_run();
        res
    }

    fn verify_checksums(&mut self, backup_path: &Path) -> Result<()> {
        let primary = self.config.primary_storage().clone();
        if let Err(e) = self.volumes.ensure_mounted(&primary) {
            tracing::debug!("Primary storage {:?} unavailable: {}", primary, e);
        }
        if self.config.skip_checksum_path().exists() {
            self.ui.print("Skip Check MD5...");
            return Ok(());
        }
        self.ui.print("Checking MD5 sums...");
        self.run_tool(ToolPipeline::single(
            ToolCommand::new(&self.config.tools().checksum_verify)
                .arg("-c")
                .arg(self.config.checksum_manifest())
                .current_dir(backup_path),
            Capture::Stdout,
        ))
        .map_err(|e| {
            self.ui.print("MD5 mismatch!");
            tracing::debug!("Checksum verification: {}", e);
            Error::Verification(backup_path.into())
        })
    }

    fn restore_partitions(
        &mut self,
        session: &mut BackupSession,
        backup_path: &Path,
        flags: RestoreFlags,
    ) -> Result<()> {
        let source = RestoreSource::Directory(backup_path.to_path_buf());

        if flags.boot {
            self.restore_partition(session, &source, Path::new("/boot"))?;
        }
        if flags.wimax {
            self.restore_wimax(backup_path)?;
        }
        if flags.system {
            self.restore_partition(session, &source, Path::new("/system"))?;
            self.restore_partition(session, &source, Path::new("/preload"))?;
        }
        if flags.data {
            self.restore_partition(session, &source, Path::new("/data"))?;
            if self.volumes.has_datadata() {
                self.restore_partition(session, &source, Path::new("/datadata"))?;
            }
            let android_secure = self.config.android_secure_path();
            self.restore_partition_extended(session, &source, &android_secure, false)?;
        }
        if flags.cache {
            self.restore_partition_extended(session, &source, Path::new("/cache"), false)?;
        }
        if flags.sd_ext {
            self.restore_partition(session, &source, Path::new("/sd-ext"))?;
        }

        self.volumes.sync();
        self.ui.print("\nRestore complete!");
        Ok(())
    }

    fn restore_wimax(&mut self, backup_path: &Path) -> Result<()> {
        let wimax = Path::new("/wimax");
        let Some(volume) = self.volumes.volume_for_path(wimax).filter(|v| *v.present()) else {
            return Ok(());
        };
        let image = backup_path.join(wimax_image_name(self.config.serial_number()));
        if !image.exists() {
            self.ui.print("WARNING: WiMAX partition exists, but nandroid");
            self.ui.print("         backup does not contain WiMAX image.");
            self.ui.print("         You should create a new backup to");
            self.ui.print("         protect your WiMAX keys.");
            return Ok(());
        }
        self.ui.print("Erasing WiMAX before restore...");
        self.volumes
            .format_volume(wimax)
            .inspect_err(|_| self.ui.print("Error while formatting wimax!"))?;
        self.ui.print("Restoring WiMAX image...");
        self.volumes.restore_raw(&volume, &RawTarget::File(image))
    }

    /// Writes one partition to standard output: `boot` and `recovery` as raw images, `system`
    /// and `data` as a plain tar stream.
    pub fn dump(&mut self, partition: &str) -> Result<()> {
        let configured = self.configured_format();
        let mut session = BackupSession::streaming(configured);
        match partition {
            "boot" | "recovery" => {
                let root = Path::new("/").join(partition);
                let volume = self
                    .volumes
                    .volume_for_path(&root)
                    .ok_or_else(|| Error::VolumeNotFound(root.clone()))?;
                self.volumes.backup_raw(&volume, &RawTarget::Stream)
            }
            "system" | "data" => {
                let root = Path::new("/").join(partition);
                self.backup_partition(&mut session, &BackupTarget::Stream, &root)
                    .map(|_| ())
            }
            other => Err(Error::UnknownPartition(other.into())),
        }
    }

    /// Reads one partition back from standard input, the counterpart of [`Nandroid::dump`].
    pub fn undump(&mut self, partition: &str) -> Result<()> {
        let configured = self.configured_format();
        let mut session = BackupSession::streaming(configured);
        match partition {
            "boot" => {
                let root = Path::new("/boot");
                let volume = self
                    .volumes
                    .volume_for_path(root)
                    .ok_or_else(|| Error::VolumeNotFound(root.into()))?;
                return self.volumes.restore_raw(&volume, &RawTarget::Stream);
            }
            "recovery" | "system" | "data" => {
                let root = Path::new("/").join(partition);
                self.restore_partition(&mut session, &RestoreSource::Stream, &root)?;
            }
            other => return Err(Error::UnknownPartition(other.into())),
        }
        self.volumes.sync();
        Ok(())
    }
}

pub fn wimax_image_name(serial_number: &str) -> String {
    format!("wimax.{serial_number}.img")
}

/// Makes everything below `dir` readable and writable by everyone. Failures are only logged.
fn open_permissions(dir: &Path) {
    for entry in WalkDir::new(dir) {
        let res = entry
            .map_err(Error::from)
            .and_then(|de| {
                let mode = if de.file_type().is_dir() { 0o777 } else { 0o666 };
                std::fs::set_permissions(de.path(), std::fs::Permissions::from_mode(mode))
                    .map_err(Error::from)
            });
        if let Err(e) = res {
            tracing::debug!("Opening permissions below {:?} failed: {}", dir, e);
        }
    }
}
