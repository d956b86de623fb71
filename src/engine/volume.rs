//! The volume table and the mount/format/raw-flash collaborator.

use crate::engine::command::{Capture, ProcessSpawner, ToolCommand, ToolPipeline};
use crate::engine::config::{NandroidConfig, ToolsConfig, VolumeConfig};
use crate::engine::result_error::error::Error;
use crate::engine::result_error::result::{status_to_result, Result};
use crate::engine::result_error::WithMsg;
use derive_more::Display;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};

/// Filesystem type label of a volume.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FsType {
    Yaffs2,
    Ext2,
    Ext3,
    Ext4,
    Vfat,
    Rfs,
    F2fs,
    Exfat,
    Auto,
    Mtd,
    Bml,
    Emmc,
    Other(String),
}

impl FsType {
    /// Filesystem labels tried, in order, when looking up a backup artifact.
    pub const LOOKUP_ORDER: [FsType; 8] = [
        FsType::Yaffs2,
        FsType::Ext2,
        FsType::Ext3,
        FsType::Ext4,
        FsType::Vfat,
        FsType::Rfs,
        FsType::F2fs,
        FsType::Exfat,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            FsType::Yaffs2 => "yaffs2",
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Vfat => "vfat",
            FsType::Rfs => "rfs",
            FsType::F2fs => "f2fs",
            FsType::Exfat => "exfat",
            FsType::Auto => "auto",
            FsType::Mtd => "mtd",
            FsType::Bml => "bml",
            FsType::Emmc => "emmc",
            FsType::Other(s) => s.as_str(),
        }
    }

    /// Volumes with no filesystem visible to the engine, handled as flat block images.
    pub fn is_raw(&self) -> bool {
        matches!(self, FsType::Mtd | FsType::Bml | FsType::Emmc)
    }

    /// The flash-native filesystem, always archived with the legacy image tool.
    pub fn is_flash_native(&self) -> bool {
        matches!(self, FsType::Yaffs2)
    }
}

impl From<String> for FsType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "yaffs2" => FsType::Yaffs2,
            "ext2" => FsType::Ext2,
            "ext3" => FsType::Ext3,
            "ext4" => FsType::Ext4,
            "vfat" => FsType::Vfat,
            "rfs" => FsType::Rfs,
            "f2fs" => FsType::F2fs,
            "exfat" => FsType::Exfat,
            "auto" => FsType::Auto,
            "mtd" => FsType::Mtd,
            "bml" => FsType::Bml,
            "emmc" => FsType::Emmc,
            _ => FsType::Other(value),
        }
    }
}

impl From<&str> for FsType {
    fn from(value: &str) -> Self {
        FsType::from(value.to_string())
    }
}

impl From<FsType> for String {
    fn from(value: FsType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Debug for FsType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// One entry of the volume table, as seen for the duration of a run.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct PartitionDescriptor {
    mount_point: PathBuf,
    blk_device: PathBuf,
    fs_type: FsType,
    /// Whether the backing block device exists on this device.
    present: bool,
}

impl PartitionDescriptor {
    pub fn new<A: Into<PathBuf>, B: Into<PathBuf>, F: Into<FsType>>(
        mount_point: A,
        blk_device: B,
        fs_type: F,
        present: bool,
    ) -> Self {
        Self {
            mount_point: mount_point.into(),
            blk_device: blk_device.into(),
            fs_type: fs_type.into(),
            present,
        }
    }

    /// Last path component of the mount point, used to name artifacts.
    pub fn name(&self) -> String {
        partition_name(&self.mount_point)
    }
}

pub fn partition_name<P: AsRef<Path>>(path: P) -> String {
    path.as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Where a raw partition image is written to or read from.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum RawTarget {
    #[display("{}", _0.display())]
    File(PathBuf),
    /// The process's standard output (backup) or standard input (restore).
    #[display("stream")]
    Stream,
}

/// Volume/mount collaborator.
///
/// Supplies partition descriptors and performs every mount, format and raw-flash operation on
/// behalf of the engine. Paths passed in may be mount points or paths inside a volume.
pub trait Volumes {
    /// Longest mount-point prefix match for `path`.
    fn volume_for_path(&self, path: &Path) -> Option<PartitionDescriptor>;

    /// Filesystem a volume is currently mounted with, if it is mounted.
    fn mounted_filesystem(&self, mount_point: &Path) -> Option<String>;

    /// Mounts the volume containing `path`, creating the mount point directory if needed.
    fn ensure_mounted(&mut self, path: &Path) -> Result<()>;

    fn ensure_unmounted(&mut self, path: &Path) -> Result<()>;

    /// Clears `path`: erases a raw volume, otherwise removes its contents.
    fn format_volume(&mut self, path: &Path) -> Result<()>;

    /// Creates a fresh `fs_type` filesystem on `device`, the volume mounted at `path`.
    fn format_device(&mut self, device: &Path, path: &Path, fs_type: &FsType) -> Result<()>;

    fn backup_raw(&mut self, volume: &PartitionDescriptor, target: &RawTarget) -> Result<()>;

    fn restore_raw(&mut self, volume: &PartitionDescriptor, source: &RawTarget) -> Result<()>;

    /// Whether shared storage lives inside the data partition on this device.
    fn is_data_media(&self) -> bool;

    /// Whether `path` is on the shared storage emulated inside the data partition.
    fn is_data_media_volume_path(&self, path: &Path) -> bool;

    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    fn free_space(&self, path: &Path) -> Result<u64>;

    fn has_datadata(&self) -> bool {
        self.volume_for_path(Path::new("/datadata"))
            .is_some_and(|v| v.mount_point() == Path::new("/datadata"))
    }

    fn set_perf_mode(&mut self, _enabled: bool) {}

    fn sync(&mut self) {}
}

/// Exact-or-longest prefix lookup shared by volume table implementations.
pub fn lookup_volume<'a, I>(volumes: I, path: &Path) -> Option<&'a VolumeConfig>
where
    I: IntoIterator<Item = &'a VolumeConfig>,
{
    volumes
        .into_iter()
        .filter(|v| path.starts_with(v.mount_point()))
        .max_by_key(|v| v.mount_point().components().count())
}

/// Parses `/proc/mounts` content into `(device, mount point, filesystem)` triples.
pub fn parse_mounts(content: &str) -> Vec<(String, PathBuf, String)> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mount_point = parts.next()?;
            let fs_type = parts.next()?;
            Some((
                device.to_string(),
                PathBuf::from(mount_point.replace("\\040", " ")),
                fs_type.to_string(),
            ))
        })
        .collect()
}

/// [`Volumes`] backed by the configured volume table and the device's own mount tooling.
pub struct CommandVolumes<P: ProcessSpawner> {
    config: NandroidConfig,
    spawner: P,
    mounts_file: PathBuf,
}

impl<P: ProcessSpawner> CommandVolumes<P> {
    pub fn new(config: NandroidConfig, spawner: P) -> Self {
        Self {
            config,
            spawner,
            mounts_file: PathBuf::from("/proc/mounts"),
        }
    }

    fn tools(&self) -> &ToolsConfig {
        self.config.tools()
    }

    fn run(&self, pipeline: ToolPipeline) -> Result<()> {
        let program = pipeline.program();
        let status = self.spawner.spawn_streaming(&pipeline, &mut |line| {
            tracing::debug!("{}: {}", program, line.trim_end());
        })?;
        status_to_result(status, |status| Error::ToolExit { program, status })
    }

    fn volume_config(&self, path: &Path) -> Result<&VolumeConfig> {
        lookup_volume(self.config.volumes(), path).ok_or_else(|| Error::VolumeNotFound(path.into()))
    }

    fn raw_stream_path(target: &RawTarget, fallback_fd: &str) -> PathBuf {
        match target {
            RawTarget::File(p) => p.clone(),
            RawTarget::Stream => PathBuf::from(fallback_fd),
        }
    }

    fn clear_contents(&self, path: &Path) -> Result<()> {
        let keep_media = self.is_data_media() && path == Path::new("/data");
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if keep_media && entry.file_name() == "media" {
                continue;
            }
            let entry_path = entry.path();
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&entry_path)?;
            } else {
                std::fs::remove_file(&entry_path)?;
            }
        }
        Ok(())
    }
}

impl<P: ProcessSpawner> Volumes for CommandVolumes<P> {
    fn volume_for_path(&self, path: &Path) -> Option<PartitionDescriptor> {
        lookup_volume(self.config.volumes(), path).map(|v| v.descriptor(v.blk_device().exists()))
    }

    fn mounted_filesystem(&self, mount_point: &Path) -> Option<String> {
        let content = std::fs::read_to_string(&self.mounts_file).ok()?;
        parse_mounts(&content)
            .into_iter()
            .find(|(_, mp, _)| mp == mount_point)
            .map(|(_, _, fs)| fs)
    }

    fn ensure_mounted(&mut self, path: &Path) -> Result<()> {
        let volume = self.volume_config(path)?.clone();
        let mount_point = volume.mount_point();
        if self.mounted_filesystem(mount_point).is_some() {
            return Ok(());
        }
        if volume.fs_type().is_raw() {
            return Err(Error::Mount {
                mount_point: mount_point.clone(),
                error: Box::new(Error::NotMounted(mount_point.clone())),
            });
        }
        std::fs::create_dir_all(mount_point)?;
        let mut cmd = ToolCommand::new(&self.tools().mount);
        if *volume.fs_type() != FsType::Auto {
            cmd = cmd.arg("-t").arg(volume.fs_type().as_str());
        }
        let cmd = cmd.arg(volume.blk_device()).arg(mount_point);
        self.run(ToolPipeline::single(cmd, Capture::Stdout))
            .map_err(|e| Error::Mount {
                mount_point: mount_point.clone(),
                error: Box::new(e),
            })
    }

    fn ensure_unmounted(&mut self, path: &Path) -> Result<()> {
        let volume = self.volume_config(path)?.clone();
        if self.mounted_filesystem(volume.mount_point()).is_none() {
            return Ok(());
        }
        let cmd = ToolCommand::new(&self.tools().umount).arg(volume.mount_point());
        self.run(ToolPipeline::single(cmd, Capture::Stdout))
            .with_msg(format!("Unmounting {:?} failed", volume.mount_point()))
    }

    fn format_volume(&mut self, path: &Path) -> Result<()> {
        let volume = self.volume_config(path)?.clone();
        if volume.fs_type().is_raw() && volume.mount_point() == path {
            let cmd = ToolCommand::new(&self.tools().erase_image)
                .arg(partition_name(volume.mount_point()));
            return self.run(ToolPipeline::single(cmd, Capture::Stdout));
        }
        self.ensure_mounted(path)?;
        std::fs::create_dir_all(path)?;
        self.clear_contents(path)
            .with_msg(format!("Removing contents of {:?} failed", path))
    }

    fn format_device(&mut self, device: &Path, path: &Path, fs_type: &FsType) -> Result<()> {
        let volume = self.volume_config(path)?.clone();
        if volume.mount_point() != path {
            return self.format_volume(path);
        }
        self.ensure_unmounted(path)?;
        let cmd = if fs_type.is_flash_native() {
            ToolCommand::new(&self.tools().erase_image).arg(partition_name(path))
        } else {
            ToolCommand::new(format!("{}{}", self.tools().mkfs_prefix, fs_type)).arg(device)
        };
        self.run(ToolPipeline::single(cmd, Capture::Stdout))
    }

    fn backup_raw(&mut self, volume: &PartitionDescriptor, target: &RawTarget) -> Result<()> {
        let dest = Self::raw_stream_path(target, "/proc/self/fd/1");
        let cmd = match volume.fs_type() {
            FsType::Mtd => ToolCommand::new(&self.tools().dump_image)
                .arg(volume.name())
                .arg(dest),
            _ => ToolCommand::new(&self.tools().dd)
                .arg(format!("if={}", volume.blk_device().display()))
                .arg(format!("of={}", dest.display())),
        };
        self.run(ToolPipeline::single(cmd, Capture::Passthrough))
    }

    fn restore_raw(&mut self, volume: &PartitionDescriptor, source: &RawTarget) -> Result<()> {
        let src = Self::raw_stream_path(source, "/proc/self/fd/0");
        let cmd = match volume.fs_type() {
            FsType::Mtd => ToolCommand::new(&self.tools().flash_image)
                .arg(volume.name())
                .arg(src),
            _ => ToolCommand::new(&self.tools().dd)
                .arg(format!("if={}", src.display()))
                .arg(format!("of={}", volume.blk_device().display())),
        };
        self.run(ToolPipeline::single(cmd, Capture::Passthrough))
    }

    fn is_data_media(&self) -> bool {
        *self.config.data_media()
    }

    fn is_data_media_volume_path(&self, path: &Path) -> bool {
        self.is_data_media()
            && (path.starts_with("/data/media") || path.starts_with(self.config.primary_storage()))
    }

    fn free_space(&self, path: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path)?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn set_perf_mode(&mut self, enabled: bool) {
        if let Some(file) = self.config.perf_mode_file() {
            let governor = if enabled { "performance" } else { "ondemand" };
            if let Err(e) = std::fs::write(file, governor) {
                tracing::debug!("Setting cpu governor {:?} in {:?} failed: {}", governor, file, e);
            }
        }
    }

    fn sync(&mut self) {
        nix::unistd::sync();
    }
}
