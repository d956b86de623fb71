use crate::engine::result_error::error::Error;
use crate::engine::result_error::result::Result;
use crate::engine::result_error::WithMsg;
use crate::engine::validate::{
    validate_absolute, validate_file_name, validate_program, validate_relative,
};
use crate::engine::volume::{FsType, PartitionDescriptor};
use bon::Builder;
use chrono::{DateTime, TimeZone};
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::Display;
use std::fs::File;
use std::path::{Path, PathBuf};
use validator::Validate;

static TIME_FORMAT: &str = "%Y-%m-%d.%H.%M.%S";

/// Device and tooling configuration for backup and restore runs.
///
/// Every path below `primary_storage` is given relative to it.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct NandroidConfig {
    #[serde(default = "default_primary_storage")]
    #[builder(default = default_primary_storage(), into)]
    #[validate(custom(function = validate_absolute))]
    primary_storage: PathBuf,
    #[serde(default = "default_backup_dir")]
    #[builder(default = default_backup_dir(), into)]
    #[validate(custom(function = validate_relative))]
    backup_dir: PathBuf,
    #[serde(default = "default_blobs_dir_name")]
    #[builder(default = default_blobs_dir_name(), into)]
    #[validate(custom(function = validate_file_name))]
    blobs_dir_name: String,
    #[serde(default = "default_format_file")]
    #[builder(default = default_format_file(), into)]
    #[validate(custom(function = validate_relative))]
    format_file: PathBuf,
    #[serde(default = "default_hide_progress_file")]
    #[builder(default = default_hide_progress_file(), into)]
    #[validate(custom(function = validate_relative))]
    hide_progress_file: PathBuf,
    #[serde(default = "default_skip_checksum_file")]
    #[builder(default = default_skip_checksum_file(), into)]
    #[validate(custom(function = validate_relative))]
    skip_checksum_file: PathBuf,
    #[serde(default = "default_checksum_manifest")]
    #[builder(default = default_checksum_manifest(), into)]
    #[validate(custom(function = validate_file_name))]
    checksum_manifest: String,
    #[serde(default = "default_session_log")]
    #[builder(default = default_session_log(), into)]
    #[validate(custom(function = validate_absolute))]
    session_log: PathBuf,
    /// Holds the partition name read by a `bu <fd> restore` transport.
    #[serde(default = "default_bu_restore_file")]
    #[builder(default = default_bu_restore_file(), into)]
    #[validate(custom(function = validate_absolute))]
    bu_restore_file: PathBuf,
    #[serde(default = "default_android_secure")]
    #[builder(default = default_android_secure(), into)]
    #[validate(custom(function = validate_relative))]
    android_secure: PathBuf,
    #[serde(default = "default_low_space_warning_mb")]
    #[builder(default = default_low_space_warning_mb())]
    low_space_warning_mb: u64,
    #[serde(default = "default_split_size")]
    #[builder(default = default_split_size())]
    #[validate(range(min = 1))]
    split_size: u64,
    #[serde(default = "default_tar_excludes")]
    #[builder(default = default_tar_excludes())]
    tar_excludes: Vec<String>,
    /// When false, legacy `<partition>.img` artifacts are always restored with the yaffs2
    /// extractor.
    #[serde(default)]
    #[builder(default)]
    prefer_tar: bool,
    #[serde(default)]
    #[builder(default)]
    clear_policy: ClearPolicy,
    /// Shared storage is hosted inside the data partition.
    #[serde(default)]
    #[builder(default)]
    data_media: bool,
    #[serde(default)]
    #[builder(default)]
    serial_number: String,
    perf_mode_file: Option<PathBuf>,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    tools: ToolsConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    volumes: Vec<VolumeConfig>,
}

fn default_primary_storage() -> PathBuf {
    "/sdcard".into()
}

fn default_backup_dir() -> PathBuf {
    "clockworkmod/backup".into()
}

fn default_blobs_dir_name() -> String {
    "blobs".into()
}

fn default_format_file() -> PathBuf {
    "clockworkmod/.default_backup_format".into()
}

fn default_hide_progress_file() -> PathBuf {
    "clockworkmod/.hidenandroidprogress".into()
}

fn default_skip_checksum_file() -> PathBuf {
    "clockworkmod/.no_md5sum".into()
}

fn default_checksum_manifest() -> String {
    "nandroid.md5".into()
}

fn default_session_log() -> PathBuf {
    "/tmp/recovery.log".into()
}

fn default_bu_restore_file() -> PathBuf {
    "/tmp/ro.bu.restore".into()
}

fn default_android_secure() -> PathBuf {
    ".android_secure".into()
}

fn default_low_space_warning_mb() -> u64 {
    150
}

fn default_split_size() -> u64 {
    1_000_000_000
}

fn default_tar_excludes() -> Vec<String> {
    vec!["data/data/com.google.android.music/files/*".into()]
}

impl Default for NandroidConfig {
    fn default() -> Self {
        NandroidConfig::builder().build()
    }
}

/// Decides whether a restore target is cleared by content removal or reformatted with the
/// filesystem recorded in the backup artifact's name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearPolicy {
    /// Clear volumes declared `auto` and the data partition of data-is-media devices; some
    /// boot loaders refuse to boot after those are reformatted.
    #[default]
    AutoOrDataMedia,
    /// Never reformat.
    AlwaysClear,
    /// Reformat whenever the artifact names a filesystem.
    AlwaysReformat,
}

impl ClearPolicy {
    /// Whether a target whose declared filesystem is `declared` (or which is not a volume) must be
    /// cleared instead of reformatted.
    pub fn should_clear(&self, declared: Option<&FsType>, is_data_media_data: bool) -> bool {
        match self {
            ClearPolicy::AlwaysClear => true,
            ClearPolicy::AlwaysReformat => false,
            ClearPolicy::AutoOrDataMedia => {
                declared.map_or(true, |fs| *fs == FsType::Auto) || is_data_media_data
            }
        }
    }
}

/// Program names of every external tool the engine drives.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    #[validate(custom(function = validate_program))]
    pub tar: String,
    #[validate(custom(function = validate_program))]
    pub pigz: String,
    #[validate(custom(function = validate_program))]
    pub split: String,
    #[validate(custom(function = validate_program))]
    pub cat: String,
    #[validate(custom(function = validate_program))]
    pub find: String,
    #[validate(custom(function = validate_program))]
    pub dedupe: String,
    #[validate(custom(function = validate_program))]
    pub mkyaffs2image: String,
    #[validate(custom(function = validate_program))]
    pub unyaffs: String,
    #[validate(custom(function = validate_program))]
    pub checksum_generate: String,
    #[validate(custom(function = validate_program))]
    pub checksum_verify: String,
    #[validate(custom(function = validate_program))]
    pub dump_image: String,
    #[validate(custom(function = validate_program))]
    pub flash_image: String,
    #[validate(custom(function = validate_program))]
    pub erase_image: String,
    #[validate(custom(function = validate_program))]
    pub dd: String,
    #[validate(custom(function = validate_program))]
    pub mount: String,
    #[validate(custom(function = validate_program))]
    pub umount: String,
    /// Prefix joined with a filesystem label to name its mkfs tool.
    #[validate(custom(function = validate_program))]
    pub mkfs_prefix: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tar: "tar".into(),
            pigz: "pigz".into(),
            split: "split".into(),
            cat: "cat".into(),
            find: "find".into(),
            dedupe: "dedupe".into(),
            mkyaffs2image: "mkyaffs2image".into(),
            unyaffs: "unyaffs".into(),
            checksum_generate: "nandroid-md5.sh".into(),
            checksum_verify: "md5sum".into(),
            dump_image: "dump_image".into(),
            flash_image: "flash_image".into(),
            erase_image: "erase_image".into(),
            dd: "dd".into(),
            mount: "mount".into(),
            umount: "umount".into(),
            mkfs_prefix: "mkfs.".into(),
        }
    }
}

/// One row of the device's volume table.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, PartialEq, Eq, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct VolumeConfig {
    #[validate(custom(function = validate_absolute))]
    mount_point: PathBuf,
    #[validate(custom(function = validate_absolute))]
    blk_device: PathBuf,
    fs_type: FsType,
}

impl VolumeConfig {
    pub fn new<A: Into<PathBuf>, B: Into<PathBuf>, F: Into<FsType>>(
        mount_point: A,
        blk_device: B,
        fs_type: F,
    ) -> Self {
        Self {
            mount_point: mount_point.into(),
            blk_device: blk_device.into(),
            fs_type: fs_type.into(),
        }
    }

    pub fn descriptor(&self, present: bool) -> PartitionDescriptor {
        PartitionDescriptor::new(
            self.mount_point.clone(),
            self.blk_device.clone(),
            self.fs_type.clone(),
            present,
        )
    }
}

impl NandroidConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: NandroidConfig = File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader(f).map_err(Error::from))
            .with_msg(format!("Parse YAML config failed: {:?}", path))?;
        config
            .validate()
            .map_err(Error::from)
            .with_msg(format!("Config validation failed: {:?}", path))?;
        Ok(config)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.primary_storage.join(&self.backup_dir)
    }

    pub fn format_file_path(&self) -> PathBuf {
        self.primary_storage.join(&self.format_file)
    }

    pub fn hide_progress_path(&self) -> PathBuf {
        self.primary_storage.join(&self.hide_progress_file)
    }

    pub fn skip_checksum_path(&self) -> PathBuf {
        self.primary_storage.join(&self.skip_checksum_file)
    }

    pub fn android_secure_path(&self) -> PathBuf {
        self.primary_storage.join(&self.android_secure)
    }

    /// `<backup root>/<local timestamp>` for an automatically named backup run.
    pub fn timestamped_backup_path<T: TimeZone>(&self, now: DateTime<T>) -> PathBuf
    where
        T::Offset: Display,
    {
        self.backup_root().join(now.format(TIME_FORMAT).to_string())
    }

    /// Blob store shared by every run under the same backup tree: `<run>/../../<blobs>`.
    pub fn blob_dir_for<P: AsRef<Path>>(&self, run_dir: P) -> PathBuf {
        let run_dir = run_dir.as_ref();
        run_dir
            .parent()
            .and_then(Path::parent)
            .unwrap_or(run_dir)
            .join(&self.blobs_dir_name)
    }

    /// Directory searched for dedupe descriptors that keep blobs alive.
    pub fn descriptor_root_for<P: AsRef<Path>>(&self, blob_dir: P) -> PathBuf {
        let blob_dir = blob_dir.as_ref();
        let backup_name = self
            .backup_dir
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("backup"));
        blob_dir
            .parent()
            .unwrap_or(blob_dir)
            .join(backup_name)
    }
}
