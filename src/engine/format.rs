//! Backup formats and the handlers that implement them.
//!
//! A [`BackupFormat`] names how a mounted partition is archived. Each format maps to exactly one
//! [`BackupHandler`] and exactly one [`RestoreHandler`]; the two extra handler variants
//! ([`BackupHandler::TarDump`] and [`RestoreHandler::TarUndump`]) carry a partition over a
//! stream instead of a backup directory and have no on-disk format of their own.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Length of the persisted default-format tag.
pub const FORMAT_TAG_LEN: usize = 3;

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFormat {
    #[default]
    #[display("tar")]
    Tar,
    #[display("tar.gz")]
    TarGz,
    #[display("dedupe")]
    Dedupe,
    /// Legacy flash-filesystem image, produced by the yaffs2 image tool.
    #[display("yaffs2 image")]
    Yaffs2Image,
}

impl BackupFormat {
    /// Order in which artifact suffixes are tried for one filesystem label during artifact lookup.
    pub const LOOKUP_ORDER: [BackupFormat; 4] = [
        BackupFormat::Yaffs2Image,
        BackupFormat::Tar,
        BackupFormat::TarGz,
        BackupFormat::Dedupe,
    ];

    /// Parses the persisted 3-character tag. Only archive formats can be persisted.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "tar" => Some(BackupFormat::Tar),
            "tgz" => Some(BackupFormat::TarGz),
            "dup" => Some(BackupFormat::Dedupe),
            _ => None,
        }
    }

    /// Artifact suffix appended to `<partition>.<filesystem>`.
    pub fn file_ext(&self) -> &'static str {
        match self {
            BackupFormat::Tar => "tar",
            BackupFormat::TarGz => "tar.gz",
            BackupFormat::Dedupe => "dup",
            BackupFormat::Yaffs2Image => "img",
        }
    }

    pub fn backup_handler(self) -> BackupHandler {
        match self {
            BackupFormat::Tar => BackupHandler::Tar,
            BackupFormat::TarGz => BackupHandler::TarGz,
            BackupFormat::Dedupe => BackupHandler::Dedupe,
            BackupFormat::Yaffs2Image => BackupHandler::Yaffs2Image,
        }
    }

    pub fn restore_handler(self) -> RestoreHandler {
        match self {
            BackupFormat::Tar => RestoreHandler::Tar,
            BackupFormat::TarGz => RestoreHandler::TarGz,
            BackupFormat::Dedupe => RestoreHandler::Dedupe,
            BackupFormat::Yaffs2Image => RestoreHandler::Unyaffs,
        }
    }

    /// Reads the device-wide default format from a tag file.
    ///
    /// A missing, unreadable, short or unrecognized file yields [`BackupFormat::Tar`].
    pub fn read_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let mut buf = [0u8; FORMAT_TAG_LEN];
        let read = File::open(path).and_then(|mut f| f.read_exact(&mut buf));
        match read {
            Ok(()) => std::str::from_utf8(&buf)
                .ok()
                .and_then(BackupFormat::from_tag)
                .unwrap_or_else(|| {
                    tracing::debug!("Unrecognized backup format tag in {:?}", path);
                    BackupFormat::Tar
                }),
            Err(e) => {
                tracing::debug!("No backup format tag at {:?}: {}", path, e);
                BackupFormat::Tar
            }
        }
    }
}

impl FromStr for BackupFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackupFormat::from_tag(s).ok_or_else(|| format!("unknown backup format {s:?}, expected tar, tgz or dup"))
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum BackupHandler {
    #[display("tar")]
    Tar,
    #[display("tar.gz")]
    TarGz,
    #[display("dedupe")]
    Dedupe,
    #[display("mkyaffs2image")]
    Yaffs2Image,
    /// Plain tar written to the process's standard output.
    #[display("tar dump")]
    TarDump,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum RestoreHandler {
    #[display("tar")]
    Tar,
    #[display("tar.gz")]
    TarGz,
    #[display("dedupe")]
    Dedupe,
    #[display("unyaffs")]
    Unyaffs,
    /// Plain tar read from the process's standard input.
    #[display("tar undump")]
    TarUndump,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_tag() {
        assert_eq!(BackupFormat::from_tag("tar"), Some(BackupFormat::Tar));
        assert_eq!(BackupFormat::from_tag("tgz"), Some(BackupFormat::TarGz));
        assert_eq!(BackupFormat::from_tag("dup"), Some(BackupFormat::Dedupe));
        assert_eq!(BackupFormat::from_tag("img"), None);
        assert_eq!(BackupFormat::from_tag("zip"), None);
    }

    #[test]
    fn test_every_format_has_one_handler_each_way() {
        for format in BackupFormat::LOOKUP_ORDER {
            let backup = format.backup_handler();
            let restore = format.restore_handler();
            assert_ne!(backup, BackupHandler::TarDump);
            assert_ne!(restore, RestoreHandler::TarUndump);
        }
        assert_eq!(BackupFormat::Yaffs2Image.restore_handler(), RestoreHandler::Unyaffs);
        assert_eq!(BackupFormat::Dedupe.backup_handler(), BackupHandler::Dedupe);
    }

    #[test]
    fn test_read_default_missing_file_is_tar() {
        let temp_dir = TempDir::new().unwrap();
        let format = BackupFormat::read_default(temp_dir.path().join("nope"));
        assert_eq!(format, BackupFormat::Tar);
    }

    #[test]
    fn test_read_default_reads_first_three_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".default_backup_format");
        std::fs::write(&path, "dup\n").unwrap();
        assert_eq!(BackupFormat::read_default(&path), BackupFormat::Dedupe);

        std::fs::write(&path, "tgz").unwrap();
        assert_eq!(BackupFormat::read_default(&path), BackupFormat::TarGz);
    }

    #[test]
    fn test_read_default_garbage_is_tar() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".default_backup_format");
        std::fs::write(&path, "xz").unwrap();
        assert_eq!(BackupFormat::read_default(&path), BackupFormat::Tar);

        std::fs::write(&path, "zip").unwrap();
        assert_eq!(BackupFormat::read_default(&path), BackupFormat::Tar);
    }

    #[test]
    fn test_from_str_for_cli() {
        assert_eq!("tgz".parse::<BackupFormat>(), Ok(BackupFormat::TarGz));
        assert!("raw".parse::<BackupFormat>().is_err());
    }

    #[test]
    fn test_serialization() {
        let serialized = serde_json::to_string(&BackupFormat::TarGz).unwrap();
        assert_eq!(serialized, "\"tar_gz\"");
    }
}
