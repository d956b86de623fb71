//! Restore artifact lookup.
//!
//! Finds the artifact a partition was backed up to. The unambiguous legacy name
//! `<partition>.img` wins when present; otherwise every filesystem-tagged name
//! `<partition>.<filesystem>.<ext>` is tried in a fixed order and the first one on disk decides
//! both the filesystem to recreate and the restore handler.

use crate::engine::format::{BackupFormat, RestoreHandler};
use crate::engine::volume::FsType;
use getset::Getters;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Candidate {
    path: PathBuf,
    filesystem: FsType,
    format: BackupFormat,
}

impl Candidate {
    pub fn restore_handler(&self) -> RestoreHandler {
        self.format.restore_handler()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactLookup {
    /// `<partition>.img`: filesystem unknown, handler resolved from the mounted volume.
    Legacy(PathBuf),
    Found(Candidate),
    NotFound,
}

pub fn legacy_artifact<P: AsRef<Path>>(backup_dir: P, name: &str) -> PathBuf {
    backup_dir.as_ref().join(format!("{name}.img"))
}

/// Every filesystem-tagged artifact name for `name`, in lookup order.
pub fn candidates<P: AsRef<Path>>(backup_dir: P, name: &str) -> Vec<Candidate> {
    let backup_dir = backup_dir.as_ref();
    FsType::LOOKUP_ORDER
        .iter()
        .flat_map(|fs| {
            BackupFormat::LOOKUP_ORDER.iter().map(move |format| Candidate {
                path: backup_dir.join(format!("{}.{}.{}", name, fs, format.file_ext())),
                filesystem: fs.clone(),
                format: *format,
            })
        })
        .collect()
}

/// First candidate for which `exists` holds.
pub fn first_existing<I, F>(candidates: I, exists: F) -> Option<Candidate>
where
    I: IntoIterator<Item = Candidate>,
    F: Fn(&Path) -> bool,
{
    candidates.into_iter().find(|c| exists(&c.path))
}

pub fn locate_backup_artifact<P, F>(backup_dir: P, name: &str, exists: F) -> ArtifactLookup
where
    P: AsRef<Path>,
    F: Fn(&Path) -> bool,
{
    let legacy = legacy_artifact(&backup_dir, name);
    if exists(&legacy) {
        return ArtifactLookup::Legacy(legacy);
    }
    match first_existing(candidates(&backup_dir, name), exists) {
        Some(candidate) => ArtifactLookup::Found(candidate),
        None => ArtifactLookup::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn on_disk(names: &[&str]) -> impl Fn(&Path) -> bool {
        let set: HashSet<PathBuf> = names.iter().map(|n| Path::new("/b").join(n)).collect();
        move |p: &Path| set.contains(p)
    }

    #[test]
    fn test_candidate_order() {
        let all = candidates("/b", "data");
        assert_eq!(all.len(), 32);
        assert_eq!(all[0].path, PathBuf::from("/b/data.yaffs2.img"));
        assert_eq!(all[1].path, PathBuf::from("/b/data.yaffs2.tar"));
        assert_eq!(all[2].path, PathBuf::from("/b/data.yaffs2.tar.gz"));
        assert_eq!(all[3].path, PathBuf::from("/b/data.yaffs2.dup"));
        assert_eq!(all[4].path, PathBuf::from("/b/data.ext2.img"));
        assert_eq!(all[31].path, PathBuf::from("/b/data.exfat.dup"));
    }

    #[test]
    fn test_only_plain_tar_selects_tar() {
        let found = locate_backup_artifact("/b", "data", on_disk(&["data.ext4.tar"]));
        match found {
            ArtifactLookup::Found(c) => {
                assert_eq!(c.filesystem, FsType::Ext4);
                assert_eq!(c.format, BackupFormat::Tar);
                assert_eq!(c.restore_handler(), RestoreHandler::Tar);
            }
            other => panic!("Expected Found, got {:?}", other),
        }
    }

    #[test]
    fn test_earlier_filesystem_wins_over_earlier_suffix() {
        let found = first_existing(
            candidates("/b", "system"),
            on_disk(&["system.ext4.img", "system.ext3.dup"]),
        )
        .unwrap();
        assert_eq!(found.filesystem, FsType::Ext3);
        assert_eq!(found.restore_handler(), RestoreHandler::Dedupe);
    }

    #[test]
    fn test_suffix_priority_within_filesystem() {
        let found = first_existing(
            candidates("/b", "cache"),
            on_disk(&["cache.ext4.dup", "cache.ext4.tar.gz"]),
        )
        .unwrap();
        assert_eq!(found.format, BackupFormat::TarGz);
    }

    #[test]
    fn test_legacy_name_wins() {
        let found = locate_backup_artifact("/b", "data", on_disk(&["data.img", "data.ext4.tar"]));
        assert_eq!(found, ArtifactLookup::Legacy(PathBuf::from("/b/data.img")));
    }

    #[test]
    fn test_nothing_found() {
        let found = locate_backup_artifact("/b", "wimax", on_disk(&["data.ext4.tar"]));
        assert_eq!(found, ArtifactLookup::NotFound);
    }

    #[test]
    fn test_real_directory() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("sd-ext.ext3.tar.gz"), "").unwrap();
        let found = locate_backup_artifact(temp_dir.path(), "sd-ext", Path::exists);
        match found {
            ArtifactLookup::Found(c) => assert_eq!(c.path, temp_dir.path().join("sd-ext.ext3.tar.gz")),
            other => panic!("Expected Found, got {:?}", other),
        }
    }
}
