//! adb backup transport.
//!
//! `bu <fd> backup <partition>` dumps one partition into an inherited file descriptor and
//! `bu <fd> restore` undumps the partition named in the restore file from one. The descriptor
//! is moved onto standard output or standard input first, so the dump and undump paths stay
//! the same as for a plain pipe.

use crate::engine::command::ProcessSpawner;
use crate::engine::pipeline::Nandroid;
use crate::engine::result_error::error::Error;
use crate::engine::result_error::result::Result;
use crate::engine::result_error::WithMsg;
use crate::engine::ui::Ui;
use crate::engine::volume::Volumes;
use nix::libc::{STDIN_FILENO, STDOUT_FILENO};
use std::os::fd::RawFd;
use std::path::Path;

pub const BU_USAGE: &str = "Usage: bu <fd> backup partition
Usage: Prior to restore:
Usage: echo -n <partition> > /tmp/ro.bu.restore
Usage: bu <fd> restore";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuRequest {
    Backup { fd: RawFd, partition: String },
    Restore { fd: RawFd },
}

impl BuRequest {
    /// Parses `<fd> backup <partition>` or `<fd> restore`. Anything else is a usage error.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        match args.as_slice() {
            [fd, "backup", partition] => Ok(BuRequest::Backup {
                fd: parse_fd(fd)?,
                partition: partition.to_string(),
            }),
            [fd, "restore"] => Ok(BuRequest::Restore { fd: parse_fd(fd)? }),
            _ => Err(Error::Usage(BU_USAGE.into())),
        }
    }
}

fn parse_fd(fd: &str) -> Result<RawFd> {
    fd.parse::<RawFd>()
        .ok()
        .filter(|fd| *fd >= 0)
        .ok_or_else(|| Error::Usage(BU_USAGE.into()))
}

/// Moves `fd` onto `target` and closes the original.
pub fn redirect(fd: RawFd, target: RawFd) -> Result<()> {
    if fd != target {
        nix::unistd::dup2(fd, target)?;
        nix::unistd::close(fd)?;
    }
    Ok(())
}

/// Partition name written by the host before a restore, without trailing padding.
pub fn read_restore_partition<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let content = std::fs::read(path)
        .map_err(Error::from)
        .with_msg(format!("Reading restore partition from {:?} failed", path))?;
    let name = String::from_utf8_lossy(&content);
    Ok(name
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string())
}

impl<V: Volumes, U: Ui, P: ProcessSpawner> Nandroid<V, U, P> {
    pub fn bu(&mut self, request: &BuRequest) -> Result<()> {
        match request {
            BuRequest::Backup { fd, partition } => {
                redirect(*fd, STDOUT_FILENO)?;
                self.dump(partition)
            }
            BuRequest::Restore { fd } => {
                redirect(*fd, STDIN_FILENO)?;
                let partition = read_restore_partition(self.config.bu_restore_file())?;
                tracing::info!("Restoring {:?} from descriptor {}", partition, fd);
                self.undump(&partition)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::NandroidConfig;
    use crate::engine::testing::{FakeVolumes, RecordingSpawner, RecordingUi, VolumeOp};
    use crate::engine::volume::RawTarget;
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::{AsRawFd, IntoRawFd};
    use tempfile::TempDir;

    #[test]
    fn test_parse() {
        assert_eq!(
            BuRequest::parse(&["3", "backup", "boot"]).unwrap(),
            BuRequest::Backup {
                fd: 3,
                partition: "boot".into()
            }
        );
        assert_eq!(
            BuRequest::parse(&["0", "restore"]).unwrap(),
            BuRequest::Restore { fd: 0 }
        );
    }

    #[test]
    fn test_bad_arity_is_usage() {
        for args in [
            vec!["3", "backup"],
            vec!["3", "restore", "boot"],
            vec!["3", "flash", "boot"],
            vec!["x", "restore"],
            vec![],
        ] {
            let err = BuRequest::parse(&args).unwrap_err();
            assert!(matches!(err, Error::Usage(_)));
            assert_eq!(err.status(), 1);
            assert!(err.to_string().contains("Usage: bu <fd> restore"));
        }
    }

    #[test]
    fn test_redirect_moves_descriptor() {
        let temp_dir = TempDir::new().unwrap();
        let source = File::create(temp_dir.path().join("source")).unwrap();
        let mut target = File::create(temp_dir.path().join("target")).unwrap();

        redirect(source.into_raw_fd(), target.as_raw_fd()).unwrap();
        target.write_all(b"boot").unwrap();
        drop(target);

        assert_eq!(std::fs::read(temp_dir.path().join("source")).unwrap(), b"boot");
        assert!(std::fs::read(temp_dir.path().join("target")).unwrap().is_empty());
    }

    #[test]
    fn test_read_restore_partition_trims_padding() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ro.bu.restore");
        std::fs::write(&path, b"system\n\0\0").unwrap();
        assert_eq!(read_restore_partition(&path).unwrap(), "system");
        assert!(read_restore_partition(temp_dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_backup_on_stdout_dumps_partition() {
        let volumes = FakeVolumes::default().with_volume("/boot", "emmc");
        let mut nandroid = Nandroid::new(
            NandroidConfig::default(),
            volumes.clone(),
            RecordingUi::default(),
            RecordingSpawner::default(),
        );

        nandroid
            .bu(&BuRequest::Backup {
                fd: STDOUT_FILENO,
                partition: "boot".into(),
            })
            .unwrap();

        assert_eq!(
            volumes.ops(),
            vec![VolumeOp::BackupRaw("/boot".into(), RawTarget::Stream)]
        );
    }

    #[test]
    fn test_restore_reads_partition_file() {
        let temp_dir = TempDir::new().unwrap();
        let restore_file = temp_dir.path().join("ro.bu.restore");
        std::fs::write(&restore_file, "boot").unwrap();
        let volumes = FakeVolumes::default().with_volume("/boot", "emmc");
        let config = NandroidConfig::builder().bu_restore_file(&restore_file).build();
        let mut nandroid = Nandroid::new(
            config,
            volumes.clone(),
            RecordingUi::default(),
            RecordingSpawner::default(),
        );

        nandroid.bu(&BuRequest::Restore { fd: STDIN_FILENO }).unwrap();

        assert_eq!(
            volumes.ops(),
            vec![VolumeOp::RestoreRaw("/boot".into(), RawTarget::Stream)]
        );
    }

    #[test]
    fn test_restore_of_unknown_partition_fails() {
        let temp_dir = TempDir::new().unwrap();
        let restore_file = temp_dir.path().join("ro.bu.restore");
        std::fs::write(&restore_file, "modem").unwrap();
        let config = NandroidConfig::builder().bu_restore_file(&restore_file).build();
        let mut nandroid = Nandroid::new(
            config,
            FakeVolumes::default(),
            RecordingUi::default(),
            RecordingSpawner::default(),
        );

        let err = nandroid.bu(&BuRequest::Restore { fd: STDIN_FILENO }).unwrap_err();
        assert!(matches!(err, Error::UnknownPartition(p) if p == "modem"));
    }
}
