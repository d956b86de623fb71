//! Handler registry: which strategy backs up or restores a partition, and the tool pipeline
//! each strategy runs.

use crate::engine::command::{Capture, ToolCommand, ToolPipeline};
use crate::engine::config::NandroidConfig;
use crate::engine::format::{BackupHandler, RestoreHandler};
use crate::engine::function_path;
use crate::engine::result_error::error::Error;
use crate::engine::result_error::result::Result;
use crate::engine::result_error::WithDebugObjectAndFnName;
use crate::engine::session::{BackupSession, SessionMode};
use crate::engine::volume::{FsType, PartitionDescriptor, Volumes};
use function_name::named;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Suffix length of split archive parts: `<artifact>.a`, `<artifact>.b`, ...
pub const SPLIT_SUFFIX_LEN: usize = 1;

const DATA: &str = "/data";

fn mounted_volume(volumes: &dyn Volumes, path: &Path) -> Result<(PartitionDescriptor, FsType)> {
    let volume = volumes
        .volume_for_path(path)
        .ok_or_else(|| Error::VolumeNotFound(path.into()))?;
    let fs = volumes
        .mounted_filesystem(volume.mount_point())
        .ok_or_else(|| Error::NotMounted(volume.mount_point().clone()))?;
    Ok((volume, FsType::from(fs)))
}

fn is_data_media_data(volumes: &dyn Volumes, path: &Path) -> bool {
    path == Path::new(DATA) && volumes.is_data_media()
}

/// Backup strategy for the mounted volume holding `path`.
#[named]
pub fn resolve_backup_strategy(
    session: &BackupSession,
    volumes: &dyn Volumes,
    path: &Path,
) -> Result<BackupHandler> {
    let (_, fs) = mounted_volume(volumes, path)
        .with_debug_object_and_fn_name(path.to_path_buf(), function_path!())?;
    let handler = if is_data_media_data(volumes, path)
        || session.forced_format().is_some()
        || session.mode() == SessionMode::Stream
        || !fs.is_flash_native()
    {
        session.default_backup_handler()
    } else {
        BackupHandler::Yaffs2Image
    };
    tracing::debug!("Backup handler for {:?} ({}): {}", path, fs, handler);
    Ok(handler)
}

/// Restore strategy for a legacy `<partition>.img` artifact or a stream, which carry no format
/// in their name.
#[named]
pub fn resolve_restore_strategy(
    session: &BackupSession,
    volumes: &dyn Volumes,
    path: &Path,
    prefer_tar: bool,
) -> Result<RestoreHandler> {
    let (_, fs) = mounted_volume(volumes, path)
        .with_debug_object_and_fn_name(path.to_path_buf(), function_path!())?;
    let handler = if is_data_media_data(volumes, path) || session.mode() == SessionMode::Stream {
        session.default_restore_handler()
    } else if !prefer_tar || fs.is_flash_native() {
        RestoreHandler::Unyaffs
    } else {
        RestoreHandler::Tar
    };
    tracing::debug!("Restore handler for {:?} ({}): {}", path, fs, handler);
    Ok(handler)
}

/// `<stem>.<ext>` of the artifact `handler` writes, or `None` when it writes to a stream.
pub fn backup_artifact(handler: BackupHandler, stem: &Path) -> Option<PathBuf> {
    let ext = match handler {
        BackupHandler::Tar => "tar",
        BackupHandler::TarGz => "tar.gz",
        BackupHandler::Dedupe => "dup",
        BackupHandler::Yaffs2Image => "img",
        BackupHandler::TarDump => return None,
    };
    let mut artifact = stem.as_os_str().to_owned();
    artifact.push(".");
    artifact.push(ext);
    Some(PathBuf::from(artifact))
}

fn parent_and_name(path: &Path) -> (PathBuf, OsString) {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("/"))
        .to_path_buf();
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("."));
    (parent, name)
}

fn tar_create(config: &NandroidConfig, source: &Path, exclude_media: bool) -> ToolCommand {
    let (parent, name) = parent_and_name(source);
    let excludes = config
        .tar_excludes()
        .iter()
        .map(|pattern| format!("--exclude={pattern}"))
        .chain(exclude_media.then(|| "--exclude=media".to_string()));
    ToolCommand::new(&config.tools().tar)
        .args(["-c", "-v", "-f", "-"])
        .args(excludes)
        .arg(name)
        .current_dir(parent)
}

/// Pipeline that backs `source` up with `handler`.
///
/// `exclude_media` leaves out the shared media tree of a data-is-media data partition.
pub fn backup_pipeline(
    config: &NandroidConfig,
    handler: BackupHandler,
    source: &Path,
    stem: &Path,
    blob_dir: &Path,
    exclude_media: bool,
) -> ToolPipeline {
    let tools = config.tools();
    let artifact = backup_artifact(handler, stem).unwrap_or_default();
    match handler {
        BackupHandler::Tar | BackupHandler::TarGz => {
            let mut stages = vec![tar_create(config, source, exclude_media)];
            if handler == BackupHandler::TarGz {
                stages.push(ToolCommand::new(&tools.pigz).arg("-c"));
            }
            let mut prefix = artifact.into_os_string();
            prefix.push(".");
            stages.push(
                ToolCommand::new(&tools.split)
                    .arg("-a")
                    .arg(SPLIT_SUFFIX_LEN.to_string())
                    .arg("-b")
                    .arg(config.split_size().to_string())
                    .arg("-")
                    .arg(prefix),
            );
            // tar lists members on stderr while the archive travels on stdout
            ToolPipeline::new(stages, Capture::Stderr(0))
        }
        BackupHandler::Dedupe => {
            let cmd = ToolCommand::new(&tools.dedupe)
                .arg("c")
                .arg(source)
                .arg(blob_dir)
                .arg(artifact);
            let cmd = if exclude_media { cmd.arg("./media") } else { cmd };
            ToolPipeline::single(cmd, Capture::Stdout)
        }
        BackupHandler::Yaffs2Image => ToolPipeline::single(
            ToolCommand::new(&tools.mkyaffs2image)
                .arg(".")
                .arg(artifact)
                .current_dir(source),
            Capture::Stdout,
        ),
        BackupHandler::TarDump => {
            ToolPipeline::single(tar_create(config, source, exclude_media), Capture::Passthrough)
        }
    }
}

/// `artifact` itself plus every split part `<artifact>.<suffix>` next to it, sorted.
pub fn archive_parts(artifact: &Path) -> Result<Vec<PathBuf>> {
    let (dir, name) = parent_and_name(artifact);
    let name = name.to_string_lossy().into_owned();
    let mut parts = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let is_part = file_name == name
            || file_name
                .strip_prefix(name.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|suffix| {
                    suffix.len() == SPLIT_SUFFIX_LEN && suffix.bytes().all(|b| b.is_ascii_lowercase())
                });
        if is_part {
            parts.push(entry.path());
        }
    }
    parts.sort();
    Ok(parts)
}

/// Pipeline that restores `artifact` into `mount_point` with `handler`.
pub fn restore_pipeline(
    config: &NandroidConfig,
    handler: RestoreHandler,
    artifact: &Path,
    mount_point: &Path,
) -> Result<ToolPipeline> {
    let tools = config.tools();
    let (parent, _) = parent_and_name(mount_point);
    let tar_extract = || {
        ToolCommand::new(&tools.tar)
            .args(["-x", "-v", "-f", "-"])
            .current_dir(&parent)
    };
    let pipeline = match handler {
        RestoreHandler::Tar | RestoreHandler::TarGz => {
            let mut stages = vec![ToolCommand::new(&tools.cat).args(archive_parts(artifact)?)];
            if handler == RestoreHandler::TarGz {
                stages.push(ToolCommand::new(&tools.pigz).args(["-d", "-c"]));
            }
            stages.push(tar_extract());
            ToolPipeline::new(stages, Capture::Stdout)
        }
        RestoreHandler::Dedupe => {
            let run_dir = artifact.parent().unwrap_or(Path::new("."));
            ToolPipeline::single(
                ToolCommand::new(&tools.dedupe)
                    .arg("x")
                    .arg(artifact)
                    .arg(config.blob_dir_for(run_dir))
                    .arg(mount_point),
                Capture::Stdout,
            )
        }
        RestoreHandler::Unyaffs => ToolPipeline::single(
            ToolCommand::new(&tools.unyaffs)
                .arg(artifact)
                .current_dir(mount_point),
            Capture::Stdout,
        ),
        RestoreHandler::TarUndump => ToolPipeline::single(tar_extract(), Capture::Passthrough),
    };
    Ok(pipeline)
}
