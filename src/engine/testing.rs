//! In-memory collaborators for exercising the engine without a device.

use crate::engine::command::{ProcessSpawner, ToolPipeline};
use crate::engine::labels::SecurityLabels;
use crate::engine::result_error::error::Error;
use crate::engine::result_error::result::Result;
use crate::engine::ui::{BackgroundIcon, Ui};
use crate::engine::volume::{FsType, PartitionDescriptor, RawTarget, Volumes};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

enum Scripted {
    Output(Vec<String>, i32),
    LaunchFailure,
}

#[derive(Default)]
struct SpawnerState {
    calls: Vec<ToolPipeline>,
    queued: VecDeque<Scripted>,
    exit_by_program: HashMap<String, i32>,
}

/// Records every pipeline and replays scripted outcomes. Clones share state.
///
/// Queued outcomes are consumed first, in order. Otherwise a pipeline containing a program
/// registered with [`RecordingSpawner::exit_with`] reports that status, and anything else
/// succeeds silently.
#[derive(Clone, Default)]
pub struct RecordingSpawner {
    state: Rc<RefCell<SpawnerState>>,
}

impl RecordingSpawner {
    pub fn push_output(&self, lines: Vec<String>, status: i32) {
        self.state
            .borrow_mut()
            .queued
            .push_back(Scripted::Output(lines, status));
    }

    pub fn push_launch_failure(&self) {
        self.state
            .borrow_mut()
            .queued
            .push_back(Scripted::LaunchFailure);
    }

    pub fn exit_with<S: Into<String>>(&self, program: S, status: i32) {
        self.state
            .borrow_mut()
            .exit_by_program
            .insert(program.into(), status);
    }

    /// argv of each stage of each recorded pipeline.
    pub fn calls(&self) -> Vec<Vec<Vec<String>>> {
        self.state
            .borrow()
            .calls
            .iter()
            .map(ToolPipeline::argv)
            .collect()
    }

    pub fn pipelines(&self) -> Vec<ToolPipeline> {
        self.state.borrow().calls.clone()
    }

    /// Recorded pipelines with a stage running `program`.
    pub fn calls_to(&self, program: &str) -> Vec<Vec<Vec<String>>> {
        self.calls()
            .into_iter()
            .filter(|p| p.iter().any(|stage| stage[0] == program))
            .collect()
    }
}

impl ProcessSpawner for RecordingSpawner {
    fn spawn_streaming(&self, pipeline: &ToolPipeline, on_line: &mut dyn FnMut(&str)) -> Result<i32> {
        let scripted = {
            let mut state = self.state.borrow_mut();
            state.calls.push(pipeline.clone());
            match state.queued.pop_front() {
                Some(s) => s,
                None => {
                    let status = pipeline
                        .stages()
                        .iter()
                        .find_map(|s| state.exit_by_program.get(s.program()).copied())
                        .unwrap_or(0);
                    Scripted::Output(vec![], status)
                }
            }
        };
        match scripted {
            Scripted::Output(lines, status) => {
                lines.iter().for_each(|l| on_line(l.as_str()));
                Ok(status)
            }
            Scripted::LaunchFailure => Err(Error::ToolLaunch {
                program: pipeline
                    .stages()
                    .first()
                    .map(|s| s.program().to_string())
                    .unwrap_or_default(),
                error: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    Print(String),
    File(String),
    Progress(f32),
    ShowProgress,
    Indeterminate,
    Reset,
    Background(BackgroundIcon),
}

/// Records every UI call. Clones share state.
#[derive(Clone, Default)]
pub struct RecordingUi {
    events: Rc<RefCell<Vec<UiEvent>>>,
}

impl RecordingUi {
    pub fn count<F: Fn(&UiEvent) -> bool>(&self, pred: F) -> usize {
        self.events.borrow().iter().filter(|e| pred(e)).count()
    }

    pub fn last(&self) -> Option<UiEvent> {
        self.events.borrow().last().cloned()
    }

    pub fn last_progress(&self) -> Option<f32> {
        self.events.borrow().iter().rev().find_map(|e| match e {
            UiEvent::Progress(f) => Some(*f),
            _ => None,
        })
    }

    /// Whether any printed message contains `needle`.
    pub fn printed(&self, needle: &str) -> bool {
        self.events
            .borrow()
            .iter()
            .any(|e| matches!(e, UiEvent::Print(m) if m.contains(needle)))
    }

    fn push(&self, event: UiEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl Ui for RecordingUi {
    fn print(&mut self, msg: &str) {
        self.push(UiEvent::Print(msg.to_string()));
    }

    fn print_file(&mut self, name: &str) {
        self.push(UiEvent::File(name.to_string()));
    }

    fn set_progress(&mut self, fraction: f32) {
        self.push(UiEvent::Progress(fraction));
    }

    fn show_progress(&mut self) {
        self.push(UiEvent::ShowProgress);
    }

    fn show_indeterminate_progress(&mut self) {
        self.push(UiEvent::Indeterminate);
    }

    fn reset_progress(&mut self) {
        self.push(UiEvent::Reset);
    }

    fn set_background(&mut self, icon: BackgroundIcon) {
        self.push(UiEvent::Background(icon));
    }

    fn text_cols(&self) -> usize {
        80
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeOp {
    Mount(PathBuf),
    Unmount(PathBuf),
    FormatVolume(PathBuf),
    FormatDevice(PathBuf, PathBuf, FsType),
    BackupRaw(PathBuf, RawTarget),
    RestoreRaw(PathBuf, RawTarget),
    PerfMode(bool),
    Sync,
}

#[derive(Default)]
struct VolumesState {
    volumes: Vec<PartitionDescriptor>,
    mounted: HashMap<PathBuf, String>,
    mount_failures: HashSet<PathBuf>,
    ops: Vec<VolumeOp>,
    data_media: bool,
    free_space: u64,
}

/// Volume table held in memory. Mounting only flips a flag; nothing touches the disk.
#[derive(Clone)]
pub struct FakeVolumes {
    state: Rc<RefCell<VolumesState>>,
}

impl Default for FakeVolumes {
    fn default() -> Self {
        let state = VolumesState {
            free_space: u64::MAX,
            ..Default::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }
}

impl FakeVolumes {
    pub fn with_volume<A, F>(self, mount_point: A, fs_type: F) -> Self
    where
        A: Into<PathBuf>,
        F: Into<FsType>,
    {
        let mount_point = mount_point.into();
        let device = PathBuf::from("/dev/block").join(crate::engine::volume::partition_name(&mount_point));
        self.state
            .borrow_mut()
            .volumes
            .push(PartitionDescriptor::new(mount_point, device, fs_type, true));
        self
    }

    /// A volume whose block device is absent on this device.
    pub fn with_absent_volume<A, F>(self, mount_point: A, fs_type: F) -> Self
    where
        A: Into<PathBuf>,
        F: Into<FsType>,
    {
        let mount_point = mount_point.into();
        self.state
            .borrow_mut()
            .volumes
            .push(PartitionDescriptor::new(mount_point, "/dev/block/missing", fs_type, false));
        self
    }

    pub fn with_data_media(self) -> Self {
        self.state.borrow_mut().data_media = true;
        self
    }

    pub fn with_free_space(self, bytes: u64) -> Self {
        self.state.borrow_mut().free_space = bytes;
        self
    }

    pub fn failing_mount<A: Into<PathBuf>>(self, mount_point: A) -> Self {
        self.state
            .borrow_mut()
            .mount_failures
            .insert(mount_point.into());
        self
    }

    pub fn ops(&self) -> Vec<VolumeOp> {
        self.state.borrow().ops.clone()
    }

    pub fn is_mounted<P: AsRef<Path>>(&self, mount_point: P) -> bool {
        self.state
            .borrow()
            .mounted
            .contains_key(mount_point.as_ref())
    }

    fn record(&self, op: VolumeOp) {
        self.state.borrow_mut().ops.push(op);
    }

    fn lookup(&self, path: &Path) -> Result<PartitionDescriptor> {
        self.volume_for_path(path)
            .ok_or_else(|| Error::VolumeNotFound(path.into()))
    }
}

impl Volumes for FakeVolumes {
    fn volume_for_path(&self, path: &Path) -> Option<PartitionDescriptor> {
        self.state
            .borrow()
            .volumes
            .iter()
            .filter(|v| path.starts_with(v.mount_point()))
            .max_by_key(|v| v.mount_point().as_os_str().len())
            .cloned()
    }

    fn mounted_filesystem(&self, mount_point: &Path) -> Option<String> {
        self.state.borrow().mounted.get(mount_point).cloned()
    }

    fn ensure_mounted(&mut self, path: &Path) -> Result<()> {
        let volume = self.lookup(path)?;
        let mount_point = volume.mount_point().clone();
        let mut state = self.state.borrow_mut();
        if state.mount_failures.contains(&mount_point) || volume.fs_type().is_raw() {
            return Err(Error::Mount {
                error: Box::new(Error::NotMounted(mount_point.clone())),
                mount_point,
            });
        }
        if !state.mounted.contains_key(&mount_point) {
            state.ops.push(VolumeOp::Mount(mount_point.clone()));
            state
                .mounted
                .insert(mount_point, volume.fs_type().to_string());
        }
        Ok(())
    }

    fn ensure_unmounted(&mut self, path: &Path) -> Result<()> {
        let volume = self.lookup(path)?;
        let mut state = self.state.borrow_mut();
        if state.mounted.remove(volume.mount_point()).is_some() {
            state.ops.push(VolumeOp::Unmount(volume.mount_point().clone()));
        }
        Ok(())
    }

    fn format_volume(&mut self, path: &Path) -> Result<()> {
        self.lookup(path)?;
        self.record(VolumeOp::FormatVolume(path.into()));
        Ok(())
    }

    fn format_device(&mut self, device: &Path, path: &Path, fs_type: &FsType) -> Result<()> {
        self.lookup(path)?;
        self.ensure_unmounted(path)?;
        self.record(VolumeOp::FormatDevice(device.into(), path.into(), fs_type.clone()));
        Ok(())
    }

    fn backup_raw(&mut self, volume: &PartitionDescriptor, target: &RawTarget) -> Result<()> {
        if let RawTarget::File(p) = target {
            std::fs::write(p, b"raw")?;
        }
        self.record(VolumeOp::BackupRaw(volume.mount_point().clone(), target.clone()));
        Ok(())
    }

    fn restore_raw(&mut self, volume: &PartitionDescriptor, source: &RawTarget) -> Result<()> {
        self.record(VolumeOp::RestoreRaw(volume.mount_point().clone(), source.clone()));
        Ok(())
    }

    fn is_data_media(&self) -> bool {
        self.state.borrow().data_media
    }

    fn is_data_media_volume_path(&self, path: &Path) -> bool {
        self.is_data_media() && path.starts_with("/data/media")
    }

    fn free_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.state.borrow().free_space)
    }

    fn set_perf_mode(&mut self, enabled: bool) {
        self.record(VolumeOp::PerfMode(enabled));
    }

    fn sync(&mut self) {
        self.record(VolumeOp::Sync);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LabelOp {
    Capture(PathBuf, PathBuf),
    RestoreFromFile(PathBuf, PathBuf),
    Relabel(PathBuf, PathBuf),
}

/// Records label calls; restoring from a file or from policy can be made to fail.
#[derive(Clone, Default)]
pub struct FakeLabels {
    ops: Rc<RefCell<Vec<LabelOp>>>,
    fail_from_file: bool,
    fail_relabel: bool,
}

impl FakeLabels {
    pub fn failing_from_file(mut self) -> Self {
        self.fail_from_file = true;
        self
    }

    pub fn failing_relabel(mut self) -> Self {
        self.fail_relabel = true;
        self
    }

    pub fn ops(&self) -> Vec<LabelOp> {
        self.ops.borrow().clone()
    }
}

impl SecurityLabels for FakeLabels {
    fn capture_labels(&mut self, root: &Path, labels_file: &Path) -> Result<()> {
        self.ops
            .borrow_mut()
            .push(LabelOp::Capture(root.into(), labels_file.into()));
        Ok(())
    }

    fn restore_labels(&mut self, labels_file: Option<&Path>, root: &Path, exclude: &Path) -> Result<()> {
        let op = match labels_file {
            Some(file) => LabelOp::RestoreFromFile(file.into(), root.into()),
            None => LabelOp::Relabel(root.into(), exclude.into()),
        };
        self.ops.borrow_mut().push(op);
        let failed = match labels_file {
            Some(_) => self.fail_from_file,
            None => self.fail_relabel,
        };
        if failed {
            return Err(Error::ToolExit {
                program: "restorecon".into(),
                status: 1,
            });
        }
        Ok(())
    }
}
