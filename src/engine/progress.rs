//! Subprocess progress bridge.
//!
//! Every handler that shells out builds a [`ToolPipeline`] and hands it to [`run_streaming`],
//! which turns each line of the tool's output into a progress tick.

use crate::engine::command::{Capture, ProcessSpawner, ToolCommand, ToolPipeline};
use crate::engine::result_error::error::Error;
use crate::engine::result_error::result::{status_to_result, Result};
use crate::engine::session::BackupSession;
use crate::engine::ui::Ui;
use std::path::Path;

/// Longest output line passed on to the UI.
pub const MAX_LINE_LEN: usize = 4096;

/// Files seen against the pre-scan estimate for the current partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressCounter {
    seen: u64,
    estimate: u64,
}

impl ProgressCounter {
    pub fn reset(&mut self, estimate: u64) {
        self.seen = 0;
        self.estimate = estimate;
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    /// Counts one more file and returns the new fraction, if an estimate is known.
    pub fn tick(&mut self) -> Option<f32> {
        self.seen += 1;
        self.fraction()
    }

    pub fn fraction(&self) -> Option<f32> {
        (self.estimate != 0).then(|| (self.seen as f32 / self.estimate as f32).min(1.0))
    }
}

/// Reduces a tool output line to the file name shown to the user.
pub fn display_line(line: &str, cols: usize) -> String {
    let line = line.trim_end_matches(['\n', '\r']);
    let trimmed = line.trim_end_matches('/');
    let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let limit = MAX_LINE_LEN.min(cols).saturating_sub(1);
    name.chars().take(limit).collect()
}

/// Runs `pipeline`, ticking the session's progress counter once per output line.
pub fn run_streaming(
    spawner: &dyn ProcessSpawner,
    ui: &mut dyn Ui,
    session: &mut BackupSession,
    pipeline: &ToolPipeline,
) -> Result<()> {
    let program = pipeline.program();
    let cols = ui.text_cols();
    let progress_enabled = session.progress_enabled();
    let mut indeterminate = false;

    let res = spawner.spawn_streaming(pipeline, &mut |line| {
        let fraction = session.progress_mut().tick();
        if progress_enabled {
            ui.print_file(&display_line(line, cols));
        }
        match fraction.filter(|_| progress_enabled) {
            Some(fraction) => ui.set_progress(fraction),
            None if !indeterminate => {
                indeterminate = true;
                ui.show_indeterminate_progress();
            }
            None => {}
        }
    });

    let status = match res {
        Ok(status) => status,
        Err(e @ Error::ToolLaunch { .. }) => {
            ui.print(&format!("Unable to execute {}.", program));
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    tracing::debug!("{} exited with {} after {} lines", program, status, session.progress().seen());
    status_to_result(status, |status| Error::ToolExit { program, status })
}

/// Approximate number of filesystem entries below `root`, for the progress percentage only.
///
/// Lines under `exclude` are not counted. Any failure yields zero, which disables the
/// percentage without affecting the backup.
pub fn estimate_entries(
    spawner: &dyn ProcessSpawner,
    find: &str,
    root: &Path,
    exclude: Option<&Path>,
) -> u64 {
    let pipeline = ToolPipeline::single(ToolCommand::new(find).arg(root), Capture::Stdout);
    let exclude = exclude.map(|p| p.to_string_lossy().into_owned());
    let mut count = 0u64;
    let res = spawner.spawn_streaming(&pipeline, &mut |line| {
        if exclude.as_deref().map_or(true, |ex| !line.contains(ex)) {
            count += 1;
        }
    });
    match res {
        Ok(_) => count,
        Err(e) => {
            tracing::debug!("Counting entries under {:?} failed: {}", root, e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::format::BackupFormat;
    use crate::engine::testing::{RecordingSpawner, RecordingUi, UiEvent};

    fn session() -> BackupSession {
        BackupSession::new(BackupFormat::Tar, None)
    }

    fn pipeline() -> ToolPipeline {
        ToolPipeline::single(ToolCommand::new("tar"), Capture::Stderr(0))
    }

    #[test]
    fn test_counter_fraction() {
        let mut counter = ProgressCounter::default();
        assert_eq!(counter.tick(), None);
        counter.reset(4);
        assert_eq!(counter.seen(), 0);
        assert_eq!(counter.tick(), Some(0.25));
        counter.reset(1);
        counter.tick();
        assert_eq!(counter.tick(), Some(1.0));
    }

    #[test]
    fn test_display_line() {
        assert_eq!(display_line("data/app/base.apk\n", 80), "base.apk");
        assert_eq!(display_line("data/app/\n", 80), "app");
        assert_eq!(display_line("averyveryverylongname", 6), "avery");
        assert_eq!(display_line("plain", 0), "");
    }

    #[test]
    fn test_thirty_seven_of_a_hundred() {
        let spawner = RecordingSpawner::default();
        spawner.push_output((0..37).map(|i| format!("data/file{i}\n")).collect(), 0);
        let mut ui = RecordingUi::default();
        let mut session = session();
        session.progress_mut().reset(100);

        run_streaming(&spawner, &mut ui, &mut session, &pipeline()).unwrap();

        assert_eq!(session.progress().seen(), 37);
        let last = ui.last_progress().unwrap();
        assert!((last - 0.37).abs() < 1e-6);
        assert_eq!(ui.count(|e| matches!(e, UiEvent::File(_))), 37);

        session.progress_mut().reset(50);
        assert_eq!(session.progress().seen(), 0);
    }

    #[test]
    fn test_unknown_estimate_is_indeterminate_once() {
        let spawner = RecordingSpawner::default();
        spawner.push_output(vec!["a\n".into(), "b\n".into()], 0);
        let mut ui = RecordingUi::default();
        let mut session = session();

        run_streaming(&spawner, &mut ui, &mut session, &pipeline()).unwrap();

        assert_eq!(ui.count(|e| *e == UiEvent::Indeterminate), 1);
        assert!(ui.last_progress().is_none());
    }

    #[test]
    fn test_hidden_progress_still_counts() {
        let spawner = RecordingSpawner::default();
        spawner.push_output(vec!["a\n".into(), "b\n".into()], 0);
        let mut ui = RecordingUi::default();
        let mut session = session();
        session.set_progress_enabled(false);
        session.progress_mut().reset(2);

        run_streaming(&spawner, &mut ui, &mut session, &pipeline()).unwrap();

        assert_eq!(session.progress().seen(), 2);
        assert_eq!(ui.count(|e| matches!(e, UiEvent::File(_))), 0);
        assert!(ui.last_progress().is_none());
    }

    #[test]
    fn test_non_zero_exit_is_tool_exit() {
        let spawner = RecordingSpawner::default();
        spawner.push_output(vec![], 2);
        let mut ui = RecordingUi::default();
        match run_streaming(&spawner, &mut ui, &mut session(), &pipeline()) {
            Err(Error::ToolExit { status, .. }) => assert_eq!(status, 2),
            other => panic!("Expected ToolExit, got {:?}", other),
        }
    }

    #[test]
    fn test_launch_failure_is_reported() {
        let spawner = RecordingSpawner::default();
        spawner.push_launch_failure();
        let mut ui = RecordingUi::default();
        let err = run_streaming(&spawner, &mut ui, &mut session(), &pipeline()).unwrap_err();
        assert_eq!(err.status(), -1);
        assert!(ui.printed("Unable to execute tar."));
    }

    #[test]
    fn test_estimate_entries_excludes_media() {
        let spawner = RecordingSpawner::default();
        spawner.push_output(
            vec![
                "/data\n".into(),
                "/data/app\n".into(),
                "/data/media\n".into(),
                "/data/media/0/DCIM\n".into(),
            ],
            0,
        );
        let count = estimate_entries(&spawner, "find", Path::new("/data"), Some(Path::new("/data/media")));
        assert_eq!(count, 2);
        assert_eq!(spawner.calls()[0][0], vec!["find", "/data"]);
    }

    #[test]
    fn test_estimate_entries_failure_is_zero() {
        let spawner = RecordingSpawner::default();
        spawner.push_launch_failure();
        assert_eq!(estimate_entries(&spawner, "find", Path::new("/cache"), None), 0);
    }
}
