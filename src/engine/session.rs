use crate::engine::format::{BackupFormat, BackupHandler, RestoreHandler};
use crate::engine::progress::ProgressCounter;

/// Where a run's artifacts live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// Artifacts are files in a backup directory.
    Directory,
    /// A single partition is carried over standard output or standard input.
    Stream,
}

/// State of one backup, restore, dump or undump run.
///
/// Created at the start of a run and threaded through every partition operation; nothing here
/// outlives the run.
#[derive(Clone, Debug)]
pub struct BackupSession {
    configured_format: BackupFormat,
    forced_format: Option<BackupFormat>,
    mode: SessionMode,
    progress: ProgressCounter,
    progress_enabled: bool,
    gc_collected: bool,
}

impl BackupSession {
    pub fn new(configured_format: BackupFormat, forced_format: Option<BackupFormat>) -> Self {
        Self {
            configured_format,
            forced_format,
            mode: SessionMode::Directory,
            progress: ProgressCounter::default(),
            progress_enabled: true,
            gc_collected: false,
        }
    }

    pub fn streaming(configured_format: BackupFormat) -> Self {
        Self {
            mode: SessionMode::Stream,
            progress_enabled: false,
            ..Self::new(configured_format, None)
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// The format in effect for this run: the forced override, else the persisted default.
    pub fn default_format(&self) -> BackupFormat {
        self.forced_format.unwrap_or(self.configured_format)
    }

    pub fn forced_format(&self) -> Option<BackupFormat> {
        self.forced_format
    }

    pub fn default_backup_handler(&self) -> BackupHandler {
        match self.mode {
            SessionMode::Directory => self.default_format().backup_handler(),
            SessionMode::Stream => BackupHandler::TarDump,
        }
    }

    pub fn default_restore_handler(&self) -> RestoreHandler {
        match self.mode {
            SessionMode::Directory => self.default_format().restore_handler(),
            SessionMode::Stream => RestoreHandler::TarUndump,
        }
    }

    pub fn progress(&self) -> &ProgressCounter {
        &self.progress
    }

    pub fn progress_mut(&mut self) -> &mut ProgressCounter {
        &mut self.progress
    }

    pub fn progress_enabled(&self) -> bool {
        self.progress_enabled
    }

    pub fn set_progress_enabled(&mut self, enabled: bool) {
        self.progress_enabled = enabled && self.mode == SessionMode::Directory;
    }

    pub fn gc_collected(&self) -> bool {
        self.gc_collected
    }

    /// Sets the collected bit, returning whether this call was the one that set it.
    pub fn mark_gc_collected(&mut self) -> bool {
        !std::mem::replace(&mut self.gc_collected, true)
    }
}
