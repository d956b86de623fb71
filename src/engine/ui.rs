//! UI/progress collaborator.

use derive_more::Display;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum BackgroundIcon {
    None,
    Installing,
}

/// Receives status text and progress changes. The engine never reads from it.
pub trait Ui {
    /// One human-readable status line.
    fn print(&mut self, msg: &str);

    /// A transient line naming the file a tool is currently processing.
    fn print_file(&mut self, name: &str);

    /// Determinate progress, `fraction` in `[0, 1]`.
    fn set_progress(&mut self, fraction: f32);

    /// Switches to determinate progress starting from zero.
    fn show_progress(&mut self);

    fn show_indeterminate_progress(&mut self);

    fn reset_progress(&mut self);

    fn set_background(&mut self, icon: BackgroundIcon);

    /// Width available for a status line.
    fn text_cols(&self) -> usize;
}

/// [`Ui`] that reports through `tracing`.
#[derive(Clone, Debug)]
pub struct TracingUi {
    text_cols: usize,
}

impl TracingUi {
    pub fn new(text_cols: usize) -> Self {
        Self { text_cols }
    }
}

impl Default for TracingUi {
    fn default() -> Self {
        Self::new(80)
    }
}

impl Ui for TracingUi {
    fn print(&mut self, msg: &str) {
        for line in msg.lines().filter(|l| !l.is_empty()) {
            tracing::info!("{}", line);
        }
    }

    fn print_file(&mut self, name: &str) {
        tracing::trace!("{}", name);
    }

    fn set_progress(&mut self, fraction: f32) {
        tracing::debug!("Progress {:.0}%", fraction * 100.0);
    }

    fn show_progress(&mut self) {
        tracing::debug!("Progress 0%");
    }

    fn show_indeterminate_progress(&mut self) {
        tracing::debug!("Progress indeterminate");
    }

    fn reset_progress(&mut self) {
        tracing::debug!("Progress reset");
    }

    fn set_background(&mut self, icon: BackgroundIcon) {
        tracing::debug!("Background {}", icon);
    }

    fn text_cols(&self) -> usize {
        self.text_cols
    }
}
