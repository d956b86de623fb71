//! Structured external tool invocations.
//!
//! Tools are never run through a shell: a [`ToolPipeline`] is a list of programs with argument
//! vectors whose standard streams are chained stage to stage, and exactly one stream (or none)
//! is handed back to the caller line by line.

use crate::engine::result_error::error::Error;
use crate::engine::result_error::result::Result;
use itertools::Itertools;
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg<A: AsRef<OsStr>>(mut self, arg: A) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Program followed by its arguments, lossily converted for logging and assertions.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect()
    }
}

/// Which stream of a pipeline is read back line by line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capture {
    /// Standard output of the last stage.
    Stdout,
    /// Standard error of the given stage; the last stage's standard output is discarded.
    Stderr(usize),
    /// Nothing is captured: the first stage reads this process's standard input, the last
    /// stage writes this process's standard output and diagnostics are discarded.
    Passthrough,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolPipeline {
    stages: Vec<ToolCommand>,
    capture: Capture,
}

impl ToolPipeline {
    pub fn new(stages: Vec<ToolCommand>, capture: Capture) -> Self {
        Self { stages, capture }
    }

    pub fn single(command: ToolCommand, capture: Capture) -> Self {
        Self::new(vec![command], capture)
    }

    pub fn stages(&self) -> &[ToolCommand] {
        &self.stages
    }

    pub fn capture(&self) -> Capture {
        self.capture
    }

    /// Name used when reporting launch or exit failures.
    pub fn program(&self) -> String {
        self.stages.iter().map(ToolCommand::program).join(" | ")
    }

    pub fn argv(&self) -> Vec<Vec<String>> {
        self.stages.iter().map(ToolCommand::argv).collect()
    }
}

/// Runs pipelines. The engine only ever drives one at a time.
pub trait ProcessSpawner {
    /// Launches `pipeline`, calls `on_line` for each line of the captured stream, and returns
    /// the first non-zero stage status (or `0`) once every stage has exited.
    ///
    /// Fails with [`Error::ToolLaunch`] if any stage cannot be started; no stage is left
    /// running in that case.
    fn spawn_streaming(&self, pipeline: &ToolPipeline, on_line: &mut dyn FnMut(&str)) -> Result<i32>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSpawner;

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

/// Drains every stage's wait result, then reports the first wait error or else the first
/// non-zero status.
fn first_failure<I>(waits: I) -> Result<i32>
where
    I: IntoIterator<Item = std::io::Result<ExitStatus>>,
{
    let mut status = 0;
    let mut wait_error = None;
    for wait in waits {
        match wait {
            Ok(exit) => {
                let code = exit_code(exit);
                if status == 0 {
                    status = code;
                }
            }
            Err(e) => {
                wait_error.get_or_insert(e);
            }
        }
    }
    match wait_error {
        Some(e) => Err(e.into()),
        None => Ok(status),
    }
}

fn reap(children: &mut [Child]) {
    for child in children.iter_mut() {
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl ProcessSpawner for SystemSpawner {
    fn spawn_streaming(&self, pipeline: &ToolPipeline, on_line: &mut dyn FnMut(&str)) -> Result<i32> {
        let last = pipeline.stages.len().saturating_sub(1);
        let mut children: Vec<Child> = Vec::with_capacity(pipeline.stages.len());
        let mut captured: Option<Box<dyn Read>> = None;

        for (idx, stage) in pipeline.stages.iter().enumerate() {
            let mut cmd = Command::new(&stage.program);
            cmd.args(&stage.args);
            if let Some(dir) = &stage.current_dir {
                cmd.current_dir(dir);
            }

            let stdin = match children.last_mut().and_then(|c| c.stdout.take()) {
                Some(out) => Stdio::from(out),
                None if pipeline.capture == Capture::Passthrough => Stdio::inherit(),
                None => Stdio::null(),
            };
            cmd.stdin(stdin);

            let stdout = match (idx == last, pipeline.capture) {
                (false, _) | (true, Capture::Stdout) => Stdio::piped(),
                (true, Capture::Stderr(_)) => Stdio::null(),
                (true, Capture::Passthrough) => Stdio::inherit(),
            };
            cmd.stdout(stdout);

            let stderr = match pipeline.capture {
                Capture::Stderr(i) if i == idx => Stdio::piped(),
                Capture::Passthrough => Stdio::null(),
                _ => Stdio::inherit(),
            };
            cmd.stderr(stderr);

            tracing::debug!("Spawning {:?}", stage.argv());
            match cmd.spawn() {
                Ok(mut child) => {
                    if let Capture::Stderr(i) = pipeline.capture {
                        if i == idx {
                            captured = child.stderr.take().map(|s| Box::new(s) as Box<dyn Read>);
                        }
                    }
                    children.push(child);
                }
                Err(error) => {
                    reap(&mut children);
                    return Err(Error::ToolLaunch {
                        program: stage.program.clone(),
                        error,
                    });
                }
            }
        }

        if pipeline.capture == Capture::Stdout {
            captured = children
                .last_mut()
                .and_then(|c| c.stdout.take())
                .map(|s| Box::new(s) as Box<dyn Read>);
        }

        if let Some(stream) = captured {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => on_line(&String::from_utf8_lossy(&buf)),
                    Err(e) => {
                        tracing::warn!("Reading output of {} failed: {}", pipeline.program(), e);
                        break;
                    }
                }
            }
        }

        first_failure(children.iter_mut().map(Child::wait))
    }
}
