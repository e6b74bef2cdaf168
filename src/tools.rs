#![forbid(unsafe_code)]

//! External tool probing and bounded process execution.

use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {}s", .timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
    #[error("waiting on {program} failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stderr: String,
}

/// Runs `command` to completion, killing it once `timeout` elapses.
///
/// Stdout is discarded. Stderr is drained on a helper thread so a chatty
/// child cannot block on a full pipe while we poll.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<ToolOutput, ToolError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ToolError::Launch {
            program: program.clone(),
            source,
        })?;

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = String::new();
            let _ = pipe.read_to_string(&mut buffer);
            buffer
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                warn!(program, "killing process after {}s", timeout.as_secs());
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::TimedOut { program, timeout });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::Wait { program, source });
            }
        }
    };

    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    Ok(ToolOutput { status, stderr })
}

/// True when `program -version`-style probing succeeds.
pub fn program_available(program: &Path, version_flag: &str) -> bool {
    Command::new(program)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Handle on the transcoder (ffmpeg). `binary` is `None` when the tool was
/// not found at startup; every feature that needs it is then skipped.
#[derive(Debug, Clone)]
pub struct Transcoder {
    binary: Option<PathBuf>,
    timeout: Duration,
}

impl Transcoder {
    /// Probes `program` once and remembers the outcome.
    pub fn detect(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let binary = if program_available(&program, "-version") {
            debug!(program = %program.display(), "transcoder available");
            Some(program)
        } else {
            warn!(program = %program.display(), "transcoder not found; chapter embedding and merges disabled");
            None
        };
        Self {
            binary,
            timeout: DEFAULT_TRANSCODE_TIMEOUT,
        }
    }

    pub fn at(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
            timeout: DEFAULT_TRANSCODE_TIMEOUT,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            binary: None,
            timeout: DEFAULT_TRANSCODE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn available(&self) -> bool {
        self.binary.is_some()
    }

    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
