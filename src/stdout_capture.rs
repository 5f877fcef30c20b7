//! Stdout capture: reclassify native-library log lines written straight to
//! file descriptor 1.
//!
//! The native library bypasses the process logger entirely, so while it is
//! active fd 1 is redirected through a pipe. A dedicated reader thread
//! parses each line: host-engine log lines become structured log records,
//! anything else passes through verbatim to the real stdout.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use nix::unistd::{dup, dup2};
use regex::Regex;
use tracing::info;

const STDOUT_FILENO: RawFd = 1;

/// `YYYY-MM-DD hh:mm:ss.mmm LEVEL [pid:tid] text`
fn native_log_regex() -> Regex {
    Regex::new(
        r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{3}\s+(\w+)\s+\[(\d+):(\d+)\]\s?(.*)$",
    )
    .unwrap()
}

/// Parse one captured line. Returns `(level, message)` for native log
/// lines, `None` for pass-through text.
pub fn parse_native_log_line(line: &str) -> Option<(String, String)> {
    // Compiled once per thread; the reader owns a single instance.
    thread_local! {
        static RE: Regex = native_log_regex();
    }
    RE.with(|re| {
        let caps = re.captures(line)?;
        Some((caps[1].to_string(), caps[4].to_string()))
    })
}

pub struct StdoutCapture {
    saved_stdout: RawFd,
    /// Original pipe write end; dropping it (after fd 1 is restored) gives
    /// the reader EOF.
    pipe_write: Option<OwnedFd>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    released: bool,
}

impl StdoutCapture {
    /// Redirect fd 1 through a fresh pipe and start the reader thread.
    pub fn install() -> Result<Self> {
        let saved_stdout = dup(STDOUT_FILENO).context("could not duplicate stdout")?;
        let (pipe_read, pipe_write) = nix::unistd::pipe().context("could not create pipe")?;
        dup2(pipe_write.as_raw_fd(), STDOUT_FILENO).context("could not redirect stdout")?;

        // The reader writes pass-through lines to its own copy of the
        // saved stdout so release() can close ours independently.
        let passthrough_fd = dup(saved_stdout).context("could not duplicate saved stdout")?;

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("stdout-capture".into())
                .spawn(move || {
                    let mut passthrough = unsafe { File::from_raw_fd(passthrough_fd) };
                    let reader = BufReader::new(File::from(pipe_read));
                    for line in reader.lines() {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let Ok(line) = line else { break };
                        match parse_native_log_line(&line) {
                            Some((level, message)) => {
                                info!(dcgm_level = %level, "{message}");
                            }
                            None => {
                                let _ = writeln!(passthrough, "{line}");
                            }
                        }
                    }
                })
                .context("could not spawn capture reader")?
        };

        Ok(Self {
            saved_stdout,
            pipe_write: Some(pipe_write),
            reader: Some(reader),
            stop,
            released: false,
        })
    }

    /// Restore fd 1 and stop the reader. Idempotent; reports the first
    /// error encountered.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.stop.store(true, Ordering::Relaxed);

        let mut first_error = None;
        if let Err(e) = dup2(self.saved_stdout, STDOUT_FILENO) {
            first_error = Some(anyhow::Error::from(e).context("could not restore stdout"));
        }
        // fd 1 is a fresh copy now; the saved descriptor can go.
        drop(unsafe { OwnedFd::from_raw_fd(self.saved_stdout) });

        // EOF for the reader: fd 1 no longer points at the pipe, and this
        // was the last write end.
        self.pipe_write.take();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                first_error.get_or_insert(anyhow::anyhow!("capture reader panicked"));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for StdoutCapture {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
