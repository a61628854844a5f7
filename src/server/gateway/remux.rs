//! HLS-to-TS remuxing via an FFmpeg child process
//!
//! HLS upstreams can't be piped to the consumer directly: it expects a raw
//! MPEG-TS byte stream. FFmpeg reads the playlist and writes TS to stdout,
//! copying codecs; transcoding to H.264+AAC only happens when forced (`on`)
//! or when `auto` detects the copy attempt dying immediately, which is what
//! an incompatible codec looks like from out here.
//!
//! # Requirements
//!
//! FFmpeg must be installed and available in the system PATH.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use crate::config::TranscodeMode;

/// How long the `auto` probe waits for the copy attempt to survive
const AUTO_PROBE_WINDOW: Duration = Duration::from_secs(2);

/// Check if FFmpeg is available in PATH
pub fn check_ffmpeg_available() -> Result<(), io::Error> {
    match std::process::Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::Other,
            "FFmpeg returned non-zero exit code",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "FFmpeg not found. Install FFmpeg and ensure it is in PATH.",
        )),
        Err(e) => Err(e),
    }
}

/// A running FFmpeg remux child
pub struct Remuxer {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_handle: tokio::task::JoinHandle<()>,
}

impl Remuxer {
    /// Spawn FFmpeg for an HLS URL with the given transcode mode
    ///
    /// In `auto` mode a codec-copy child is spawned first; if it dies
    /// within the probe window, it is replaced by a transcoding child.
    pub async fn open(
        url: &str,
        mode: TranscodeMode,
        session_id: &str,
    ) -> Result<Self, io::Error> {
        check_ffmpeg_available()?;

        match mode {
            TranscodeMode::Off => Self::spawn(url, false, session_id),
            TranscodeMode::On => Self::spawn(url, true, session_id),
            TranscodeMode::Auto => {
                let mut copy = Self::spawn(url, false, session_id)?;
                tokio::time::sleep(AUTO_PROBE_WINDOW).await;
                match copy.child.try_wait()? {
                    // Still running: the copy path works
                    None => Ok(copy),
                    Some(status) => {
                        tracing::warn!(
                            session_id,
                            %status,
                            "codec copy died immediately, retrying with transcode"
                        );
                        Self::spawn(url, true, session_id)
                    }
                }
            }
        }
    }

    fn spawn(url: &str, transcode: bool, session_id: &str) -> Result<Self, io::Error> {
        let mut command = Command::new("ffmpeg");
        command.args([
            "-hide_banner",
            "-loglevel",
            "warning",
            "-reconnect",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_delay_max",
            "2",
            "-i",
            url,
        ]);

        if transcode {
            command.args([
                "-c:v", "libx264", "-preset", "veryfast", "-c:a", "aac", "-b:a", "128k",
            ]);
        } else {
            command.args(["-c", "copy"]);
        }

        command.args([
            "-f",
            "mpegts",
            "-fflags",
            "+genpts",
            "-mpegts_flags",
            "+initial_discontinuity",
            "-",
        ]);

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Surface FFmpeg warnings with session context
        let stderr_session = session_id.to_string();
        let stderr_handle = tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(session_id = %stderr_session, "ffmpeg: {}", line);
            }
        });

        Ok(Self {
            child,
            stdout,
            stderr_handle,
        })
    }

    /// Take the TS output pipe; the gateway reads it like any upstream body
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }
}

impl Drop for Remuxer {
    fn drop(&mut self) {
        // kill_on_drop handles the child; the stderr task ends on EOF
        self.stderr_handle.abort();
        let _ = self.child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_ffmpeg_reports_missing_binary() {
        // Either ffmpeg exists (Ok) or the error names the problem; both are
        // valid on CI machines
        match check_ffmpeg_available() {
            Ok(()) => {}
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
        }
    }
}
