use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use mjpeg_relay_common::config::CaptureConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::CaptureError;

/// Program and arguments of the process producing the MJPEG stream on stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl CaptureCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// ffmpeg grabbing the X11 display and writing concatenated JPEGs to stdout.
    pub fn ffmpeg(config: &CaptureConfig) -> Self {
        let fps = config.fps.to_string();
        let size = format!("{}x{}", config.width, config.height);
        let qscale = config.qscale().to_string();
        Self::new(
            config.ffmpeg_path.clone(),
            [
                "-hide_banner",
                "-loglevel", "error",
                "-f", "x11grab",
                "-framerate", fps.as_str(),
                "-video_size", size.as_str(),
                "-i", config.display.as_str(),
                "-c:v", "mjpeg",
                "-q:v", qscale.as_str(),
                "-f", "image2pipe",
                "-vcodec", "mjpeg",
                "pipe:1",
            ],
        )
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Owns the capture subprocess and the task forwarding its stderr to the log.
pub struct CaptureSupervisor {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
    program: String,
}

impl CaptureSupervisor {
    /// Spawn the capture process with stdout and stderr piped.
    pub fn spawn(command: &CaptureCommand) -> Result<Self, CaptureError> {
        info!(command = command.display(), "starting capture process");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(CaptureError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(CaptureError::MissingPipe("stderr"))?;

        let program = command.program.clone();
        let log_program = program.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            warn!(program = log_program, "{line}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to read capture stderr");
                        break;
                    }
                }
            }
            debug!(program = log_program, "capture stderr closed");
        });

        debug!(pid = child.id(), program, "capture process started");

        Ok(Self {
            child,
            stdout: Some(stdout),
            stderr_task: Some(stderr_task),
            program,
        })
    }

    /// Hand the MJPEG output stream to the caller. Returns `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus, CaptureError> {
        self.child.wait().await.map_err(CaptureError::Wait)
    }

    /// Ask the process to exit (SIGTERM on Unix), kill it if it is still
    /// running after `grace`, and stop the stderr forwarder.
    pub async fn terminate(mut self, grace: Duration) -> Result<ExitStatus, CaptureError> {
        let result = self.terminate_inner(grace).await;
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        result
    }

    async fn terminate_inner(&mut self, grace: Duration) -> Result<ExitStatus, CaptureError> {
        if let Some(status) = self.child.try_wait().map_err(CaptureError::Wait)? {
            debug!(program = self.program, %status, "capture process already exited");
            return Ok(status);
        }

        info!(program = self.program, "stopping capture process");
        self.request_exit()?;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map_err(CaptureError::Wait),
            Err(_) => {
                warn!(
                    program = self.program,
                    grace_ms = grace.as_millis() as u64,
                    "capture process ignored termination request, killing"
                );
                self.child.kill().await.map_err(CaptureError::Signal)?;
                self.child.wait().await.map_err(CaptureError::Wait)
            }
        }
    }

    #[cfg(unix)]
    fn request_exit(&mut self) -> Result<(), CaptureError> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // SAFETY: pid belongs to a child we have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(CaptureError::Signal(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) -> Result<(), CaptureError> {
        self.child.start_kill().map_err(CaptureError::Signal)
    }
}

/// Check whether ffmpeg is available. Logs a warning if not found.
pub async fn check_ffmpeg_available(ffmpeg_path: &str) -> bool {
    match Command::new(ffmpeg_path).arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!(ffmpeg_path, "ffmpeg is available");
            true
        }
        Ok(_) => {
            warn!(ffmpeg_path, "ffmpeg returned non-zero for -version; capture may fail");
            false
        }
        Err(e) => {
            warn!(
                error = %e,
                ffmpeg_path,
                "ffmpeg not found; screen capture will fail. Install ffmpeg with x11grab support."
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn ffmpeg_command_line() {
        let config = CaptureConfig {
            display: ":42".into(),
            width: 1280,
            height: 720,
            fps: 10,
            jpeg_quality: 80,
            ..CaptureConfig::default()
        };
        let cmd = CaptureCommand::ffmpeg(&config);
        assert_eq!(cmd.program, "ffmpeg");
        assert_eq!(
            cmd.display(),
            "ffmpeg -hide_banner -loglevel error -f x11grab -framerate 10 \
             -video_size 1280x720 -i :42 -c:v mjpeg -q:v 8 -f image2pipe -vcodec mjpeg pipe:1"
        );
    }

    #[tokio::test]
    async fn spawn_missing_program_fails() {
        let cmd = CaptureCommand::new("/nonexistent/capture-binary", Vec::<String>::new());
        match CaptureSupervisor::spawn(&cmd) {
            Err(CaptureError::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/capture-binary")
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reads_stdout_and_exit_status() {
        let cmd = CaptureCommand::new(
            "sh",
            ["-c", "printf 'hello'; echo 'diagnostic line' >&2; exit 3"],
        );
        let mut supervisor = CaptureSupervisor::spawn(&cmd).unwrap();
        let mut stdout = supervisor.take_stdout().unwrap();
        assert!(supervisor.take_stdout().is_none());

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");

        let status = supervisor.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_running_process() {
        let cmd = CaptureCommand::new("sh", ["-c", "sleep 30"]);
        let supervisor = CaptureSupervisor::spawn(&cmd).unwrap();
        assert!(supervisor.id().is_some());

        let started = std::time::Instant::now();
        let status = supervisor.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_kills_process_ignoring_sigterm() {
        let cmd = CaptureCommand::new("sh", ["-c", "trap '' TERM; sleep 30"]);
        let supervisor = CaptureSupervisor::spawn(&cmd).unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = supervisor.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_after_exit_returns_status() {
        let cmd = CaptureCommand::new("sh", ["-c", "exit 0"]);
        let mut supervisor = CaptureSupervisor::spawn(&cmd).unwrap();
        let status = supervisor.wait().await.unwrap();
        assert!(status.success());
        let status = supervisor.terminate(Duration::from_millis(100)).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn missing_ffmpeg_is_reported() {
        assert!(!check_ffmpeg_available("/nonexistent/ffmpeg").await);
    }
}
