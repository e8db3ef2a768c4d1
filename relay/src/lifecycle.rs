use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use mjpeg_relay_capture::mjpeg::READ_CHUNK_SIZE;
use mjpeg_relay_capture::{frames, CaptureCommand, CaptureError, CaptureSupervisor};
use mjpeg_relay_common::frame::Frame;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::FrameBuffer;
use crate::hub::BroadcastHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Stopped => "stopped",
            RelayState::Starting => "starting",
            RelayState::Running => "running",
            RelayState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("capture failed to start: {0}")]
    CaptureStart(#[source] CaptureError),
    #[error("relay is already {0}")]
    NotStopped(RelayState),
    #[error("shutdown was requested before the relay started")]
    ShutdownRequested,
}

/// Reading the capture stream failed. Frames extracted before the failure
/// have already been stored and broadcast.
#[derive(Debug, thiserror::Error)]
#[error("capture stream failed after {frames} frames: {source}")]
pub struct IngestError {
    pub frames: u64,
    #[source]
    pub source: std::io::Error,
}

/// Outcome of one capture session.
#[derive(Debug)]
pub struct RunSummary {
    pub frames: u64,
    pub exit_status: Option<ExitStatus>,
    /// True when the session ended through `Relay::stop` rather than the
    /// capture process going away.
    pub stopped_by_request: bool,
}

/// Drives one capture session: reads the MJPEG stream, stores every frame in
/// the buffer and pushes it to the hub.
pub struct Relay {
    buffer: Arc<FrameBuffer>,
    hub: Arc<BroadcastHub>,
    max_frame_bytes: usize,
    stop_grace: Duration,
    state: watch::Sender<RelayState>,
    shutdown: CancellationToken,
    frames_total: AtomicU64,
}

impl Relay {
    pub fn new(buffer: Arc<FrameBuffer>, hub: Arc<BroadcastHub>, max_frame_bytes: usize) -> Self {
        let (state, _) = watch::channel(RelayState::Stopped);
        Self {
            buffer,
            hub,
            max_frame_bytes,
            stop_grace: Duration::from_secs(3),
            state,
            shutdown: CancellationToken::new(),
            frames_total: AtomicU64::new(0),
        }
    }

    /// How long the capture process gets to exit before it is killed.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }

    /// Request shutdown. `run` stops ingesting, closes every client and
    /// terminates the capture process.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(state = %self.state(), "relay stop requested");
        }
        self.shutdown.cancel();
    }

    /// Run a capture session to completion.
    ///
    /// Returns an error only if the capture process could not be started. A
    /// capture process exiting on its own, even with a failure status, ends
    /// the session normally.
    pub async fn run(&self, command: &CaptureCommand) -> Result<RunSummary, RelayError> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::ShutdownRequested);
        }
        let mut claimed = false;
        self.state.send_if_modified(|state| {
            claimed = *state == RelayState::Stopped;
            if claimed {
                *state = RelayState::Starting;
            }
            claimed
        });
        if !claimed {
            return Err(RelayError::NotStopped(self.state()));
        }
        info!(command = command.program, "relay starting");

        let mut supervisor = match CaptureSupervisor::spawn(command) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                error!(error = %e, "failed to start capture process");
                self.transition(RelayState::Stopped);
                return Err(RelayError::CaptureStart(e));
            }
        };
        let Some(stdout) = supervisor.take_stdout() else {
            self.transition(RelayState::Stopping);
            if let Err(e) = supervisor.terminate(self.stop_grace).await {
                warn!(error = %e, "failed to stop capture process");
            }
            self.transition(RelayState::Stopped);
            return Err(RelayError::CaptureStart(CaptureError::MissingPipe("stdout")));
        };

        let ingested = self.ingest(stdout).await;
        self.transition(RelayState::Stopping);
        let stopped_by_request = self.shutdown.is_cancelled();

        let frames = match ingested {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "failed to read capture stream");
                e.frames
            }
        };

        self.hub.close_all();

        // Give a process that closed its stdout a moment to exit by itself
        // so its real exit status is reported.
        if !stopped_by_request {
            match tokio::time::timeout(self.stop_grace, supervisor.wait()).await {
                Ok(Ok(status)) => debug!(%status, "capture process exited after closing its output"),
                Ok(Err(e)) => debug!(error = %e, "failed to wait for capture process"),
                Err(_) => debug!("capture process still running after closing its output"),
            }
        }
        let exit_status = match supervisor.terminate(self.stop_grace).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "failed to stop capture process");
                None
            }
        };

        match exit_status {
            Some(status) if !status.success() && !stopped_by_request => {
                warn!(%status, frames, "capture process exited with failure status");
            }
            Some(status) => info!(%status, frames, "capture process exited"),
            None => {}
        }

        self.transition(RelayState::Stopped);
        info!(
            frames,
            buffered = self.buffer.len(),
            stopped_by_request,
            "relay stopped"
        );

        Ok(RunSummary {
            frames,
            exit_status,
            stopped_by_request,
        })
    }

    /// Ingestion path: read `reader` until end of stream or shutdown, pushing
    /// every extracted frame into the buffer and the hub. Returns the number
    /// of frames extracted.
    pub async fn ingest<R>(&self, reader: R) -> Result<u64, IngestError>
    where
        R: AsyncRead + Unpin,
    {
        // Wait for the first bytes without consuming them; that is when the
        // capture process counts as running.
        let mut reader = BufReader::with_capacity(READ_CHUNK_SIZE, reader);
        let producing = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!("ingestion cancelled before any output");
                return Ok(0);
            }
            filled = reader.fill_buf() => filled
                .map(|buf| !buf.is_empty())
                .map_err(|source| IngestError { frames: 0, source })?,
        };
        if !producing {
            info!(frames = 0, "capture stream closed");
            return Ok(0);
        }
        if *self.state.borrow() == RelayState::Starting {
            self.transition(RelayState::Running);
        }

        let stream = frames(reader, self.max_frame_bytes).take_until(self.shutdown.cancelled());
        let mut stream = std::pin::pin!(stream);
        let mut count = 0u64;
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(frame) => {
                    self.publish(frame);
                    count += 1;
                }
                Err(source) => return Err(IngestError { frames: count, source }),
            }
        }

        if self.shutdown.is_cancelled() {
            debug!(frames = count, "ingestion cancelled");
        } else {
            info!(frames = count, "capture stream closed");
        }
        Ok(count)
    }

    fn publish(&self, frame: Frame) {
        self.buffer.insert(frame.clone());
        let clients = self.hub.broadcast(&frame);

        let total = self.frames_total.fetch_add(1, Ordering::Relaxed) + 1;
        if total % 30 == 0 {
            debug!(total, clients, buffered = self.buffer.len(), "streamed frames");
        }
    }

    fn transition(&self, next: RelayState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "relay state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncReadExt, ReadBuf};

    use super::*;

    /// A pipe that fails on every read.
    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::other("capture pipe broke")))
        }
    }

    fn relay() -> Arc<Relay> {
        let buffer = Arc::new(FrameBuffer::new(Duration::from_secs(10)));
        let hub = Arc::new(BroadcastHub::new(64));
        Arc::new(Relay::new(buffer, hub, 1024).with_stop_grace(Duration::from_secs(2)))
    }

    #[tokio::test]
    async fn ingest_feeds_buffer_and_hub() {
        let relay = relay();
        let mut viewer = relay.hub().register("viewer");

        let stream: Vec<u8> = vec![
            0x00, 0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9, 0xFF, 0xD8, 0xCC, 0xFF, 0xD9, 0xFF,
        ];
        let (mut writer, reader) = tokio::io::duplex(4);
        let feeder = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in stream.chunks(3) {
                writer.write_all(chunk).await.unwrap();
            }
        });

        let frames = relay.ingest(reader).await.unwrap();
        feeder.await.unwrap();

        assert_eq!(frames, 2);
        assert_eq!(relay.frames_total(), 2);
        assert_eq!(relay.buffer().len(), 2);
        assert_eq!(
            viewer.recv().await.unwrap().as_bytes(),
            &[0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]
        );
        assert_eq!(
            viewer.recv().await.unwrap().as_bytes(),
            &[0xFF, 0xD8, 0xCC, 0xFF, 0xD9]
        );
        let latest = relay.buffer().query(0).unwrap();
        assert_eq!(latest.frame.as_bytes(), &[0xFF, 0xD8, 0xCC, 0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn read_error_keeps_frames_already_published() {
        let relay = relay();
        let mut viewer = relay.hub().register("viewer");
        let data = [0xFF, 0xD8, 0x01, 0xFF, 0xD9, 0xFF, 0xD8, 0x02, 0xFF, 0xD9];

        let err = relay.ingest((&data[..]).chain(BrokenPipe)).await.unwrap_err();
        assert_eq!(err.frames, 2);
        assert_eq!(err.source.to_string(), "capture pipe broke");
        assert_eq!(relay.frames_total(), 2);
        assert_eq!(relay.buffer().len(), 2);
        assert_eq!(viewer.recv().await.unwrap().as_bytes()[2], 0x01);
        assert_eq!(viewer.recv().await.unwrap().as_bytes()[2], 0x02);
    }

    #[tokio::test]
    async fn read_error_before_output_reports_no_frames() {
        let relay = relay();
        let err = relay.ingest(BrokenPipe).await.unwrap_err();
        assert_eq!(err.frames, 0);
        assert!(relay.buffer().is_empty());
    }

    #[tokio::test]
    async fn stop_ends_ingestion_of_an_open_stream() {
        let relay = relay();
        let (mut writer, reader) = tokio::io::duplex(64);
        let session = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.ingest(reader).await })
        };

        use tokio::io::AsyncWriteExt;
        writer.write_all(&[0xFF, 0xD8, 0x07, 0xFF, 0xD9]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.frames_total() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frame never ingested");

        relay.stop();
        let frames = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("ingestion ignored stop")
            .unwrap()
            .unwrap();
        assert_eq!(frames, 1);
        drop(writer);
    }

    #[tokio::test]
    async fn spawn_failure_goes_straight_to_stopped() {
        let relay = relay();
        let command = CaptureCommand::new("/nonexistent/capture-binary", Vec::<String>::new());
        let err = relay.run(&command).await.unwrap_err();
        assert!(matches!(err, RelayError::CaptureStart(CaptureError::Spawn { .. })));
        assert_eq!(relay.state(), RelayState::Stopped);
        assert_eq!(relay.frames_total(), 0);
        assert!(relay.buffer().is_empty());
    }

    #[tokio::test]
    async fn stop_before_run_is_rejected() {
        let relay = relay();
        relay.stop();
        let command = CaptureCommand::new("sh", ["-c", "exit 0"]);
        assert!(matches!(
            relay.run(&command).await,
            Err(RelayError::ShutdownRequested)
        ));
        assert_eq!(relay.state(), RelayState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn capture_exit_ends_session_and_closes_clients() {
        let relay = relay();
        let mut viewer = relay.hub().register("viewer");
        let command = CaptureCommand::new(
            "sh",
            ["-c", r"printf '\377\330\001\377\331\377\330\002\377\331'; exit 2"],
        );

        let summary = relay.run(&command).await.unwrap();
        assert_eq!(summary.frames, 2);
        assert!(!summary.stopped_by_request);
        assert_eq!(summary.exit_status.and_then(|s| s.code()), Some(2));
        assert_eq!(relay.state(), RelayState::Stopped);

        // Buffered frames outlive the session.
        assert_eq!(relay.buffer().len(), 2);
        assert!(relay.hub().is_closed());
        assert_eq!(viewer.recv().await.unwrap().as_bytes()[2], 0x01);
        assert_eq!(viewer.recv().await.unwrap().as_bytes()[2], 0x02);
        assert!(viewer.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_running_capture() {
        let relay = relay();
        let command = CaptureCommand::new(
            "sh",
            ["-c", r"printf '\377\330\001\377\331'; exec sleep 30"],
        );

        let mut states = relay.subscribe_state();
        let session = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.run(&command).await })
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == RelayState::Running),
        )
        .await
        .expect("relay never reached running")
        .unwrap();

        relay.stop();
        let summary = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();

        assert!(summary.stopped_by_request);
        assert!(summary.exit_status.is_some_and(|s| !s.success()));
        assert_eq!(relay.state(), RelayState::Stopped);
        assert!(relay.buffer().len() <= 1);
    }

    #[tokio::test]
    async fn second_run_while_active_is_rejected() {
        let relay = relay();
        relay.transition(RelayState::Running);
        let command = CaptureCommand::new("sh", ["-c", "exit 0"]);
        assert!(matches!(
            relay.run(&command).await,
            Err(RelayError::NotStopped(RelayState::Running))
        ));
    }
}
