pub mod mjpeg;
pub mod supervisor;

pub use mjpeg::{frames, MjpegExtractor};
pub use supervisor::{CaptureCommand, CaptureSupervisor};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to spawn capture process {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("capture process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("failed to wait for capture process: {0}")]
    Wait(std::io::Error),
    #[error("failed to signal capture process: {0}")]
    Signal(std::io::Error),
}
