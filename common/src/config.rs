use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_display")]
    pub display: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// JPEG quality in 1..=100, mapped onto ffmpeg's `-q:v` scale.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u32,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Largest partial frame the extractor will hold before resyncing. 0 disables the cap.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Retention window of the frame buffer, in milliseconds.
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    /// Frames queued per viewer before it is considered too slow and dropped.
    #[serde(default = "default_client_queue")]
    pub client_queue_frames: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            display: default_display(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            jpeg_quality: default_jpeg_quality(),
            ffmpeg_path: default_ffmpeg_path(),
            max_frame_bytes: default_max_frame_bytes(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_duration_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_port: default_ws_port(),
            http_port: default_http_port(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            client_queue_frames: default_client_queue(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CaptureConfig {
    /// ffmpeg `-q:v` value for the configured quality (2 = best, 31 = worst).
    pub fn qscale(&self) -> u32 {
        let q = 32_i64 - (self.jpeg_quality as f64 * 0.31) as i64;
        q.clamp(2, 31) as u32
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load `path` if it exists (defaults otherwise), apply environment
    /// overrides and validate.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides. `lookup` returns the raw value of a
    /// variable, if set.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DISPLAY") {
            self.capture.display = v;
        }
        if let Some(v) = lookup("FFMPEG_PATH") {
            self.capture.ffmpeg_path = v;
        }
        if let Some(v) = lookup("VIDEO_BIND") {
            self.server.bind = v;
        }
        override_parsed(&lookup, "SCREEN_WIDTH", &mut self.capture.width)?;
        override_parsed(&lookup, "SCREEN_HEIGHT", &mut self.capture.height)?;
        override_parsed(&lookup, "VIDEO_FRAME_RATE", &mut self.capture.fps)?;
        override_parsed(&lookup, "JPEG_QUALITY", &mut self.capture.jpeg_quality)?;
        override_parsed(&lookup, "MAX_FRAME_BYTES", &mut self.capture.max_frame_bytes)?;
        override_parsed(&lookup, "BUFFER_DURATION_MS", &mut self.buffer.duration_ms)?;
        override_parsed(&lookup, "VIDEO_WS_PORT", &mut self.server.ws_port)?;
        override_parsed(&lookup, "VIDEO_HTTP_PORT", &mut self.server.http_port)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "capture geometry must be non-zero, got {}x{}",
                self.capture.width, self.capture.height
            )));
        }
        if self.capture.fps == 0 {
            return Err(ConfigError::Invalid("capture.fps must be at least 1".into()));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "capture.jpeg_quality must be between 1 and 100, got {}",
                self.capture.jpeg_quality
            )));
        }
        if self.buffer.duration_ms == 0 {
            return Err(ConfigError::Invalid("buffer.duration_ms must be at least 1".into()));
        }
        if self.server.ws_port == self.server.http_port && self.server.ws_port != 0 {
            return Err(ConfigError::Invalid(format!(
                "ws_port and http_port must differ, both are {}",
                self.server.ws_port
            )));
        }
        if self.server.client_queue_frames == 0 {
            return Err(ConfigError::Invalid(
                "server.client_queue_frames must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(var) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { var, value: raw.clone() })?;
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid value {value:?} for environment variable {var}")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_display() -> String {
    ":99".into()
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_fps() -> u32 {
    15
}
fn default_jpeg_quality() -> u32 {
    80
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".into()
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_stop_grace_ms() -> u64 {
    3000
}
fn default_duration_ms() -> u64 {
    500
}
fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_ws_port() -> u16 {
    8765
}
fn default_http_port() -> u16 {
    8766
}
fn default_ping_interval() -> u64 {
    20
}
fn default_ping_timeout() -> u64 {
    60
}
fn default_client_queue() -> usize {
    32
}
fn default_log_level() -> String {
    "info".into()
}
