use bytes::Bytes;

/// JPEG Start-Of-Image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG End-Of-Image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// One complete JPEG image, SOI through EOI inclusive.
///
/// Cloning is cheap: the bytes are reference counted, so the frame buffer and
/// every viewer queue hold their own handle to the same immutable data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Wrap bytes that are known to be a complete JPEG.
    pub fn new(data: Bytes) -> Self {
        debug_assert!(is_complete_jpeg(&data), "frame must be delimited by SOI/EOI");
        Self(data)
    }

    /// Validate and wrap arbitrary bytes.
    pub fn from_jpeg(data: impl Into<Bytes>) -> Result<Self, FrameError> {
        let data = data.into();
        if data.len() < 4 {
            return Err(FrameError::TooShort { got: data.len() });
        }
        if !data.starts_with(&SOI) {
            return Err(FrameError::MissingSoi);
        }
        if !data.ends_with(&EOI) {
            return Err(FrameError::MissingEoi);
        }
        Ok(Self(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A frame together with the instant it was extracted.
#[derive(Debug, Clone)]
pub struct TimestampedFrame {
    pub frame: Frame,
    /// Unix millis, never lower than the previous entry's in the same buffer.
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl TimestampedFrame {
    pub fn new(frame: Frame, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            frame,
            captured_at_ms,
            seq,
        }
    }
}

/// Returns true if `data` starts with SOI and ends with a separate EOI.
pub fn is_complete_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&SOI) && data.ends_with(&EOI)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: got {got} bytes, need at least 4")]
    TooShort { got: usize },
    #[error("frame does not start with the JPEG SOI marker")]
    MissingSoi,
    #[error("frame does not end with the JPEG EOI marker")]
    MissingEoi,
}
