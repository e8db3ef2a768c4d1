use bytes::BytesMut;
use futures_util::Stream;
use mjpeg_relay_common::frame::{Frame, EOI, SOI};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Size of a single read from the capture pipe.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Splits a raw motion-JPEG byte stream into complete JPEG frames.
///
/// The stream has no container framing: frames are found by scanning for the
/// SOI (`FF D8`) and EOI (`FF D9`) markers across the accumulated bytes, so
/// chunk boundaries may fall anywhere, including inside a marker.
pub struct MjpegExtractor {
    buffer: BytesMut,
    /// True once `buffer` starts with an SOI marker.
    synced: bool,
    /// Where the next EOI search resumes, so old bytes are not rescanned.
    scan_from: usize,
    /// Partial frames larger than this are dropped. 0 disables the cap.
    max_frame_bytes: usize,
    frames: u64,
    discarded_bytes: u64,
}

impl MjpegExtractor {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            synced: false,
            scan_from: SOI.len(),
            max_frame_bytes,
            frames: 0,
            discarded_bytes: 0,
        }
    }

    /// Append a raw chunk to the accumulation buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if !self.synced {
            match find_subsequence(&self.buffer, &SOI) {
                Some(pos) => {
                    self.discard(pos);
                    self.synced = true;
                    self.scan_from = SOI.len();
                }
                None => {
                    self.discard_all_but_marker_prefix();
                    return None;
                }
            }
        }

        // Skip the SOI itself: FF D9 may legitimately appear right after it.
        match find_subsequence(&self.buffer[self.scan_from..], &EOI) {
            Some(pos) => {
                let end = self.scan_from + pos + EOI.len();
                let data = self.buffer.split_to(end).freeze();
                self.synced = false;
                self.scan_from = SOI.len();
                self.frames += 1;
                Some(Frame::new(data))
            }
            None => {
                if self.max_frame_bytes > 0 && self.buffer.len() > self.max_frame_bytes {
                    warn!(
                        bytes = self.buffer.len(),
                        limit = self.max_frame_bytes,
                        "partial frame exceeds size limit without EOI, resyncing"
                    );
                    self.synced = false;
                    self.scan_from = SOI.len();
                    self.discard_all_but_marker_prefix();
                    return None;
                }
                // Resume one byte back in case the EOI straddles the next chunk.
                self.scan_from = self.buffer.len().saturating_sub(1).max(SOI.len());
                None
            }
        }
    }

    /// Push a chunk and drain every frame it completes.
    pub fn extract(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.push(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Bytes currently held while waiting for a frame to complete.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_extracted(&self) -> u64 {
        self.frames
    }

    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    fn discard(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let _ = self.buffer.split_to(n);
        self.discarded_bytes += n as u64;
        debug!(bytes = n, "discarded bytes outside any frame");
    }

    /// Drop everything except a trailing `FF`, which may be the first half of
    /// an SOI split across chunks.
    fn discard_all_but_marker_prefix(&mut self) {
        let keep = usize::from(self.buffer.last() == Some(&SOI[0]));
        self.discard(self.buffer.len() - keep);
    }
}

/// Lazily read frames from `reader` until it reaches end of stream.
pub fn frames<R>(reader: R, max_frame_bytes: usize) -> impl Stream<Item = std::io::Result<Frame>>
where
    R: AsyncRead + Unpin,
{
    let state = (reader, MjpegExtractor::new(max_frame_bytes), vec![0u8; READ_CHUNK_SIZE]);
    futures_util::stream::try_unfold(state, |(mut reader, mut extractor, mut chunk)| async move {
        loop {
            if let Some(frame) = extractor.next_frame() {
                return Ok(Some((frame, (reader, extractor, chunk))));
            }
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                debug!(
                    frames = extractor.frames_extracted(),
                    discarded_bytes = extractor.discarded_bytes(),
                    pending = extractor.buffered(),
                    "end of MJPEG stream"
                );
                return Ok(None);
            }
            extractor.push(&chunk[..n]);
        }
    })
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
