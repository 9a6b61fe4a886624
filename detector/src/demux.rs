use std::iter::FusedIterator;

use bytes::{Buf, BytesMut};
use cam_motion_common::frame::{Frame, JPEG_EOI, JPEG_SOI};
use chrono::Utc;
use tracing::{trace, warn};

/// Cuts the decoder's `image2pipe` output into individual JPEG frames.
///
/// Bytes are accumulated across calls to [`FrameDemuxer::feed`]; a frame is
/// everything from an SOI marker (`FF D8`) through the first EOI marker
/// (`FF D9`) that follows it. Bytes that cannot belong to any frame are
/// dropped eagerly so noise never accumulates, and a partial frame that grows
/// past `max_frame_bytes` without an EOI is discarded so the demuxer can
/// resynchronise on the next SOI.
pub struct FrameDemuxer {
    buffer: BytesMut,
    /// Offset where the next EOI scan resumes. Only meaningful while the
    /// buffer begins with an SOI; saves rescanning a large partial frame on
    /// every chunk.
    resume_at: usize,
    next_seq: u64,
    max_frame_bytes: usize,
}

impl FrameDemuxer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            resume_at: 0,
            next_seq: 0,
            max_frame_bytes,
        }
    }

    /// Append `chunk` and return the frames it completed.
    ///
    /// The returned iterator is lazy: each `next()` cuts at most one frame
    /// out of the buffer. Frames left unread stay buffered and come out of
    /// the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames { demuxer: self }
    }

    /// Bytes waiting for more data.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.resume_at = 0;
        self.next_seq = 0;
    }

    fn next_frame(&mut self) -> Option<Frame> {
        let start = match find_marker(&self.buffer, &JPEG_SOI) {
            Some(pos) => pos,
            None => {
                // Keep a lone trailing 0xFF: it may be the first half of an
                // SOI split across chunks.
                let keep = usize::from(self.buffer.last() == Some(&JPEG_SOI[0]));
                let dropped = self.buffer.len() - keep;
                if dropped > 0 {
                    trace!(dropped, "no SOI in buffer, discarding");
                    self.buffer.advance(dropped);
                }
                self.resume_at = 0;
                return None;
            }
        };

        if start > 0 {
            trace!(skipped = start, "discarding bytes before SOI");
            self.buffer.advance(start);
            self.resume_at = 0;
        }

        // The EOI scan starts strictly after the SOI, so `FF D8 FF D9` is the
        // shortest frame and an SOI inside the payload is just payload.
        let from = self.resume_at.max(JPEG_SOI.len());
        match find_marker(&self.buffer[from..], &JPEG_EOI) {
            Some(pos) => {
                let end = from + pos + JPEG_EOI.len();
                let data = self.buffer.split_to(end).freeze();
                self.resume_at = 0;

                let seq = self.next_seq;
                self.next_seq += 1;
                trace!(seq, bytes = data.len(), "frame demuxed");
                Some(Frame::new(data, seq, Utc::now().timestamp_millis()))
            }
            None => {
                if self.buffer.len() > self.max_frame_bytes {
                    warn!(
                        buffered = self.buffer.len(),
                        limit = self.max_frame_bytes,
                        "partial frame exceeded limit without EOI, resynchronising"
                    );
                    self.buffer.clear();
                    self.resume_at = 0;
                    return None;
                }
                // The last byte may be the 0xFF of an EOI split across chunks.
                self.resume_at = self.buffer.len().saturating_sub(1);
                None
            }
        }
    }
}

/// Frames completed by one [`FrameDemuxer::feed`] call.
pub struct Frames<'a> {
    demuxer: &'a mut FrameDemuxer,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.demuxer.next_frame()
    }
}

impl FusedIterator for Frames<'_> {}

/// Find the position of `marker` in `haystack`.
fn find_marker(haystack: &[u8], marker: &[u8]) -> Option<usize> {
    haystack
        .windows(marker.len())
        .position(|window| window == marker)
}
