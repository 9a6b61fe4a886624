use bytes::Bytes;

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

const SNAPSHOT_PREFIX: &str = "motion_";
const SNAPSHOT_EXT: &str = ".jpg";

/// One complete encoded image cut from the decoder's byte stream,
/// SOI through EOI inclusive.
///
/// The payload is reference-counted, so cloning a frame never copies pixels
/// and a frame can be handed to several consumers at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    /// Position in the stream, starting at 0 for each demuxer.
    pub seq: u64,
    /// Wall-clock arrival time, Unix millis.
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, seq: u64, captured_at_ms: i64) -> Self {
        Self {
            data: data.into(),
            seq,
            captured_at_ms,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Emitted once per debounced rising edge.
#[derive(Debug, Clone)]
pub struct MotionEvent {
    pub score: u64,
    pub detected_at_ms: i64,
    /// The frame whose comparison against its predecessor crossed the threshold.
    pub frame: Frame,
}

impl MotionEvent {
    pub fn new(score: u64, frame: Frame) -> Self {
        Self {
            score,
            detected_at_ms: frame.captured_at_ms,
            frame,
        }
    }

    /// File name under which collaborators store the triggering frame.
    pub fn snapshot_name(&self) -> String {
        snapshot_name(self.detected_at_ms)
    }
}

/// e.g. "motion_1708300000000.jpg"
pub fn snapshot_name(timestamp_ms: i64) -> String {
    format!("{SNAPSHOT_PREFIX}{timestamp_ms}{SNAPSHOT_EXT}")
}

/// Recover the timestamp from a name produced by [`snapshot_name`].
pub fn parse_snapshot_name(name: &str) -> Result<i64, FrameError> {
    let digits = name
        .strip_prefix(SNAPSHOT_PREFIX)
        .and_then(|rest| rest.strip_suffix(SNAPSHOT_EXT))
        .ok_or_else(|| FrameError::SnapshotName(name.to_string()))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::SnapshotName(name.to_string()));
    }
    digits
        .parse()
        .map_err(|_| FrameError::SnapshotName(name.to_string()))
}

/// Human-readable UTC rendering of a millisecond timestamp, for logs.
pub fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .unwrap_or_else(chrono::Utc::now)
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("not a snapshot file name: {0}")]
    SnapshotName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_payload() {
        let frame = Frame::new(vec![0xFF, 0xD8, 0x00, 0xFF, 0xD9], 3, 1708300000000);
        let copy = frame.clone();
        assert_eq!(copy.data().as_ptr(), frame.data().as_ptr());
        assert_eq!(copy, frame);
        assert_eq!(frame.len(), 5);
    }

    #[test]
    fn motion_event_takes_frame_time() {
        let frame = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 9, 1708300000123);
        let event = MotionEvent::new(80_000, frame);
        assert_eq!(event.detected_at_ms, 1708300000123);
        assert_eq!(event.snapshot_name(), "motion_1708300000123.jpg");
    }

    #[test]
    fn snapshot_name_roundtrip() {
        assert_eq!(parse_snapshot_name(&snapshot_name(42)).unwrap(), 42);
    }

    #[test]
    fn snapshot_name_rejects_foreign_files() {
        assert!(parse_snapshot_name("motion_.jpg").is_err());
        assert!(parse_snapshot_name("motion_12a.jpg").is_err());
        assert!(parse_snapshot_name("still_12.jpg").is_err());
        assert!(parse_snapshot_name("motion_12.png").is_err());
    }

    #[test]
    fn timestamp_format() {
        assert_eq!(format_timestamp(1708300000000), "2024-02-18T23:46:40.000Z");
    }
}
