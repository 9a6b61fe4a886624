use std::collections::VecDeque;

use cam_motion_common::frame::Frame;

/// Immutable (previous, current) snapshot handed to a scorer.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub previous: Frame,
    pub current: Frame,
}

/// Fixed-capacity history of the most recent frames, newest last.
///
/// Pushing a frame displaces the oldest one once the history is full, so the
/// frame that was current becomes previous in the same call. Callers that
/// share a history behind a lock therefore never observe a half-rotated state.
#[derive(Debug)]
pub struct FrameHistory {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameHistory {
    /// History for the current/previous rotation.
    pub fn pair() -> Self {
        Self::with_capacity(2)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Make `frame` current and return the frame that fell out, if any.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let displaced = if self.frames.len() == self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        displaced
    }

    pub fn current(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn previous(&self) -> Option<&Frame> {
        self.frames.len().checked_sub(2).and_then(|i| self.frames.get(i))
    }

    /// The two newest frames, once at least two have arrived.
    pub fn latest_pair(&self) -> Option<FramePair> {
        Some(FramePair {
            previous: self.previous()?.clone(),
            current: self.current()?.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
