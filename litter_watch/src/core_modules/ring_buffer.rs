// THEORY:
// The `FrameRingBuffer` is the short-term visual memory of a camera. Every
// processed frame is pushed here before tracking runs, so that when an incident
// fires the engine can materialize the last few seconds leading up to it.
//
// Key architectural principles:
// 1.  **Fixed Capacity**: The buffer never grows. When a frame arrives at
//     capacity, the oldest one is evicted first.
// 2.  **Snapshot Reads**: Readers receive a copy of the buffer's contents at call
//     time. Frames hold their pixels behind an `Arc`, so a snapshot is a list of
//     cheap handles to immutable data; later pushes cannot alter it.
// 3.  **Single Owner**: Each camera pipeline owns exactly one buffer. There is no
//     locking because nothing else ever touches it.

use crate::frame::Frame;
use std::collections::VecDeque;

pub struct FrameRingBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameRingBuffer {
    /// Creates a buffer holding at most `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a frame, evicting the oldest one when full.
    pub fn push(&mut self, frame: Frame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Copy of the retained frames, oldest first.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
