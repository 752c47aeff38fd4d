//! Windowed frame-rate estimation over the post-processor's output.

use std::collections::VecDeque;
use std::time::Instant;

pub struct FpsWindow {
    times: VecDeque<Instant>,
    capacity: usize,
}

impl FpsWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            times: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
        }
    }

    pub fn tick(&mut self, now: Instant) {
        self.times.push_back(now);
        if self.times.len() > self.capacity {
            self.times.pop_front();
        }
    }

    /// Frames per second over the window; 0 until two samples exist.
    pub fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.times.front(), self.times.back()) else {
            return 0.0;
        };
        if self.times.len() < 2 {
            return 0.0;
        }
        let span = last.duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            0.0
        } else {
            (self.times.len() - 1) as f64 / span
        }
    }

    pub fn reset(&mut self) {
        self.times.clear();
    }
}
