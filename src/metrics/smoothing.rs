//! Power smoothing.

use std::collections::VecDeque;

/// Rolling average calculator for power smoothing.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    /// Buffer of recent values
    buffer: VecDeque<i16>,
    /// Window size in samples
    window_size: usize,
    /// Running sum for efficient calculation
    sum: i64,
}

impl RollingAverage {
    /// Create a new rolling average with the given window size.
    ///
    /// A window of 0 behaves like a window of 1 (no smoothing).
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            buffer: VecDeque::with_capacity(window_size),
            window_size,
            sum: 0,
        }
    }

    /// Add a new value and return the current average.
    pub fn add(&mut self, value: i16) -> f32 {
        self.buffer.push_back(value);
        self.sum += value as i64;

        // Remove oldest if over window size
        if self.buffer.len() > self.window_size {
            if let Some(old) = self.buffer.pop_front() {
                self.sum -= old as i64;
            }
        }

        self.sum as f32 / self.buffer.len() as f32
    }
}
