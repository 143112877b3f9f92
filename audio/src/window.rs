//! Aggregation of conditioned frames into fixed-size byte windows.

use crate::pcm::SAMPLE_BYTES;

/// A completed audio window: a fixed-size PCM16 byte buffer plus the
/// capture timestamp of its first sample. Immutable after creation.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Accumulates sample chunks into windows of a fixed byte size.
///
/// A window is emitted through the callback as soon as the buffer fills;
/// any remaining samples of the chunk continue into the freshly cleared
/// buffer with a re-marked timestamp. An explicit [`flush`](Self::flush)
/// emits the trailing partial window if one exists.
///
/// Every input sample ends up in exactly one emitted window, in input
/// order; all windows except possibly the last are exactly the configured
/// size.
pub struct WindowAggregator {
    buf: Vec<u8>,
    capacity: usize,
    start_timestamp: u64,
    on_window: Box<dyn FnMut(AudioWindow) + Send>,
}

impl WindowAggregator {
    /// Creates an aggregator emitting windows of `window_samples` PCM16
    /// samples each.
    pub fn new(window_samples: usize, on_window: impl FnMut(AudioWindow) + Send + 'static) -> Self {
        let capacity = window_samples.max(1) * SAMPLE_BYTES;
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            start_timestamp: 0,
            on_window: Box::new(on_window),
        }
    }

    /// Appends a chunk of samples, flushing completed windows as the
    /// buffer fills.
    pub fn append(&mut self, samples: &[i16], timestamp_ms: u64) {
        if self.buf.len() >= self.capacity {
            self.flush();
        }
        if self.buf.is_empty() {
            self.start_timestamp = timestamp_ms;
        }

        for (i, &s) in samples.iter().enumerate() {
            self.buf.extend_from_slice(&s.to_le_bytes());
            if self.buf.len() >= self.capacity {
                self.flush();
                if i + 1 < samples.len() {
                    self.start_timestamp = timestamp_ms;
                }
            }
        }
    }

    /// Emits the buffered bytes as a window, if any.
    pub fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let data = std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity));
        (self.on_window)(AudioWindow {
            data,
            timestamp_ms: self.start_timestamp,
        });
    }
}
