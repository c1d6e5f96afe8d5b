use std::sync::Arc;
use std::time::Duration;

use ndarray::{Array2, ArrayView2};

/// One grayscale capture sample.
///
/// Pixels are indexed `[[row, col]]`. The buffer is shared, so cloning a
/// frame never copies pixel data and a frame is never mutated after capture.
#[derive(Debug, Clone)]
pub struct Frame {
    sequence: u64,
    timestamp: Duration,
    pixels: Arc<Array2<u8>>,
}

impl Frame {
    pub fn new(sequence: u64, timestamp: Duration, pixels: Array2<u8>) -> Self {
        Self::from_shared(sequence, timestamp, Arc::new(pixels))
    }

    pub fn from_shared(sequence: u64, timestamp: Duration, pixels: Arc<Array2<u8>>) -> Self {
        Self {
            sequence,
            timestamp,
            pixels,
        }
    }

    /// Monotonically increasing capture sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Capture time relative to the start of the source.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn pixels(&self) -> ArrayView2<'_, u8> {
        self.pixels.view()
    }

    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }
}
