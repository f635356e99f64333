//! Fixed-size windowing of a continuous sample stream.

/// Accumulates arbitrary-length sample slices and yields complete windows of
/// exactly `window` samples. Leftover samples carry over to the next push.
#[derive(Debug)]
pub struct FrameAssembler {
    window: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            pending: Vec::with_capacity(window * 2),
        }
    }

    /// Append samples and return every window completed by them, oldest first.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.window;
        if complete == 0 {
            return Vec::new();
        }

        let mut windows = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(self.window) {
            windows.push(chunk.to_vec());
        }
        self.pending.drain(..complete * self.window);
        windows
    }

    /// Samples waiting for the next window to fill.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial window (e.g. when capture stops).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn window(&self) -> usize {
        self.window
    }
}
