//! Caller-owned frame buffer written by tracers.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::util::{Texel, TracerError, Result};

/// Full-frame RGBA f32 image shared by the tracers rendering into it.
///
/// Floats are stored as `AtomicU32` bit patterns so several tracers can
/// write disjoint rows through a shared reference without a lock. Nothing
/// stops two writers from touching the same rows; keeping block
/// assignments disjoint is the orchestrator's job.
pub struct RenderTarget {
    width: u32,
    height: u32,
    data: Box<[AtomicU32]>,
}

impl RenderTarget {
    /// Zero-filled target of `width * height` pixels.
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, [0.0; 4])
    }

    /// Target with every pixel set to `texel`.
    pub fn filled(width: u32, height: u32, texel: Texel) -> Self {
        let pixels = width as usize * height as usize;
        let data = (0..pixels)
            .flat_map(|_| texel)
            .map(|v| AtomicU32::new(v.to_bits()))
            .collect();
        Self { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Floats per row (4 per pixel).
    pub fn row_floats(&self) -> usize {
        self.width as usize * 4
    }

    /// Copy `rows` (whole rows of RGBA floats) into the target starting at row `y`.
    pub fn write_rows(&self, y: u32, rows: &[f32]) -> Result<()> {
        let start = y as usize * self.row_floats();
        let end = start + rows.len();
        if rows.len() % self.row_floats().max(1) != 0 || end > self.data.len() {
            return Err(TracerError::InvalidBlockRequest(format!(
                "{} floats at row {y} do not fit a {}x{} target",
                rows.len(),
                self.width,
                self.height
            )));
        }
        for (slot, v) in self.data[start..end].iter().zip(rows) {
            slot.store(v.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Pixel at `(x, y)`, `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Texel> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = (y as usize * self.width as usize + x as usize) * 4;
        Some(std::array::from_fn(|c| f32::from_bits(self.data[at + c].load(Ordering::Relaxed))))
    }

    /// Snapshot of the whole frame as RGBA floats.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().map(|v| f32::from_bits(v.load(Ordering::Relaxed))).collect()
    }
}

impl std::fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTarget")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}
