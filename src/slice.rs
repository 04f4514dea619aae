//! Central slice selection over a periodic volume.
//!
//! A volume is laid out as `(period, depth, height, width)`. A slice is one
//! width column: the `(depth, height)` plane at a fixed width index, taken
//! from every frame of the cycle.

use ndarray::{ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::Rng;

pub trait SliceIndexer {
    /// Pick the width index that every frame of `volume` is sliced at.
    fn select(&self, volume: ArrayView4<'_, f32>, rng: &mut StdRng) -> anyhow::Result<usize>;
}

#[derive(Clone, Debug)]
pub struct BasicSliceIndexer {
    pub threshold: f32,
    pub min_occupancy: f64,
}

impl Default for BasicSliceIndexer {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            min_occupancy: 0.2,
        }
    }
}

impl BasicSliceIndexer {
    pub fn new(threshold: f32, min_occupancy: f64) -> Self {
        Self {
            threshold,
            min_occupancy,
        }
    }

    /// Width columns whose occupied fraction reaches `min_occupancy`.
    pub fn candidates(&self, volume: ArrayView4<'_, f32>) -> Vec<usize> {
        let (n, d, h, _) = volume.dim();
        let required = self.min_occupancy * (n * d * h) as f64;
        column_occupancy(volume, self.threshold)
            .into_iter()
            .enumerate()
            .filter(|(_, count)| *count as f64 >= required)
            .map(|(index, _)| index)
            .collect()
    }
}

impl SliceIndexer for BasicSliceIndexer {
    fn select(&self, volume: ArrayView4<'_, f32>, rng: &mut StdRng) -> anyhow::Result<usize> {
        let width = volume.len_of(Axis(3));
        if width == 0 {
            anyhow::bail!("Cannot select a slice from a volume of width 0");
        }

        let choices = self.candidates(volume);
        if !choices.is_empty() {
            return Ok(choices[rng.random_range(0..choices.len())]);
        }

        Ok(first_max(&column_occupancy(volume, self.threshold)))
    }
}

/// Number of voxels above `threshold` in every width column, counted across
/// period, depth and height.
pub fn column_occupancy(volume: ArrayView4<'_, f32>, threshold: f32) -> Vec<usize> {
    volume
        .axis_iter(Axis(3))
        .map(|column| column.iter().filter(|value| **value > threshold).count())
        .collect()
}

fn first_max(counts: &[usize]) -> usize {
    let mut best = 0;
    for (index, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = index;
        }
    }
    best
}
