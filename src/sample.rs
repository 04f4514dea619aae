//! Paired 2D/3D training tensors for one respiratory cycle.

use ndarray::{concatenate, Array1, Array3, Array4, Array5, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetError;

/// Frames in one periodic sequence.
pub const PERIOD: usize = 10;

/// Frame used as the mid-cycle reference.
pub const MID_PHASE: usize = PERIOD / 2;

/// Which reference frame(s) the network is conditioned on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    All,
    #[value(name = "0")]
    #[serde(rename = "0")]
    Zero,
    #[value(name = "t")]
    #[serde(rename = "t")]
    Mid,
}

impl Phase {
    /// Channel count of the reference tensors for this phase.
    pub fn reference_channels(self) -> usize {
        match self {
            Phase::All => 2,
            Phase::Zero | Phase::Mid => 1,
        }
    }
}

/// Shapes use `n` = period, `s` = slice count, `c` = volume channels (both 1).
#[derive(Clone, Debug)]
pub struct PairedSample {
    /// `(n, s, d, h)`
    pub x_2d: Array4<f32>,
    /// `(s, d, h)`
    pub x_2d_0: Array3<f32>,
    pub x_2d_t: Array3<f32>,
    /// `(2s, d, h)`
    pub x_2d_all: Array3<f32>,
    /// `(n, c, d, h, w)`
    pub x_3d: Array5<f32>,
    /// `(c, d, h, w)`
    pub x_3d_0: Array4<f32>,
    pub x_3d_t: Array4<f32>,
    /// `(2c, d, h, w)`
    pub x_3d_all: Array4<f32>,
    /// `(s,)`
    pub slice_idx: Array1<u32>,
    /// `(n, s, d, h)`, the slice index repeated over every 2D voxel.
    pub idx_expanded: Array4<u32>,
}

impl PairedSample {
    /// Build every paired view of `volume` (`(n, d, h, w)`) at width index
    /// `slice_idx`.
    pub fn assemble(volume: ArrayView4<'_, f32>, slice_idx: usize) -> Result<Self, DatasetError> {
        let (n, d, h, w) = volume.dim();
        if n != PERIOD {
            return Err(DatasetError::PeriodMismatch {
                expected: PERIOD,
                actual: n,
            });
        }
        if slice_idx >= w {
            return Err(DatasetError::SliceOutOfRange {
                index: slice_idx,
                width: w,
            });
        }

        // (n, d, h, s) -> (n, s, d, h)
        let x_2d = volume
            .select(Axis(3), &[slice_idx])
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();
        let x_2d_0 = x_2d.index_axis(Axis(0), 0).to_owned();
        let x_2d_t = x_2d.index_axis(Axis(0), MID_PHASE).to_owned();
        let x_2d_all = concatenate(Axis(0), &[x_2d_0.view(), x_2d_t.view()])
            .map_err(|err| DatasetError::Shape(err.to_string()))?;

        let x_3d = volume.to_owned().insert_axis(Axis(1));
        let x_3d_0 = volume.index_axis(Axis(0), 0).to_owned().insert_axis(Axis(0));
        let x_3d_t = volume
            .index_axis(Axis(0), MID_PHASE)
            .to_owned()
            .insert_axis(Axis(0));
        let x_3d_all = concatenate(Axis(0), &[x_3d_0.view(), x_3d_t.view()])
            .map_err(|err| DatasetError::Shape(err.to_string()))?;

        let slice_idx = Array1::from_elem(1, slice_idx as u32);
        let idx_expanded = slice_idx
            .broadcast((n, 1, d, h))
            .ok_or_else(|| DatasetError::Shape("cannot broadcast slice index".into()))?
            .to_owned();

        Ok(Self {
            x_2d,
            x_2d_0,
            x_2d_t,
            x_2d_all,
            x_3d,
            x_3d_0,
            x_3d_t,
            x_3d_all,
            slice_idx,
            idx_expanded,
        })
    }

    pub fn period(&self) -> usize {
        self.x_2d.len_of(Axis(0))
    }

    /// `(2D reference, 3D reference)` for `phase`.
    pub fn reference(&self, phase: Phase) -> (&Array3<f32>, &Array4<f32>) {
        match phase {
            Phase::All => (&self.x_2d_all, &self.x_3d_all),
            Phase::Zero => (&self.x_2d_0, &self.x_3d_0),
            Phase::Mid => (&self.x_2d_t, &self.x_3d_t),
        }
    }
}
