use ndarray::{s, Array4, ArrayView4, Axis, Slice};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A preprocessing step applied to a `(n, d, h, w)` sequence before slicing.
pub trait Transform: std::fmt::Debug + Send + Sync {
    fn apply(&self, volume: Array4<f32>, rng: &mut StdRng) -> anyhow::Result<Array4<f32>>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformOption {
    MinMaxNormalization,
    UniformShape3d { target: [usize; 3] },
    Pool3d { kernel: [usize; 3] },
    RandomShift2d { max_shifts: [usize; 2] },
    RandomShift3d { max_shifts: [usize; 3] },
}

pub fn create_transform(opt: &TransformOption) -> anyhow::Result<Box<dyn Transform>> {
    Ok(match opt {
        TransformOption::MinMaxNormalization => Box::new(MinMaxNormalization),
        TransformOption::UniformShape3d { target } => {
            if target.iter().any(|dim| *dim == 0) {
                anyhow::bail!("Uniform shape target must be non-zero, got {target:?}");
            }
            Box::new(UniformShape3d { target: *target })
        }
        TransformOption::Pool3d { kernel } => {
            if kernel.iter().any(|k| *k == 0) {
                anyhow::bail!("Pool kernel must be non-zero, got {kernel:?}");
            }
            Box::new(Pool3d { kernel: *kernel })
        }
        TransformOption::RandomShift2d { max_shifts } => Box::new(RandomShift2d {
            max_dx: max_shifts[0],
            max_dy: max_shifts[1],
        }),
        TransformOption::RandomShift3d { max_shifts } => Box::new(RandomShift3d {
            max_dz: max_shifts[0],
            max_dx: max_shifts[1],
            max_dy: max_shifts[2],
        }),
    })
}

/// Apply `opts` in order.
pub fn create_pipeline(opts: &[TransformOption]) -> anyhow::Result<Compose> {
    let steps = opts
        .iter()
        .map(create_transform)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Compose { steps })
}

#[derive(Debug, Default)]
pub struct Compose {
    steps: Vec<Box<dyn Transform>>,
}

impl Transform for Compose {
    fn apply(&self, volume: Array4<f32>, rng: &mut StdRng) -> anyhow::Result<Array4<f32>> {
        self.steps
            .iter()
            .try_fold(volume, |volume, step| step.apply(volume, rng))
    }
}

#[derive(Clone, Debug)]
pub struct MinMaxNormalization;

impl Transform for MinMaxNormalization {
    fn apply(&self, mut volume: Array4<f32>, _rng: &mut StdRng) -> anyhow::Result<Array4<f32>> {
        let (min, max) = value_range(volume.view());
        let range = max - min;
        if range <= 0.0 || !range.is_finite() {
            volume.fill(0.0);
            return Ok(volume);
        }
        volume.mapv_inplace(|value| (value - min) / range);
        Ok(volume)
    }
}

/// Centre crop or pad each spatial axis to `target` (`[d, h, w]`).
#[derive(Clone, Debug)]
pub struct UniformShape3d {
    pub target: [usize; 3],
}

impl Transform for UniformShape3d {
    fn apply(&self, volume: Array4<f32>, _rng: &mut StdRng) -> anyhow::Result<Array4<f32>> {
        let (fill, _) = value_range(volume.view());
        let mut out = volume;
        for (offset, target) in self.target.iter().enumerate() {
            out = fit_axis(out, Axis(offset + 1), *target, fill);
        }
        Ok(out)
    }
}

fn fit_axis(volume: Array4<f32>, axis: Axis, target: usize, fill: f32) -> Array4<f32> {
    let len = volume.len_of(axis);
    if len == target {
        return volume;
    }

    if len > target {
        let start = (len - target) / 2;
        return volume
            .slice_axis(axis, Slice::from(start..start + target))
            .to_owned();
    }

    let before = (target - len) / 2;
    let mut shape = volume.raw_dim();
    shape[axis.index()] = target;
    let mut out = Array4::from_elem(shape, fill);
    out.slice_axis_mut(axis, Slice::from(before..before + len))
        .assign(&volume);
    out
}

/// Non-overlapping average pooling over `[d, h, w]`.
#[derive(Clone, Debug)]
pub struct Pool3d {
    pub kernel: [usize; 3],
}

impl Transform for Pool3d {
    fn apply(&self, volume: Array4<f32>, _rng: &mut StdRng) -> anyhow::Result<Array4<f32>> {
        let (n, d, h, w) = volume.dim();
        let [kd, kh, kw] = self.kernel;
        if kd > d || kh > h || kw > w {
            anyhow::bail!(
                "Pool kernel {:?} is larger than volume ({d}, {h}, {w})",
                self.kernel
            );
        }

        let (od, oh, ow) = (d / kd, h / kh, w / kw);
        let scale = 1.0 / (kd * kh * kw) as f32;
        let out = Array4::from_shape_fn((n, od, oh, ow), |(t, z, y, x)| {
            volume
                .slice(s![
                    t,
                    z * kd..(z + 1) * kd,
                    y * kh..(y + 1) * kh,
                    x * kw..(x + 1) * kw
                ])
                .sum()
                * scale
        });
        Ok(out)
    }
}

/// Shift height and width by uniform offsets in `[-max, max]`.
#[derive(Clone, Debug)]
pub struct RandomShift2d {
    pub max_dx: usize,
    pub max_dy: usize,
}

impl Transform for RandomShift2d {
    fn apply(&self, volume: Array4<f32>, rng: &mut StdRng) -> anyhow::Result<Array4<f32>> {
        let (fill, _) = value_range(volume.view());
        let dx = sample_offset(rng, self.max_dx);
        let volume = shift_axis(volume, Axis(3), dx, fill);
        let dy = sample_offset(rng, self.max_dy);
        Ok(shift_axis(volume, Axis(2), dy, fill))
    }
}

/// Shift depth, height and width by uniform offsets in `[-max, max]`.
#[derive(Clone, Debug)]
pub struct RandomShift3d {
    pub max_dz: usize,
    pub max_dx: usize,
    pub max_dy: usize,
}

impl Transform for RandomShift3d {
    fn apply(&self, volume: Array4<f32>, rng: &mut StdRng) -> anyhow::Result<Array4<f32>> {
        let (fill, _) = value_range(volume.view());
        let dz = sample_offset(rng, self.max_dz);
        let volume = shift_axis(volume, Axis(1), dz, fill);
        let dy = sample_offset(rng, self.max_dy);
        let volume = shift_axis(volume, Axis(2), dy, fill);
        let dx = sample_offset(rng, self.max_dx);
        Ok(shift_axis(volume, Axis(3), dx, fill))
    }
}

fn sample_offset(rng: &mut StdRng, max: usize) -> isize {
    if max == 0 {
        return 0;
    }
    let max = max as i64;
    rng.random_range(-max..=max) as isize
}

/// Move content `offset` voxels along `axis`; vacated voxels take `fill`.
pub fn shift_axis(volume: Array4<f32>, axis: Axis, offset: isize, fill: f32) -> Array4<f32> {
    let len = volume.len_of(axis);
    let magnitude = offset.unsigned_abs();
    if offset == 0 {
        return volume;
    }

    let mut out = Array4::from_elem(volume.raw_dim(), fill);
    if magnitude >= len {
        return out;
    }

    let (src, dst) = if offset > 0 {
        (0..len - magnitude, magnitude..len)
    } else {
        (magnitude..len, 0..len - magnitude)
    };
    out.slice_axis_mut(axis, Slice::from(dst))
        .assign(&volume.slice_axis(axis, Slice::from(src)));
    out
}

fn value_range(volume: ArrayView4<'_, f32>) -> (f32, f32) {
    volume
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .fold(None, |acc: Option<(f32, f32)>, value| match acc {
            None => Some((value, value)),
            Some((lo, hi)) => Some((lo.min(value), hi.max(value))),
        })
        .unwrap_or((0.0, 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(5)
    }

    #[test]
    fn min_max_maps_to_unit_range() {
        let volume = Array4::from_shape_fn((2, 2, 2, 2), |(n, d, h, w)| {
            (n * 8 + d * 4 + h * 2 + w) as f32 * 3.0 - 10.0
        });
        let out = MinMaxNormalization.apply(volume, &mut rng()).unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 0.0);
        assert_eq!(out[[1, 1, 1, 1]], 1.0);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn min_max_of_constant_volume_is_zero() {
        let out = MinMaxNormalization
            .apply(Array4::from_elem((1, 2, 2, 2), 4.0), &mut rng())
            .unwrap();
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn uniform_shape_crops_and_pads_around_centre() {
        let volume = Array4::from_shape_fn((1, 6, 2, 3), |(_, d, _, _)| d as f32 + 1.0);
        let out = UniformShape3d { target: [2, 4, 3] }
            .apply(volume, &mut rng())
            .unwrap();
        assert_eq!(out.dim(), (1, 2, 4, 3));
        // Depth 6 -> 2 keeps planes 2 and 3 (values 3 and 4).
        assert_eq!(out[[0, 0, 1, 0]], 3.0);
        assert_eq!(out[[0, 1, 2, 0]], 4.0);
        // Height 2 -> 4 pads one row either side with the minimum.
        assert_eq!(out[[0, 0, 0, 0]], 1.0);
        assert_eq!(out[[0, 1, 3, 2]], 1.0);
    }

    #[test]
    fn pool_averages_blocks_and_drops_remainder() {
        let volume = Array4::from_shape_fn((1, 4, 4, 5), |(_, _, _, w)| w as f32);
        let out = Pool3d { kernel: [2, 2, 2] }.apply(volume, &mut rng()).unwrap();
        assert_eq!(out.dim(), (1, 2, 2, 2));
        assert_eq!(out[[0, 0, 0, 0]], 0.5);
        assert_eq!(out[[0, 1, 1, 1]], 2.5);
    }

    #[test]
    fn pool_rejects_oversized_kernel() {
        let volume = Array4::<f32>::zeros((1, 2, 2, 2));
        assert!(Pool3d { kernel: [3, 1, 1] }.apply(volume, &mut rng()).is_err());
        assert!(create_transform(&TransformOption::Pool3d { kernel: [0, 1, 1] }).is_err());
    }

    #[test]
    fn shift_moves_content_and_fills_vacated_voxels() {
        let volume = Array4::from_shape_fn((1, 1, 1, 5), |(_, _, _, w)| w as f32 + 1.0);
        let right = shift_axis(volume.clone(), Axis(3), 2, 0.0);
        assert_eq!(right.as_slice().unwrap(), &[0.0, 0.0, 1.0, 2.0, 3.0]);
        let left = shift_axis(volume.clone(), Axis(3), -1, -1.0);
        assert_eq!(left.as_slice().unwrap(), &[2.0, 3.0, 4.0, 5.0, -1.0]);
        let gone = shift_axis(volume, Axis(3), 9, 0.0);
        assert!(gone.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn random_shift_preserves_shape_and_zero_max_is_identity() {
        let volume = Array4::from_shape_fn((10, 3, 4, 5), |(n, d, h, w)| (n + d + h + w) as f32);
        let shifted = RandomShift3d {
            max_dz: 1,
            max_dx: 2,
            max_dy: 2,
        }
        .apply(volume.clone(), &mut rng())
        .unwrap();
        assert_eq!(shifted.dim(), volume.dim());

        let same = RandomShift2d { max_dx: 0, max_dy: 0 }
            .apply(volume.clone(), &mut rng())
            .unwrap();
        assert_eq!(same, volume);
    }

    #[test]
    fn sampled_offsets_cover_both_directions_within_bound() {
        let mut rng = rng();
        let offsets: Vec<isize> = (0..400).map(|_| sample_offset(&mut rng, 3)).collect();
        assert!(offsets.iter().all(|offset| (-3..=3).contains(offset)));
        assert!(offsets.contains(&-3) && offsets.contains(&3));
        assert_eq!(sample_offset(&mut rng, 0), 0);
    }

    #[test]
    fn pipeline_runs_steps_in_order() {
        let pipeline = create_pipeline(&[
            TransformOption::Pool3d { kernel: [1, 2, 2] },
            TransformOption::MinMaxNormalization,
        ])
        .unwrap();
        let volume = Array4::from_shape_fn((1, 1, 2, 4), |(_, _, _, w)| w as f32 * 10.0);
        let out = pipeline.apply(volume, &mut rng()).unwrap();
        assert_eq!(out.dim(), (1, 1, 1, 2));
        assert_eq!(out.as_slice().unwrap(), &[0.0, 1.0]);
    }

    #[test]
    fn options_round_trip_through_json() {
        let opt: TransformOption =
            serde_json::from_str(r#"{"kind":"random_shift3d","max_shifts":[5,30,30]}"#).unwrap();
        assert_eq!(
            opt,
            TransformOption::RandomShift3d {
                max_shifts: [5, 30, 30]
            }
        );
    }
}
