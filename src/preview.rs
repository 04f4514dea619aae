use std::path::Path;

use anyhow::Context;
use image::{ImageBuffer, Rgb, RgbImage};
use ndarray::{s, ArrayView5, Axis};

/// Write a two-row montage (ground truth above, reconstruction below) of one
/// sequence, one tile per frame. Each tile is the centre width plane of the
/// `(c, d, h, w)` frame, shown as `d` rows by `h` columns.
pub fn save_reconstruction_montage<'a>(
    save_path: &Path,
    original: ArrayView5<'a, f32>,
    reconstructed: ArrayView5<'a, f32>,
) -> anyhow::Result<()> {
    if original.shape() != reconstructed.shape() {
        anyhow::bail!(
            "Original {:?} and reconstruction {:?} differ in shape",
            original.shape(),
            reconstructed.shape()
        );
    }
    let (n, c, d, h, w) = original.dim();
    if n == 0 || c == 0 || d == 0 || h == 0 || w == 0 {
        anyhow::bail!("Cannot preview an empty sequence {:?}", original.shape());
    }

    let centre = w / 2;
    let mut montage: RgbImage = ImageBuffer::new((h * n) as u32, (d * 2) as u32);
    for (row, sequence) in [original, reconstructed].into_iter().enumerate() {
        for frame in 0..n {
            let plane: Vec<f32> = sequence
                .slice(s![frame, 0, .., .., centre])
                .iter()
                .copied()
                .collect();
            let tile = normalize_map_to_rgb(&plane, d, h);
            blit(&mut montage, &tile, frame * h, row * d);
        }
    }

    if let Some(parent) = save_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create preview dir: {}", parent.display()))?;
    }
    montage
        .save(save_path)
        .with_context(|| format!("Failed to write preview image: {}", save_path.display()))?;
    Ok(())
}

/// First sequence of a `(b, n, c, d, h, w)` buffer.
pub fn first_sequence(values: &[f32], dims: &[usize]) -> anyhow::Result<ndarray::Array5<f32>> {
    if dims.len() != 6 {
        anyhow::bail!("Expected a rank-6 batch, got {dims:?}");
    }
    let batch = ndarray::ArrayView6::from_shape(
        (dims[0], dims[1], dims[2], dims[3], dims[4], dims[5]),
        values,
    )
    .context("Prediction buffer does not match its shape")?;
    Ok(batch.index_axis(Axis(0), 0).to_owned())
}

fn normalize_map_to_rgb(map: &[f32], rows: usize, cols: usize) -> RgbImage {
    let values: Vec<f32> = map
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .collect();
    let (vmin, vmax) = if values.is_empty() {
        (0.0, 1.0)
    } else {
        let mut sorted = values;
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let low_idx = ((sorted.len() as f32) * 0.05).floor() as usize;
        let high_idx = ((sorted.len() as f32) * 0.95).floor() as usize;
        (
            sorted[low_idx.min(sorted.len() - 1)],
            sorted[high_idx.min(sorted.len() - 1)],
        )
    };

    let scale = (vmax - vmin).max(1e-6);
    let mut image: RgbImage = ImageBuffer::new(cols as u32, rows as u32);
    for y in 0..rows {
        for x in 0..cols {
            let value = map[y * cols + x];
            let norm = if value.is_finite() {
                ((value - vmin) / scale).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let gray = (norm * 255.0).round() as u8;
            image.put_pixel(x as u32, y as u32, Rgb([gray, gray, gray]));
        }
    }
    image
}

fn blit(dst: &mut RgbImage, src: &RgbImage, x_offset: usize, y_offset: usize) {
    for (x, y, pixel) in src.enumerate_pixels() {
        dst.put_pixel(x + x_offset as u32, y + y_offset as u32, *pixel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array5;

    #[test]
    fn montage_has_one_tile_per_frame_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/epoch_0.png");
        let original = Array5::from_shape_fn((10, 1, 3, 4, 5), |(n, _, d, h, w)| {
            (n + d + h + w) as f32
        });
        let reconstructed = original.mapv(|v| v * 0.5);
        save_reconstruction_montage(&path, original.view(), reconstructed.view()).unwrap();

        let image = image::open(&path).unwrap().to_rgb8();
        assert_eq!(image.dimensions(), (40, 6));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = Array5::<f32>::zeros((2, 1, 2, 2, 2));
        let b = Array5::<f32>::zeros((2, 1, 2, 2, 3));
        assert!(save_reconstruction_montage(&dir.path().join("x.png"), a.view(), b.view()).is_err());
    }

    #[test]
    fn first_sequence_drops_batch_axis() {
        let values: Vec<f32> = (0..2 * 3).map(|v| v as f32).collect();
        let seq = first_sequence(&values, &[2, 3, 1, 1, 1, 1]).unwrap();
        assert_eq!(seq.dim(), (3, 1, 1, 1, 1));
        assert_eq!(seq.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 2.0]);
        assert!(first_sequence(&values, &[6]).is_err());
    }
}
