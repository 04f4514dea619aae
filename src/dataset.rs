use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array4, Ix4, OwnedRepr};
use ndarray_npy::NpzReader;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::sample::PairedSample;
use crate::slice::{BasicSliceIndexer, SliceIndexer};
use crate::transforms::{Compose, Transform};

/// Training sequences per test sequence in the sorted file listing.
pub const TRAIN_PER_TEST: usize = 4;

/// Sub-directory of the dataset root holding the CT archives.
pub const CT_SUBDIR: &str = "CT";

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("dataset root does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("no sequences found for the {split} split under {root}")]
    Empty { root: PathBuf, split: &'static str },
    #[error("archive {path} has no `arr_0` array of rank 4")]
    MissingArray { path: PathBuf },
    #[error("expected {expected} frames per sequence but got {actual}")]
    PeriodMismatch { expected: usize, actual: usize },
    #[error("slice index {index} is outside a volume of width {width}")]
    SliceOutOfRange { index: usize, width: usize },
    #[error("item index {index} out of bounds for dataset of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("shape error: {0}")]
    Shape(String),
}

#[derive(Clone, Debug)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub threshold: f32,
    pub min_occupancy: f64,
    pub in_memory: bool,
}

#[derive(Debug)]
pub struct CtDataset {
    pub paths: Vec<PathBuf>,
    data: Vec<Array4<f32>>,
    indexer: BasicSliceIndexer,
    transform: Compose,
    in_memory: bool,
}

impl CtDataset {
    /// Discover the `is_train` split of `cfg.root` and, when `in_memory` is
    /// set, load and transform every sequence up front.
    pub fn new(
        cfg: &DatasetConfig,
        transform: Compose,
        is_train: bool,
        rng: &mut StdRng,
    ) -> anyhow::Result<Self> {
        let paths = discover_sequences(&cfg.root, is_train)?;
        let split = if is_train { "train" } else { "test" };
        if paths.is_empty() {
            return Err(DatasetError::Empty {
                root: cfg.root.clone(),
                split,
            }
            .into());
        }
        info!(split, sequences = paths.len(), "discovered CT sequences");

        let mut data = Vec::new();
        if cfg.in_memory {
            let progress = ProgressBar::new(paths.len() as u64);
            progress.set_style(loading_style());
            progress.set_message(format!("loading {split} sequences"));
            data.reserve(paths.len());
            for path in &paths {
                let volume = load_sequence(path)?;
                data.push(transform.apply(volume, rng)?);
                progress.inc(1);
            }
            progress.finish_and_clear();
        }

        Ok(Self {
            paths,
            data,
            indexer: BasicSliceIndexer::new(cfg.threshold, cfg.min_occupancy),
            transform,
            in_memory: cfg.in_memory,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn load_item(&self, index: usize, rng: &mut StdRng) -> anyhow::Result<PairedSample> {
        let path = self.paths.get(index).ok_or(DatasetError::IndexOutOfBounds {
            index,
            len: self.paths.len(),
        })?;

        let loaded;
        let volume = if self.in_memory {
            &self.data[index]
        } else {
            let raw = load_sequence(path)?;
            loaded = self.transform.apply(raw, rng)?;
            &loaded
        };

        let slice_idx = self.indexer.select(volume.view(), rng)?;
        debug!(path = %path.display(), slice_idx, "assembling sample");
        let sample = PairedSample::assemble(volume.view(), slice_idx)
            .with_context(|| format!("Invalid sequence: {}", path.display()))?;
        Ok(sample)
    }
}

/// Every `.npz` archive under `<root>/CT`, sorted, filtered to one split.
///
/// Position `i` in the listing belongs to the test split when
/// `i % (1 + TRAIN_PER_TEST) == 0`.
pub fn discover_sequences(root: &Path, is_train: bool) -> anyhow::Result<Vec<PathBuf>> {
    let data_root = root.join(CT_SUBDIR);
    if !data_root.exists() {
        return Err(DatasetError::MissingRoot(data_root).into());
    }

    let mut all = Vec::new();
    collect_archives(&data_root, &mut all)?;
    all.sort();

    Ok(all
        .into_iter()
        .enumerate()
        .filter(|(i, _)| (i % (1 + TRAIN_PER_TEST) != 0) == is_train)
        .map(|(_, path)| path)
        .collect())
}

fn collect_archives(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read dataset dir: {}", dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to list dataset dir: {}", dir.display()))?
            .path();
        if path.is_dir() {
            collect_archives(&path, out)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("npz"))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}

/// Read the `(n, d, h, w)` sequence stored as `arr_0` in an `.npz` archive.
pub fn load_sequence(path: &Path) -> anyhow::Result<Array4<f32>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open sequence: {}", path.display()))?;
    let mut npz = NpzReader::new(file)
        .with_context(|| format!("Failed to read npz archive: {}", path.display()))?;

    for name in ["arr_0.npy", "arr_0"] {
        if let Ok(arr) = npz.by_name::<OwnedRepr<f32>, Ix4>(name) {
            return Ok(arr);
        }
        if let Ok(arr) = npz.by_name::<OwnedRepr<f64>, Ix4>(name) {
            return Ok(arr.mapv(|value| value as f32));
        }
    }

    Err(DatasetError::MissingArray {
        path: path.to_path_buf(),
    }
    .into())
}

fn loading_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_npy::NpzWriter;
    use rand::SeedableRng;

    fn write_archive(path: &Path, volume: &Array4<f32>) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut npz = NpzWriter::new(File::create(path).unwrap());
        npz.add_array("arr_0", volume).unwrap();
        npz.finish().unwrap();
    }

    #[test]
    fn split_takes_every_fifth_file_for_test() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Array4::<f32>::zeros((1, 1, 1, 1));
        for i in 0..10 {
            let sub = if i % 2 == 0 { "a" } else { "b/c" };
            write_archive(&dir.path().join(CT_SUBDIR).join(sub).join(format!("{i:02}.npz")), &volume);
        }
        fs::write(dir.path().join(CT_SUBDIR).join("notes.txt"), "skip").unwrap();

        let train = discover_sequences(dir.path(), true).unwrap();
        let test = discover_sequences(dir.path(), false).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 2);

        let mut all: Vec<PathBuf> = train.iter().chain(test.iter()).cloned().collect();
        all.sort();
        assert_eq!(test, vec![all[0].clone(), all[5].clone()]);
    }

    #[test]
    fn missing_root_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_sequences(dir.path(), true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::MissingRoot(_))
        ));
    }

    #[test]
    fn unreadable_listing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CT_SUBDIR), "not a directory").unwrap();
        let err = discover_sequences(dir.path(), true).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read dataset dir"));
    }

    #[test]
    fn loads_f64_archives_as_f32() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.npz");
        let volume = Array4::<f64>::from_elem((2, 1, 1, 3), 0.5);
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        npz.add_array("arr_0", &volume).unwrap();
        npz.finish().unwrap();

        let loaded = load_sequence(&path).unwrap();
        assert_eq!(loaded.dim(), (2, 1, 1, 3));
        assert!(loaded.iter().all(|v| *v == 0.5));
    }

    #[test]
    fn wrong_array_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.npz");
        let mut npz = NpzWriter::new(File::create(&path).unwrap());
        npz.add_array("volume", &Array4::<f32>::zeros((1, 1, 1, 1)))
            .unwrap();
        npz.finish().unwrap();

        let err = load_sequence(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::MissingArray { .. })
        ));
    }

    #[test]
    fn lazy_and_in_memory_modes_agree() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            let mut volume = Array4::<f32>::zeros((10, 2, 3, 4));
            volume
                .slice_mut(ndarray::s![.., .., .., i % 4])
                .fill(1.0 + i as f32);
            write_archive(&dir.path().join(CT_SUBDIR).join(format!("{i}.npz")), &volume);
        }

        let mut rng = StdRng::seed_from_u64(0);
        for in_memory in [false, true] {
            let cfg = DatasetConfig {
                root: dir.path().to_path_buf(),
                threshold: 0.1,
                min_occupancy: 0.5,
                in_memory,
            };
            let dataset = CtDataset::new(&cfg, Compose::default(), true, &mut rng).unwrap();
            assert_eq!(dataset.len(), 4);
            for index in 0..dataset.len() {
                let sample = dataset.load_item(index, &mut rng).unwrap();
                // Sequence i (i = 1..5) is occupied only at width i % 4.
                assert_eq!(sample.slice_idx[0] as usize, (index + 1) % 4);
            }
            assert!(dataset.load_item(4, &mut rng).is_err());
        }
    }

    #[test]
    fn short_sequence_fails_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..2 {
            write_archive(
                &dir.path().join(CT_SUBDIR).join(format!("{i}.npz")),
                &Array4::<f32>::ones((9, 2, 2, 2)),
            );
        }
        let cfg = DatasetConfig {
            root: dir.path().to_path_buf(),
            threshold: 0.1,
            min_occupancy: 0.2,
            in_memory: false,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let dataset = CtDataset::new(&cfg, Compose::default(), true, &mut rng).unwrap();
        let err = dataset.load_item(0, &mut rng).unwrap_err();
        assert!(matches!(
            err.root_cause().downcast_ref::<DatasetError>(),
            Some(DatasetError::PeriodMismatch {
                expected: 10,
                actual: 9
            })
        ));
    }
}
