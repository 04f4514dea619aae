use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Axis;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{info, warn};

use crate::batch::PairedBatch;
use crate::config::TrainConfig;
use crate::dataset::CtDataset;
use crate::losses::LossMixer;
use crate::model::{NetConfig, SliceToVolumeNet};
use crate::optim::{create_optimizer, create_scheduler, TrainOptimizer};
use crate::preview::{first_sequence, save_reconstruction_montage};
use crate::sample::Phase;
use crate::transforms::create_pipeline;

/// Batches per loop when `--debug` is set.
const DEBUG_MAX_ITER: usize = 5;

#[derive(Debug, Clone, Serialize)]
struct EpochSummary {
    epoch: usize,
    train_loss: f64,
    val_loss: f64,
    lr: f64,
    epoch_seconds: f64,
}

/// Everything one epoch needs besides the dataset it iterates.
struct Trainer<'a> {
    model: &'a SliceToVolumeNet,
    criterion: &'a LossMixer,
    device: &'a Device,
    phase: Phase,
    pred_diff: bool,
    batch_size: usize,
    max_iter: Option<usize>,
    log_every_batches: usize,
}

pub fn run_training(cfg: &TrainConfig) -> anyhow::Result<()> {
    cfg.validate()?;

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let dataset_cfg = cfg.dataset_config();
    let transform_opts = cfg.transform_options();
    let train_dataset = CtDataset::new(
        &dataset_cfg,
        create_pipeline(&transform_opts)?,
        true,
        &mut rng,
    )?;
    let val_dataset = CtDataset::new(
        &dataset_cfg,
        create_pipeline(&transform_opts)?,
        false,
        &mut rng,
    )?;
    info!(
        train = train_dataset.len(),
        val = val_dataset.len(),
        "datasets ready"
    );

    let device = resolve_device(&cfg.device)?;
    info!(?device, "using device");

    // Width is fixed by the transforms; read it off the first sample.
    let probe = train_dataset.load_item(0, &mut rng)?;
    let width = probe.x_3d.len_of(Axis(4));

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = SliceToVolumeNet::new(
        NetConfig {
            slices: probe.x_2d.len_of(Axis(1)),
            reference_channels: cfg.phase.reference_channels(),
            width,
            latent_dim: cfg.latent_dim,
        },
        vb,
    )?;

    let optimizer_opt = cfg.optimizer_option();
    let mut optimizer = create_optimizer(&optimizer_opt, varmap.all_vars())?;
    let mut scheduler =
        create_scheduler(&cfg.scheduler_option(), optimizer_opt.lr(), cfg.epochs)?;
    let (loss_opts, loss_coefs) = cfg.loss_options();
    let criterion = LossMixer::new(&loss_opts, &loss_coefs)?;
    info!(
        losses = ?criterion.names().collect::<Vec<_>>(),
        ?optimizer,
        "criterion and optimizer ready"
    );

    let run_id = cfg
        .run_name
        .clone()
        .unwrap_or_else(|| Utc::now().format("%Y%m%d-%H%M%S").to_string());
    let run_dir = PathBuf::from(&cfg.output_dir).join(&run_id);
    let checkpoints_dir = run_dir.join("checkpoints");
    let previews_dir = run_dir.join("logs").join("reconstructed");
    for dir in [&checkpoints_dir, &previews_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed creating directory: {}", dir.display()))?;
    }

    let config_path = run_dir.join("config.json");
    fs::write(&config_path, serde_json::to_string_pretty(cfg)?)
        .with_context(|| format!("Failed writing config: {}", config_path.display()))?;

    let trainer = Trainer {
        model: &model,
        criterion: &criterion,
        device: &device,
        phase: cfg.phase,
        pred_diff: cfg.pred_diff,
        batch_size: cfg.batch_size,
        max_iter: cfg.debug.then_some(DEBUG_MAX_ITER),
        log_every_batches: cfg.log_every_batches,
    };

    let mut best_val_loss = f64::INFINITY;
    let mut best_epoch = 0usize;
    let mut epoch_summaries = Vec::new();

    for epoch in 0..cfg.epochs {
        let epoch_started = Instant::now();

        let mut train_indices: Vec<usize> = (0..train_dataset.len()).collect();
        train_indices.shuffle(&mut rng);
        let train_loss = trainer.run_epoch(
            &train_dataset,
            &train_indices,
            Some(&mut optimizer),
            epoch,
            &mut rng,
        )?;
        info!(epoch = epoch + 1, train_loss, "average loss");

        let lr = scheduler.step(&mut optimizer);

        let val_indices: Vec<usize> = (0..val_dataset.len()).collect();
        let val_loss = trainer.run_epoch(&val_dataset, &val_indices, None, epoch, &mut rng)?;
        info!(epoch = epoch + 1, val_loss, "validation loss");

        let summary = EpochSummary {
            epoch: epoch + 1,
            train_loss,
            val_loss,
            lr,
            epoch_seconds: epoch_started.elapsed().as_secs_f64(),
        };
        epoch_summaries.push(summary.clone());

        if cfg.preview_every_epochs > 0 && epoch % cfg.preview_every_epochs == 0 {
            trainer.write_preview(&val_dataset, &previews_dir, epoch, &mut rng)?;
        }

        save_checkpoint(&varmap, &summary, &checkpoints_dir, "last")?;
        if val_loss < best_val_loss {
            best_val_loss = val_loss;
            best_epoch = epoch + 1;
            save_checkpoint(&varmap, &summary, &checkpoints_dir, "best")?;
        }
    }

    let history_path = run_dir.join("metrics_history.json");
    fs::write(
        &history_path,
        serde_json::to_string_pretty(&epoch_summaries)?,
    )
    .with_context(|| format!("Failed writing training history: {}", history_path.display()))?;

    info!(
        run_id = %run_id,
        best_val_loss,
        best_epoch,
        artifacts = %run_dir.display(),
        "training finished"
    );
    Ok(())
}

impl Trainer<'_> {
    /// Returns the mean batch loss. Training mode when `optimizer` is given.
    fn run_epoch(
        &self,
        dataset: &CtDataset,
        indices: &[usize],
        mut optimizer: Option<&mut TrainOptimizer>,
        epoch: usize,
        rng: &mut StdRng,
    ) -> anyhow::Result<f64> {
        let is_training = optimizer.is_some();
        let num_batches = indices.len().div_ceil(self.batch_size);
        let progress = ProgressBar::new(num_batches as u64);
        progress.set_style(progress_style());

        let mut total_loss = 0f64;
        let mut batches = 0usize;

        for (batch_idx, batch_indices) in indices.chunks(self.batch_size).enumerate() {
            if self.max_iter.is_some_and(|max_iter| max_iter <= batch_idx) {
                break;
            }

            let batch = load_batch(dataset, batch_indices, self.device, rng)?;
            let loss = self.batch_loss(&batch, is_training)?;
            if let Some(opt) = optimizer.as_deref_mut() {
                opt.backward_step(&loss)?;
            }

            let loss = f64::from(loss.to_scalar::<f32>()?);
            total_loss += loss;
            batches += 1;
            progress.set_message(format!("loss={loss:.6}"));
            progress.inc(1);

            if is_training
                && self.log_every_batches > 0
                && batch_idx % self.log_every_batches == 0
            {
                info!(epoch = epoch + 1, batch = batch_idx, loss, "train step");
            }
        }
        progress.finish_and_clear();

        if batches == 0 {
            warn!(epoch = epoch + 1, "epoch ran no batches");
            return Ok(f64::NAN);
        }
        Ok(total_loss / batches as f64)
    }

    fn batch_loss(&self, batch: &PairedBatch, train: bool) -> anyhow::Result<Tensor> {
        let (x_2d_ref, x_3d_ref) = batch.reference(self.phase);
        let y = self
            .model
            .forward_t(&batch.x_2d, x_3d_ref, x_2d_ref, train)?;
        let target = if self.pred_diff {
            batch.x_3d.broadcast_sub(&x_3d_ref.unsqueeze(1)?)?
        } else {
            batch.x_3d.clone()
        };
        Ok(self.criterion.compute(&y, &target, &batch.idx_expanded)?)
    }

    /// Reconstruct the first validation batch and save its first sequence.
    fn write_preview(
        &self,
        dataset: &CtDataset,
        preview_dir: &Path,
        epoch: usize,
        rng: &mut StdRng,
    ) -> anyhow::Result<()> {
        let count = self.batch_size.min(dataset.len());
        let indices: Vec<usize> = (0..count).collect();
        let batch = load_batch(dataset, &indices, self.device, rng)?;

        let (x_2d_ref, x_3d_ref) = batch.reference(self.phase);
        let mut y = self
            .model
            .forward_t(&batch.x_2d, x_3d_ref, x_2d_ref, false)?;
        if self.pred_diff {
            y = y.broadcast_add(&x_3d_ref.unsqueeze(1)?)?;
        }

        let original = tensor_first_sequence(&batch.x_3d)?;
        let reconstructed = tensor_first_sequence(&y)?;
        let path = preview_dir.join(format!("original_epoch_{epoch}.png"));
        save_reconstruction_montage(&path, original.view(), reconstructed.view())
    }
}

fn load_batch(
    dataset: &CtDataset,
    batch_indices: &[usize],
    device: &Device,
    rng: &mut StdRng,
) -> anyhow::Result<PairedBatch> {
    let samples = batch_indices
        .iter()
        .map(|index| dataset.load_item(*index, rng))
        .collect::<anyhow::Result<Vec<_>>>()?;
    PairedBatch::collate(&samples, device)
}

fn tensor_first_sequence(tensor: &Tensor) -> anyhow::Result<ndarray::Array5<f32>> {
    let dims = tensor.dims().to_vec();
    let values = tensor
        .to_device(&Device::Cpu)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    first_sequence(&values, &dims)
}

fn save_checkpoint(
    varmap: &VarMap,
    summary: &EpochSummary,
    checkpoints_dir: &Path,
    name: &str,
) -> anyhow::Result<()> {
    let ckpt = checkpoints_dir.join(format!("{name}.safetensors"));
    varmap
        .save(&ckpt)
        .with_context(|| format!("Failed writing checkpoint: {}", ckpt.display()))?;
    let meta = checkpoints_dir.join(format!("{name}.json"));
    fs::write(&meta, serde_json::to_string_pretty(summary)?)
        .with_context(|| format!("Failed writing checkpoint metadata: {}", meta.display()))?;
    Ok(())
}

fn resolve_device(device_arg: &str) -> anyhow::Result<Device> {
    match device_arg {
        "auto" => match Device::cuda_if_available(0) {
            Ok(device) => Ok(device),
            Err(_) => Ok(Device::Cpu),
        },
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::cuda_if_available(0)
            .context("CUDA requested with --device cuda, but CUDA is not available"),
        other => anyhow::bail!("Unsupported --device value: {other} (expected auto|cpu|cuda)"),
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}
