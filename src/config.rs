use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::dataset::DatasetConfig;
use crate::losses::LossOption;
use crate::optim::{OptimizerOption, SchedulerOption};
use crate::sample::Phase;
use crate::transforms::TransformOption;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TransformKind {
    MinMax,
    UniformShape3d,
    Pool3d,
    RandomShift2d,
    RandomShift3d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerKind {
    Adamw,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    Constant,
    Step,
    Exponential,
    Cosine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LossKind {
    Mse,
    WeightedMse,
    Pjc2d,
    Pjc3d,
}

/// One `--loss name=coef` term.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossTerm {
    pub kind: LossKind,
    pub coef: f64,
}

impl FromStr for LossTerm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, coef) = match s.split_once('=') {
            Some((name, coef)) => (name, coef),
            None => (s, "1.0"),
        };
        let kind = LossKind::from_str(name.trim(), true)?;
        let coef = coef
            .trim()
            .parse::<f64>()
            .map_err(|err| format!("invalid coefficient in `{s}`: {err}"))?;
        Ok(Self { kind, coef })
    }
}

#[derive(Debug, Clone, Serialize, Parser)]
#[command(
    name = "ct-phase-recon",
    about = "Train a slice-to-volume reconstruction model on periodic CT sequences using Candle"
)]
pub struct TrainConfig {
    #[arg(long, default_value = "./data", help = "Dataset root containing a CT/ directory")]
    pub dataset_root: String,

    #[arg(long, default_value_t = 0.1, help = "Intensity threshold for slice occupancy")]
    pub threshold: f32,

    #[arg(long, default_value_t = 0.2)]
    pub min_occupancy: f64,

    #[arg(long, default_value_t = false, help = "Load every sequence before training")]
    pub in_memory: bool,

    #[arg(long = "transform", value_enum, default_values_t = [TransformKind::MinMax])]
    pub transforms: Vec<TransformKind>,

    #[arg(long, value_delimiter = ',', default_values_t = [64usize, 64, 64])]
    pub uniform_shape: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_values_t = [2usize, 2, 2])]
    pub pool_kernel: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_values_t = [10usize, 10])]
    pub shift2d: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_values_t = [5usize, 30, 30])]
    pub shift3d: Vec<usize>,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Adamw)]
    pub optimizer: OptimizerKind,

    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,

    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f64,

    #[arg(long, value_enum, default_value_t = SchedulerKind::Constant)]
    pub scheduler: SchedulerKind,

    #[arg(long, default_value_t = 30)]
    pub step_size: usize,

    #[arg(long, default_value_t = 0.1)]
    pub gamma: f64,

    #[arg(long, default_value_t = 0.0)]
    pub eta_min: f64,

    #[arg(
        long = "loss",
        default_values_t = [LossTerm { kind: LossKind::Mse, coef: 1.0 }],
        help = "Loss term as name=coef (mse, weighted-mse, pjc2d, pjc3d); repeatable"
    )]
    pub losses: Vec<LossTerm>,

    #[arg(long, default_value_t = 5.0)]
    pub mse_weight: f32,

    #[arg(long, default_value_t = 0.1)]
    pub mse_threshold: f32,

    #[arg(long, value_enum, default_value_t = Phase::All)]
    pub phase: Phase,

    #[arg(
        long,
        default_value_t = false,
        help = "Predict the difference to the reference volume"
    )]
    pub pred_diff: bool,

    #[arg(long, default_value_t = 16)]
    pub latent_dim: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value = "auto")]
    pub device: String,

    #[arg(long, default_value = "./results")]
    pub output_dir: String,

    #[arg(long)]
    pub run_name: Option<String>,

    #[arg(long, default_value_t = 100)]
    pub log_every_batches: usize,

    #[arg(long, default_value_t = 10)]
    pub preview_every_epochs: usize,

    #[arg(long, default_value_t = false, help = "Stop each loop after 5 batches")]
    pub debug: bool,
}

impl LossKind {
    /// CLI spelling, also used as the loss key.
    pub fn name(self) -> String {
        self.to_possible_value()
            .map(|value| value.get_name().to_string())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for LossTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.kind.name(), self.coef)
    }
}

impl TrainConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.min_occupancy) {
            anyhow::bail!(
                "--min-occupancy must be in [0, 1], got {}",
                self.min_occupancy
            );
        }
        if !self.threshold.is_finite() {
            anyhow::bail!("--threshold must be finite");
        }
        if self.batch_size == 0 {
            anyhow::bail!("--batch-size must be > 0");
        }
        if self.latent_dim == 0 {
            anyhow::bail!("--latent-dim must be > 0");
        }
        if self.pred_diff && self.phase == Phase::All {
            anyhow::bail!("--pred-diff requires --phase 0 or --phase t");
        }
        if self.losses.is_empty() {
            anyhow::bail!("At least one --loss is required");
        }
        let mut seen = Vec::new();
        for term in &self.losses {
            if seen.contains(&term.kind) {
                anyhow::bail!("--loss {term} is given more than once");
            }
            seen.push(term.kind);
        }
        check_len("--uniform-shape", &self.uniform_shape, 3)?;
        check_len("--pool-kernel", &self.pool_kernel, 3)?;
        check_len("--shift2d", &self.shift2d, 2)?;
        check_len("--shift3d", &self.shift3d, 3)?;
        if !(self.mse_weight.is_finite() && self.mse_weight > 0.0) {
            anyhow::bail!("--mse-weight must be > 0, got {}", self.mse_weight);
        }
        if self.scheduler == SchedulerKind::Step && self.step_size == 0 {
            anyhow::bail!("--step-size must be > 0");
        }
        Ok(())
    }

    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            root: PathBuf::from(&self.dataset_root),
            threshold: self.threshold,
            min_occupancy: self.min_occupancy,
            in_memory: self.in_memory,
        }
    }

    pub fn transform_options(&self) -> Vec<TransformOption> {
        self.transforms
            .iter()
            .map(|kind| match kind {
                TransformKind::MinMax => TransformOption::MinMaxNormalization,
                TransformKind::UniformShape3d => TransformOption::UniformShape3d {
                    target: triple(&self.uniform_shape),
                },
                TransformKind::Pool3d => TransformOption::Pool3d {
                    kernel: triple(&self.pool_kernel),
                },
                TransformKind::RandomShift2d => TransformOption::RandomShift2d {
                    max_shifts: [self.shift2d[0], self.shift2d[1]],
                },
                TransformKind::RandomShift3d => TransformOption::RandomShift3d {
                    max_shifts: triple(&self.shift3d),
                },
            })
            .collect()
    }

    pub fn optimizer_option(&self) -> OptimizerOption {
        match self.optimizer {
            OptimizerKind::Adamw => OptimizerOption::AdamW {
                lr: self.lr,
                weight_decay: self.weight_decay,
            },
            OptimizerKind::Sgd => OptimizerOption::Sgd { lr: self.lr },
        }
    }

    pub fn scheduler_option(&self) -> SchedulerOption {
        match self.scheduler {
            SchedulerKind::Constant => SchedulerOption::Constant,
            SchedulerKind::Step => SchedulerOption::Step {
                step_size: self.step_size,
                gamma: self.gamma,
            },
            SchedulerKind::Exponential => SchedulerOption::Exponential { gamma: self.gamma },
            SchedulerKind::Cosine => SchedulerOption::Cosine {
                eta_min: self.eta_min,
            },
        }
    }

    /// Named loss options and their coefficients, keyed by the CLI name.
    pub fn loss_options(&self) -> (BTreeMap<String, LossOption>, BTreeMap<String, f64>) {
        let mut losses = BTreeMap::new();
        let mut coefs = BTreeMap::new();
        for term in &self.losses {
            let option = match term.kind {
                LossKind::Mse => LossOption::Mse,
                LossKind::WeightedMse => LossOption::WeightedMse {
                    weight: self.mse_weight,
                    threshold: self.mse_threshold,
                },
                LossKind::Pjc2d => LossOption::Pjc2d,
                LossKind::Pjc3d => LossOption::Pjc3d,
            };
            let name = term.kind.name();
            losses.insert(name.clone(), option);
            coefs.insert(name, term.coef);
        }
        (losses, coefs)
    }
}

fn check_len(flag: &str, values: &[usize], expected: usize) -> anyhow::Result<()> {
    if values.len() != expected {
        anyhow::bail!(
            "{flag} takes {expected} comma-separated values, got {}",
            values.len()
        );
    }
    Ok(())
}

fn triple(values: &[usize]) -> [usize; 3] {
    [values[0], values[1], values[2]]
}
