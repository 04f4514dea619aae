use std::collections::BTreeMap;

use candle_core::{DType, Result, Tensor, D};
use serde::{Deserialize, Serialize};

/// Reconstruction loss between a predicted and a ground-truth sequence of
/// volumes, both `(b, n, c, d, h, w)`.
pub trait Loss: std::fmt::Debug {
    /// `idx_expanded` is the `(b, n, s, d, h)` slice index of the batch.
    fn compute(&self, prediction: &Tensor, target: &Tensor, idx_expanded: &Tensor)
        -> Result<Tensor>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LossOption {
    Mse,
    WeightedMse { weight: f32, threshold: f32 },
    Pjc2d,
    Pjc3d,
}

pub fn create_loss(opt: &LossOption) -> Box<dyn Loss> {
    match opt {
        LossOption::Mse => Box::new(MseLoss),
        LossOption::WeightedMse { weight, threshold } => Box::new(WeightedMseLoss {
            weight: *weight,
            threshold: *threshold,
        }),
        LossOption::Pjc2d => Box::new(SlicePlaneLoss),
        LossOption::Pjc3d => Box::new(ProjectionLoss),
    }
}

#[derive(Clone, Debug)]
pub struct MseLoss;

impl Loss for MseLoss {
    fn compute(&self, prediction: &Tensor, target: &Tensor, _idx: &Tensor) -> Result<Tensor> {
        mse(prediction, target)
    }
}

/// MSE where voxels with `target > threshold` count `weight` times.
#[derive(Clone, Debug)]
pub struct WeightedMseLoss {
    pub weight: f32,
    pub threshold: f32,
}

impl Loss for WeightedMseLoss {
    fn compute(&self, prediction: &Tensor, target: &Tensor, _idx: &Tensor) -> Result<Tensor> {
        let weights = target
            .gt(self.threshold)?
            .to_dtype(DType::F32)?
            .affine(f64::from(self.weight) - 1.0, 1.0)?;
        let weighted = prediction.sub(target)?.sqr()?.mul(&weights)?.sum_all()?;
        weighted.div(&weights.sum_all()?)
    }
}

/// MSE restricted to the observed slice plane of every frame.
#[derive(Clone, Debug)]
pub struct SlicePlaneLoss;

impl Loss for SlicePlaneLoss {
    fn compute(&self, prediction: &Tensor, target: &Tensor, idx: &Tensor) -> Result<Tensor> {
        mse(&gather_plane(prediction, idx)?, &gather_plane(target, idx)?)
    }
}

/// MSE between mean projections along the width axis.
#[derive(Clone, Debug)]
pub struct ProjectionLoss;

impl Loss for ProjectionLoss {
    fn compute(&self, prediction: &Tensor, target: &Tensor, _idx: &Tensor) -> Result<Tensor> {
        mse(&prediction.mean(D::Minus1)?, &target.mean(D::Minus1)?)
    }
}

pub fn mse(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    prediction.sub(target)?.sqr()?.mean_all()
}

/// Pick the `(d, h)` plane at `idx` (`(b, n, s, d, h)`) out of every
/// single-channel volume in `volume` (`(b, n, 1, d, h, w)`), giving
/// `(b, n, d, h, s)`.
pub fn gather_plane(volume: &Tensor, idx: &Tensor) -> Result<Tensor> {
    let volume = volume.squeeze(2)?.contiguous()?;
    let idx = idx.permute([0, 1, 3, 4, 2])?.contiguous()?;
    volume.gather(&idx, 4)
}

/// Weighted sum of named losses, evaluated in name order.
#[derive(Debug)]
pub struct LossMixer {
    terms: Vec<(String, Box<dyn Loss>, f64)>,
}

impl LossMixer {
    pub fn new(
        losses: &BTreeMap<String, LossOption>,
        coefs: &BTreeMap<String, f64>,
    ) -> anyhow::Result<Self> {
        if losses.is_empty() {
            anyhow::bail!("At least one loss is required");
        }
        let terms = losses
            .iter()
            .map(|(name, opt)| {
                let coef = coefs
                    .get(name)
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("Missing coefficient for loss `{name}`"))?;
                Ok((name.clone(), create_loss(opt), coef))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { terms })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(name, _, _)| name.as_str())
    }

    pub fn compute(
        &self,
        prediction: &Tensor,
        target: &Tensor,
        idx_expanded: &Tensor,
    ) -> Result<Tensor> {
        let mut total = Tensor::zeros((), DType::F32, prediction.device())?;
        for (_, loss, coef) in &self.terms {
            let term = loss.compute(prediction, target, idx_expanded)?;
            total = total.add(&term.affine(*coef, 0.0)?)?;
        }
        Ok(total)
    }
}
