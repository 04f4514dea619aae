use anyhow::Context;
use candle_core::{Device, Tensor};
use ndarray::{ArrayBase, Data, Dimension};

use crate::sample::{PairedSample, Phase};

/// [`PairedSample`] fields stacked along a leading batch axis `b`.
#[derive(Debug, Clone)]
pub struct PairedBatch {
    /// `(b, n, s, d, h)`
    pub x_2d: Tensor,
    /// `(b, s, d, h)`
    pub x_2d_0: Tensor,
    pub x_2d_t: Tensor,
    /// `(b, 2s, d, h)`
    pub x_2d_all: Tensor,
    /// `(b, n, c, d, h, w)`
    pub x_3d: Tensor,
    /// `(b, c, d, h, w)`
    pub x_3d_0: Tensor,
    pub x_3d_t: Tensor,
    /// `(b, 2c, d, h, w)`
    pub x_3d_all: Tensor,
    /// `(b, s)`, `u32`
    pub slice_idx: Tensor,
    /// `(b, n, s, d, h)`, `u32`
    pub idx_expanded: Tensor,
}

impl PairedBatch {
    pub fn collate(samples: &[PairedSample], device: &Device) -> anyhow::Result<Self> {
        if samples.is_empty() {
            anyhow::bail!("Cannot collate an empty batch");
        }

        Ok(Self {
            x_2d: stack_field(samples, device, "x_2d", |s| to_tensor(&s.x_2d))?,
            x_2d_0: stack_field(samples, device, "x_2d_0", |s| to_tensor(&s.x_2d_0))?,
            x_2d_t: stack_field(samples, device, "x_2d_t", |s| to_tensor(&s.x_2d_t))?,
            x_2d_all: stack_field(samples, device, "x_2d_all", |s| to_tensor(&s.x_2d_all))?,
            x_3d: stack_field(samples, device, "x_3d", |s| to_tensor(&s.x_3d))?,
            x_3d_0: stack_field(samples, device, "x_3d_0", |s| to_tensor(&s.x_3d_0))?,
            x_3d_t: stack_field(samples, device, "x_3d_t", |s| to_tensor(&s.x_3d_t))?,
            x_3d_all: stack_field(samples, device, "x_3d_all", |s| to_tensor(&s.x_3d_all))?,
            slice_idx: stack_field(samples, device, "slice_idx", |s| to_tensor(&s.slice_idx))?,
            idx_expanded: stack_field(samples, device, "idx_expanded", |s| to_tensor(&s.idx_expanded))?,
        })
    }

    /// `(x_2d reference, x_3d reference)` for `phase`.
    pub fn reference(&self, phase: Phase) -> (&Tensor, &Tensor) {
        match phase {
            Phase::All => (&self.x_2d_all, &self.x_3d_all),
            Phase::Zero => (&self.x_2d_0, &self.x_3d_0),
            Phase::Mid => (&self.x_2d_t, &self.x_3d_t),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.x_2d.dims()[0]
    }
}

fn stack_field(
    samples: &[PairedSample],
    device: &Device,
    name: &str,
    pick: impl Fn(&PairedSample) -> anyhow::Result<Tensor>,
) -> anyhow::Result<Tensor> {
    let tensors = samples
        .iter()
        .map(pick)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Tensor::stack(&tensors, 0)
        .and_then(|stacked| stacked.to_device(device))
        .with_context(|| format!("Failed to collate `{name}`"))
}

/// Copy an ndarray into a CPU tensor of the same shape.
pub fn to_tensor<A, S, D>(array: &ArrayBase<S, D>) -> anyhow::Result<Tensor>
where
    A: candle_core::WithDType,
    S: Data<Elem = A>,
    D: Dimension,
{
    let shape = array.shape().to_vec();
    let values: Vec<A> = array.iter().copied().collect();
    Tensor::from_vec(values, shape, &Device::Cpu).context("Failed to build tensor from array")
}
