use candle_core::{Result, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Module, ModuleT,
    VarBuilder,
};

#[derive(Debug)]
pub struct ConvBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
}

impl ConvBlock {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d_no_bias(in_channels, out_channels, 3, conv_cfg, vb.pp("conv1"))?;
        let bn1 = batch_norm(out_channels, BatchNormConfig::default(), vb.pp("bn1"))?;
        let conv2 = conv2d_no_bias(out_channels, out_channels, 3, conv_cfg, vb.pp("conv2"))?;
        let bn2 = batch_norm(out_channels, BatchNormConfig::default(), vb.pp("bn2"))?;
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv1.forward(x)?;
        let x = self.bn1.forward_t(&x, train)?;
        let x = x.relu()?;
        let x = self.conv2.forward(&x)?;
        let x = self.bn2.forward_t(&x, train)?;
        x.relu()
    }
}

#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Slices per frame in the 2D input.
    pub slices: usize,
    /// Channels of the 2D and 3D references (2 for phase `all`, else 1).
    pub reference_channels: usize,
    /// Volume width; the 3D reference is folded into channels along it.
    pub width: usize,
    pub latent_dim: usize,
}

/// Predicts every frame of a `(d, h, w)` volume sequence from its 2D slices
/// and one reference volume.
///
/// All convolutions run over the `(d, h)` plane. The 3D reference and the
/// output keep width as a channel axis.
#[derive(Debug)]
pub struct SliceToVolumeNet {
    cfg: NetConfig,
    encoder_2d: ConvBlock,
    encoder_3d: ConvBlock,
    fuse: ConvBlock,
    head: Conv2d,
}

impl SliceToVolumeNet {
    pub fn new(cfg: NetConfig, vb: VarBuilder) -> Result<Self> {
        let latent = cfg.latent_dim;
        let encoder_2d = ConvBlock::new(
            cfg.slices + cfg.reference_channels,
            latent,
            vb.pp("encoder_2d"),
        )?;
        let encoder_3d = ConvBlock::new(
            cfg.reference_channels * cfg.width,
            latent,
            vb.pp("encoder_3d"),
        )?;
        let fuse = ConvBlock::new(2 * latent, latent, vb.pp("fuse"))?;
        let head = candle_nn::conv2d(latent, cfg.width, 1, Default::default(), vb.pp("head"))?;
        Ok(Self {
            cfg,
            encoder_2d,
            encoder_3d,
            fuse,
            head,
        })
    }

    /// * `x_2d`: `(b, n, s, d, h)`
    /// * `x_3d_ref`: `(b, r, d, h, w)`
    /// * `x_2d_ref`: `(b, r, d, h)`
    ///
    /// Returns `(b, n, 1, d, h, w)`.
    pub fn forward_t(
        &self,
        x_2d: &Tensor,
        x_3d_ref: &Tensor,
        x_2d_ref: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (b, n, s, d, h) = x_2d.dims5()?;
        let (_, r, _, _, w) = x_3d_ref.dims5()?;
        if w != self.cfg.width || s != self.cfg.slices || r != self.cfg.reference_channels {
            candle_core::bail!(
                "input does not match network: slices={s} refs={r} width={w}, expected {:?}",
                self.cfg
            );
        }

        let frames = x_2d.reshape((b * n, s, d, h))?;
        let ref_2d = repeat_over_frames(x_2d_ref, n)?;
        let planar = Tensor::cat(&[&frames, &ref_2d], 1)?;
        let planar = self.encoder_2d.forward_t(&planar, train)?;

        // (b, r, d, h, w) -> (b, r * w, d, h)
        let folded = x_3d_ref
            .permute([0, 1, 4, 2, 3])?
            .contiguous()?
            .reshape((b, r * w, d, h))?;
        let volumetric = repeat_over_frames(&folded, n)?;
        let volumetric = self.encoder_3d.forward_t(&volumetric, train)?;

        let latent = Tensor::cat(&[&planar, &volumetric], 1)?;
        let latent = self.fuse.forward_t(&latent, train)?;
        // (b * n, w, d, h) -> (b, n, 1, d, h, w)
        self.head
            .forward(&latent)?
            .reshape(vec![b, n, 1, w, d, h])?
            .permute([0, 1, 2, 4, 5, 3])?
            .contiguous()
    }
}

/// `(b, c, d, h)` -> `(b * n, c, d, h)`, each batch entry repeated `n` times.
fn repeat_over_frames(x: &Tensor, n: usize) -> Result<Tensor> {
    let (b, c, d, h) = x.dims4()?;
    x.unsqueeze(1)?
        .broadcast_as((b, n, c, d, h))?
        .contiguous()?
        .reshape((b * n, c, d, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn net(reference_channels: usize) -> (VarMap, SliceToVolumeNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = SliceToVolumeNet::new(
            NetConfig {
                slices: 1,
                reference_channels,
                width: 5,
                latent_dim: 4,
            },
            vb,
        )
        .unwrap();
        (varmap, model)
    }

    #[test]
    fn forward_produces_sequence_of_volumes() {
        let dev = Device::Cpu;
        let (varmap, model) = net(2);
        let x_2d = Tensor::randn(0f32, 1.0, (2, 10, 1, 6, 4), &dev).unwrap();
        let x_3d_ref = Tensor::randn(0f32, 1.0, (2, 2, 6, 4, 5), &dev).unwrap();
        let x_2d_ref = Tensor::randn(0f32, 1.0, (2, 2, 6, 4), &dev).unwrap();

        let y = model.forward_t(&x_2d, &x_3d_ref, &x_2d_ref, true).unwrap();
        assert_eq!(y.dims(), &[2, 10, 1, 6, 4, 5]);
        assert!(!varmap.all_vars().is_empty());
    }

    #[test]
    fn mismatched_width_is_rejected() {
        let dev = Device::Cpu;
        let (_, model) = net(1);
        let x_2d = Tensor::zeros((1, 10, 1, 6, 4), DType::F32, &dev).unwrap();
        let x_3d_ref = Tensor::zeros((1, 1, 6, 4, 7), DType::F32, &dev).unwrap();
        let x_2d_ref = Tensor::zeros((1, 1, 6, 4), DType::F32, &dev).unwrap();
        assert!(model.forward_t(&x_2d, &x_3d_ref, &x_2d_ref, false).is_err());
    }

    #[test]
    fn repeat_keeps_batch_entries_contiguous() {
        let dev = Device::Cpu;
        let x = Tensor::from_vec(vec![1f32, 2.0], (2, 1, 1, 1), &dev).unwrap();
        let repeated = repeat_over_frames(&x, 3).unwrap();
        assert_eq!(
            repeated.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]
        );
    }
}
