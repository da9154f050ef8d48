use candle_core::{Result, Tensor, D};
use candle_nn::{layer_norm, linear, Conv2d, LayerNorm, Linear, Module, VarBuilder};
use tracing::info;

use crate::{
    config::HrvitConfig,
    layers::{conv2d, hard_swish},
    stage::HrvitStage,
};

/// Two stride-2 convs taking the image to 1/4 resolution.
#[derive(Debug, Clone)]
struct Stem {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl Stem {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let mid = out_channels / 2;
        Ok(Self {
            conv1: conv2d(in_channels, mid, 3, 2, 1, 1, true, vb.pp("conv1"))?,
            conv2: conv2d(mid, out_channels, 3, 2, 1, 1, true, vb.pp("conv2"))?,
        })
    }
}

impl Module for Stem {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = hard_swish(&self.conv1.forward(xs)?)?;
        hard_swish(&self.conv2.forward(&xs)?)
    }
}

/// Pools every branch, concatenates and classifies.
#[derive(Debug, Clone)]
struct ClassificationHead {
    norm: LayerNorm,
    fc: Linear,
}

impl ClassificationHead {
    fn new(cfg: &HrvitConfig, vb: VarBuilder) -> Result<Self> {
        let features = cfg.head_features();
        Ok(Self {
            norm: layer_norm(features, cfg.layer_norm_eps, vb.pp("norm"))?,
            fc: linear(features, cfg.num_classes, vb.pp("fc"))?,
        })
    }

    fn forward(&self, branches: &[Tensor]) -> Result<Tensor> {
        let pooled = branches
            .iter()
            .map(|x| x.flatten_from(2)?.mean(D::Minus1))
            .collect::<Result<Vec<_>>>()?;
        let xs = Tensor::cat(&pooled, 1)?;
        self.fc.forward(&self.norm.forward(&xs)?)
    }
}

/// High-resolution vision transformer classifier.
#[derive(Debug, Clone)]
pub struct HrvitModel {
    stem: Stem,
    features: Vec<HrvitStage>,
    head: ClassificationHead,
    num_channels: usize,
    num_classes: usize,
}

impl HrvitModel {
    pub fn new(cfg: &HrvitConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate().map_err(candle_core::Error::wrap)?;
        let stem = Stem::new(cfg.num_channels, cfg.stem_channels, vb.pp("stem"))?;
        let features = (0..cfg.num_stages())
            .map(|s| HrvitStage::new(cfg, s, vb.pp("features").pp(s)))
            .collect::<Result<Vec<_>>>()?;
        let head = ClassificationHead::new(cfg, vb.pp("head"))?;
        info!(
            "Built HRViT: {} stages, channels {:?}, windows {:?}, {} classes.",
            features.len(),
            cfg.channels,
            cfg.ws_list,
            cfg.num_classes
        );
        Ok(Self {
            stem,
            features,
            head,
            num_channels: cfg.num_channels,
            num_classes: cfg.num_classes,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Final multi-resolution feature maps, highest resolution first.
    pub fn forward_features(&self, pixel_values: &Tensor) -> Result<Vec<Tensor>> {
        let (_b, c, h, w) = pixel_values.dims4()?;
        if c != self.num_channels {
            candle_core::bail!("Expected {} image channels, got {c}", self.num_channels);
        }
        if h < 4 || w < 4 {
            candle_core::bail!("Image of {h}x{w} is smaller than the 4x4 stem stride");
        }
        let mut xs = vec![self.stem.forward(pixel_values)?];
        for stage in &self.features {
            xs = stage.forward(&xs)?;
        }
        Ok(xs)
    }

    /// Logits of shape (b, num_classes).
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let features = self.forward_features(pixel_values)?;
        self.head.forward(&features)
    }
}
