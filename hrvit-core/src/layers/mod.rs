mod mix_conv;
mod patch_embed;
mod shortcut;

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};
use serde::{Deserialize, Serialize};

pub use mix_conv::MixConv2d;
pub use patch_embed::PatchEmbed;
pub use shortcut::{decompose, LowRankShortcut};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Gelu,
    #[serde(alias = "gelu_pytorch_tanh")]
    GeluPytorchTanh,
    Relu,
    Silu,
    #[serde(alias = "hard_swish")]
    HardSwish,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gelu => xs.gelu_erf(),
            Self::GeluPytorchTanh => xs.gelu(),
            Self::Relu => xs.relu(),
            Self::Silu => xs.silu(),
            Self::HardSwish => hard_swish(xs),
        }
    }
}

/// `x * relu6(x + 3) / 6`
pub fn hard_swish(xs: &Tensor) -> Result<Tensor> {
    let gate = ((xs + 3.0)?.clamp(0f32, 6f32)? / 6.0)?;
    xs * gate
}

#[allow(clippy::too_many_arguments)]
pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    groups: usize,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        stride,
        padding,
        groups,
        ..Default::default()
    };
    if bias {
        candle_nn::conv2d(in_channels, out_channels, kernel_size, cfg, vb)
    } else {
        candle_nn::conv2d_no_bias(in_channels, out_channels, kernel_size, cfg, vb)
    }
}

/// Depthwise `k x k` conv that keeps the spatial size at stride 1.
pub fn depthwise_conv2d(
    channels: usize,
    kernel_size: usize,
    stride: usize,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv2d> {
    conv2d(
        channels,
        channels,
        kernel_size,
        stride,
        kernel_size / 2,
        channels,
        bias,
        vb,
    )
}

/// Convolution followed by an inference-mode batch norm.
#[derive(Debug, Clone)]
pub struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    pub fn new(conv: Conv2d, out_channels: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let bn = candle_nn::batch_norm(out_channels, eps, vb)?;
        Ok(Self { conv, bn })
    }
}

impl Module for ConvBn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        self.bn.forward_t(&xs, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn hard_swish_matches_definition() -> Result<()> {
        let xs = Tensor::new(&[-4f32, -3., -1.5, 0., 1., 3., 5.], &Device::Cpu)?;
        let got = hard_swish(&xs)?.to_vec1::<f32>()?;
        let want = [0f32, 0., -0.375, 0., 0.6666667, 3., 5.];
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < 1e-5, "{g} != {w}");
        }
        Ok(())
    }

    #[test]
    fn activation_from_json() {
        let act: Activation = serde_json::from_str("\"hardswish\"").unwrap();
        assert_eq!(act, Activation::HardSwish);
        let act: Activation = serde_json::from_str("\"gelu\"").unwrap();
        assert_eq!(act, Activation::Gelu);
    }

    #[test]
    fn depthwise_keeps_shape() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let conv = depthwise_conv2d(8, 5, 1, true, vb)?;
        let xs = Tensor::ones((2, 8, 7, 9), DType::F32, &Device::Cpu)?;
        assert_eq!(conv.forward(&xs)?.dims(), &[2, 8, 7, 9]);
        Ok(())
    }

    #[test]
    fn conv_bn_strided() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let conv = conv2d(4, 6, 3, 2, 1, 1, false, vb.pp("conv"))?;
        let layer = ConvBn::new(conv, 6, 1e-5, vb.pp("bn"))?;
        let xs = Tensor::ones((1, 4, 9, 9), DType::F32, &Device::Cpu)?;
        assert_eq!(layer.forward(&xs)?.dims(), &[1, 6, 5, 5]);
        Ok(())
    }
}
