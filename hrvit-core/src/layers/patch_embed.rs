use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, Conv2d, LayerNorm, Module, VarBuilder};

use super::{conv2d, depthwise_conv2d};

/// Per-branch token embedding: a pointwise projection to `dim`, a 3x3
/// depthwise conv, then LayerNorm over the flattened tokens.
#[derive(Debug, Clone)]
pub struct PatchEmbed {
    proj: Conv2d,
    dw: Conv2d,
    norm: LayerNorm,
    in_channels: usize,
}

impl PatchEmbed {
    pub fn new(
        in_channels: usize,
        dim: usize,
        patch_size: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let proj = conv2d(in_channels, dim, 1, 1, 0, 1, true, vb.pp("proj.0"))?;
        let dw = depthwise_conv2d(dim, patch_size, 1, true, vb.pp("proj.1"))?;
        let norm = layer_norm(dim, eps, vb.pp("norm"))?;
        Ok(Self {
            proj,
            dw,
            norm,
            in_channels,
        })
    }

    /// Input (b, c, h, w), output tokens (b, h*w, dim) and the grid size.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, usize, usize)> {
        let (_b, c, _h, _w) = xs.dims4()?;
        if c != self.in_channels {
            candle_core::bail!(
                "PatchEmbed expected {} input channels, got {c}",
                self.in_channels
            );
        }
        let xs = self.dw.forward(&self.proj.forward(xs)?)?;
        let (_, _, h, w) = xs.dims4()?;
        let xs = xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        Ok((self.norm.forward(&xs)?, h, w))
    }
}
