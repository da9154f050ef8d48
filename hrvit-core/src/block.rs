use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};

use crate::{
    attention::CrossShapedAttention,
    config::HrvitConfig,
    layers::{Activation, LowRankShortcut, MixConv2d},
};

/// Feed-forward block with a mixed-kernel depthwise conv between the two
/// projections, so tokens see their spatial neighbours.
#[derive(Debug, Clone)]
pub struct MixCfn {
    fc1: Linear,
    conv: MixConv2d,
    act: Activation,
    fc2: Linear,
    hidden: usize,
}

impl MixCfn {
    pub fn new(dim: usize, hidden: usize, act: Activation, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(dim, hidden, vb.pp("fc1"))?,
            conv: MixConv2d::depthwise(hidden, 3, vb.pp("conv"))?,
            act,
            fc2: linear(hidden, dim, vb.pp("fc2"))?,
            hidden,
        })
    }

    pub fn forward(&self, xs: &Tensor, h: usize, w: usize) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        if n != h * w {
            candle_core::bail!("Got {n} tokens for a {h}x{w} grid");
        }
        let xs = self
            .fc1
            .forward(xs)?
            .transpose(1, 2)?
            .reshape((b, self.hidden, h, w))?;
        let xs = self.act.forward(&self.conv.forward(&xs)?)?;
        let xs = xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        self.fc2.forward(&xs)
    }
}

/// One transformer block of a branch:
///
/// ```text
/// y   = x + attn(norm(x)) + shortcut(x)
/// out = y + ffn(norm(y))
/// ```
#[derive(Debug, Clone)]
pub struct HrvitBlock {
    attn_norm: LayerNorm,
    attn: CrossShapedAttention,
    des: LowRankShortcut,
    ffn_norm: LayerNorm,
    ffn: MixCfn,
}

impl HrvitBlock {
    pub fn new(cfg: &HrvitConfig, branch: usize, vb: VarBuilder) -> Result<Self> {
        cfg.validate().map_err(candle_core::Error::wrap)?;
        let Some(&dim) = cfg.channels.get(branch) else {
            candle_core::bail!(
                "Branch {branch} is out of range for {} branches",
                cfg.channels.len()
            );
        };
        Ok(Self {
            attn_norm: layer_norm(dim, cfg.layer_norm_eps, vb.pp("attn_norm"))?,
            attn: CrossShapedAttention::new(
                dim,
                dim,
                cfg.dim_head,
                cfg.ws_list[branch],
                cfg.batch_norm_eps,
                vb.pp("attn"),
            )?,
            des: LowRankShortcut::new(dim, dim, cfg.hidden_act, vb.pp("des"))?,
            ffn_norm: layer_norm(dim, cfg.layer_norm_eps, vb.pp("ffn_norm"))?,
            ffn: MixCfn::new(dim, cfg.mlp_hidden(branch), cfg.hidden_act, vb.pp("ffn"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor, h: usize, w: usize) -> Result<Tensor> {
        let residual = xs;
        let attn = self.attn.forward(&self.attn_norm.forward(xs)?, h, w)?;
        let shortcut = self.des.forward(residual)?;
        let xs = ((attn + shortcut)? + residual)?;

        let ffn = self.ffn.forward(&self.ffn_norm.forward(&xs)?, h, w)?;
        ffn + xs
    }
}
