#![allow(clippy::cast_precision_loss)]

//! Cross-shaped window attention.
//!
//! Half of the channels attend within horizontal strips of `ws` rows, the
//! other half within vertical strips of `ws` columns. Strips that run past
//! the edge of the map are zero-padded and the padding is masked out before
//! the softmax.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, Conv2d, Linear, Module, ModuleT, VarBuilder};

use crate::layers::{depthwise_conv2d, hard_swish};

const MASK_FILL: f32 = -100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripAxis {
    Horizontal,
    Vertical,
}

/// Additive mask for the last strip: `0` on the leading `valid x valid`
/// block, `-100` everywhere else.
pub fn window_mask(valid: usize, len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let data = (0..len)
        .flat_map(|r| (0..len).map(move |c| if r < valid && c < valid { 0f32 } else { MASK_FILL }))
        .collect::<Vec<_>>();
    Tensor::from_vec(data, (len, len), device)?.to_dtype(dtype)
}

/// Strip attention over spatial maps.
///
/// `q`, `k` and `v` are (b, h, w, c). Returns tokens (b, h*w, c) in row-major
/// order. `c` is split into `heads` heads.
pub fn cross_shaped_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    ws: usize,
    heads: usize,
    scale: f64,
    axis: StripAxis,
) -> Result<Tensor> {
    let (b, h, w, c) = q.dims4()?;
    if k.dims4()? != (b, h, w, c) || v.dims4()? != (b, h, w, c) {
        candle_core::bail!(
            "q, k and v must share a shape, got {:?}, {:?} and {:?}",
            q.dims(),
            k.dims(),
            v.dims()
        );
    }
    if ws == 0 || heads == 0 || c % heads != 0 {
        candle_core::bail!("Cannot split {c} channels into {heads} heads with window {ws}");
    }
    let dh = c / heads;

    // `extent` is the axis cut into strips, `across` runs along each strip.
    let (extent, across, pad_dim) = match axis {
        StripAxis::Horizontal => (h, w, 1),
        StripAxis::Vertical => (w, h, 2),
    };
    let padded = extent.div_ceil(ws) * ws;
    let n_win = padded / ws;
    let len = ws * across;

    let to_windows = |t: &Tensor| -> Result<Tensor> {
        let t = t.pad_with_zeros(pad_dim, 0, padded - extent)?;
        let t = match axis {
            StripAxis::Horizontal => t
                .reshape((b, n_win, ws, w, heads, dh))?
                .permute((0, 1, 4, 2, 3, 5))?,
            StripAxis::Vertical => t
                .reshape((b, h, n_win, ws, heads, dh))?
                .permute((0, 2, 4, 3, 1, 5))?,
        };
        t.reshape((b * n_win * heads, len, dh))
    };
    let q = to_windows(q)?;
    let k = to_windows(k)?;
    let v = to_windows(v)?;

    let mut attn = (q.matmul(&k.t()?)? * scale)?;
    if padded != extent {
        let valid = (extent - (n_win - 1) * ws) * across;
        let mask = window_mask(valid, len, attn.dtype(), attn.device())?;
        let attn5 = attn.reshape((b, n_win, heads, len, len))?;
        let last = attn5.narrow(1, n_win - 1, 1)?.broadcast_add(&mask)?;
        let attn5 = if n_win > 1 {
            Tensor::cat(&[attn5.narrow(1, 0, n_win - 1)?, last], 1)?
        } else {
            last
        };
        attn = attn5.reshape((b * n_win * heads, len, len))?;
    }
    let attn = candle_nn::ops::softmax_last_dim(&attn)?;
    let out = attn.matmul(&v)?;

    let out = match axis {
        StripAxis::Horizontal => out
            .reshape((b, n_win, heads, ws, w, dh))?
            .permute((0, 1, 3, 4, 2, 5))?
            .reshape((b, padded, w, c))?
            .narrow(1, 0, h)?,
        StripAxis::Vertical => out
            .reshape((b, n_win, heads, ws, h, dh))?
            .permute((0, 4, 1, 3, 2, 5))?
            .reshape((b, h, padded, c))?
            .narrow(2, 0, w)?,
    };
    out.reshape((b, h * w, c))
}

/// Head count and softmax scale for one half of the channels.
fn half_heads(channels: usize, dim_head: usize) -> (usize, f64) {
    if channels < dim_head {
        (1, (channels as f64).powf(-0.5))
    } else {
        (channels / dim_head, (dim_head as f64).powf(-0.5))
    }
}

/// Token mixer of an HRViT block.
///
/// Queries and keys share one projection. A depthwise conv over the values
/// runs in parallel with the strip attention and the two are summed.
#[derive(Debug, Clone)]
pub struct CrossShapedAttention {
    to_qkv: Linear,
    to_out: Linear,
    attn_bn: BatchNorm,
    parallel_conv: Conv2d,
    dim: usize,
    ws: usize,
    heads: (usize, usize),
    scales: (f64, f64),
}

impl CrossShapedAttention {
    pub fn new(
        in_dim: usize,
        dim: usize,
        dim_head: usize,
        ws: usize,
        bn_eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if dim < 2 || dim % 2 != 0 {
            candle_core::bail!("Attention width must be even, got {dim}");
        }
        let half = dim / 2;
        let (heads_h, scale_h) = half_heads(half, dim_head);
        let (heads_v, scale_v) = half_heads(dim - half, dim_head);
        Ok(Self {
            to_qkv: linear(in_dim, 2 * dim, vb.pp("to_qkv"))?,
            to_out: linear(dim, dim, vb.pp("to_out.0"))?,
            attn_bn: batch_norm(dim, bn_eps, vb.pp("attn_bn"))?,
            parallel_conv: depthwise_conv2d(dim, 3, 1, true, vb.pp("parallel_conv.1"))?,
            dim,
            ws,
            heads: (heads_h, heads_v),
            scales: (scale_h, scale_v),
        })
    }

    pub fn heads(&self) -> (usize, usize) {
        self.heads
    }

    /// Tokens (b, h*w, in_dim) to tokens (b, h*w, dim).
    pub fn forward(&self, xs: &Tensor, h: usize, w: usize) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        if n != h * w {
            candle_core::bail!("Got {n} tokens for a {h}x{w} grid");
        }
        let qv = self.to_qkv.forward(xs)?;
        let q = qv.narrow(2, 0, self.dim)?.reshape((b, h, w, self.dim))?;
        let v = qv.narrow(2, self.dim, self.dim)?.reshape((b, h, w, self.dim))?;

        let v_map = hard_swish(&v.permute((0, 3, 1, 2))?.contiguous()?)?;
        let v_conv = self
            .parallel_conv
            .forward(&v_map)?
            .flatten_from(2)?
            .transpose(1, 2)?;

        let half = self.dim / 2;
        let rest = self.dim - half;
        let q_h = q.narrow(3, 0, half)?;
        let q_v = q.narrow(3, half, rest)?;
        let v_h = v.narrow(3, 0, half)?;
        let v_v = v.narrow(3, half, rest)?;
        let x_h = cross_shaped_attention(
            &q_h,
            &q_h,
            &v_h,
            self.ws,
            self.heads.0,
            self.scales.0,
            StripAxis::Horizontal,
        )?;
        let x_v = cross_shaped_attention(
            &q_v,
            &q_v,
            &v_v,
            self.ws,
            self.heads.1,
            self.scales.1,
            StripAxis::Vertical,
        )?;

        let attn = (Tensor::cat(&[x_h, x_v], 2)? + v_conv)?;
        let attn = self.to_out.forward(&hard_swish(&attn)?)?;
        self.attn_bn
            .forward_t(&attn.reshape((b * n, self.dim))?, false)?
            .reshape((b, n, self.dim))
    }
}
