use candle_core::{Result, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use super::Activation;
use crate::config::ConfigError;

/// Near-square power-of-two factorization of `n`.
///
/// With `e = floor(log2 n)` this returns `(2^(e/2), 2^(e - e/2))`.
pub fn decompose(n: usize) -> std::result::Result<(usize, usize), ConfigError> {
    if n == 0 || n % 2 != 0 {
        return Err(ConfigError::OddChannels {
            field: "shortcut features",
            value: n,
        });
    }
    let e = n.ilog2();
    Ok((1 << (e / 2), 1 << (e - e / 2)))
}

/// Diversity-enhanced shortcut: a dense `in -> out` channel transform
/// replaced by two small projections over a `(k, p)` view of the channels.
///
/// Costs `p^2 + k_in * k_out` weights instead of `in * out`.
#[derive(Debug, Clone)]
pub struct LowRankShortcut {
    proj_right: Linear,
    proj_left: Linear,
    act: Activation,
    p: usize,
    k_in: usize,
    k_out: usize,
}

impl LowRankShortcut {
    /// Returns `(p, k_in, k_out)` for a shortcut from `in_features` to
    /// `out_features`.
    pub fn factorize(
        in_features: usize,
        out_features: usize,
    ) -> std::result::Result<(usize, usize, usize), ConfigError> {
        let (_, p) = decompose(in_features.min(out_features))?;
        for features in [in_features, out_features] {
            if features % p != 0 {
                return Err(ConfigError::Factorization { features, p });
            }
        }
        Ok((p, in_features / p, out_features / p))
    }

    pub fn new(
        in_features: usize,
        out_features: usize,
        act: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (p, k_in, k_out) =
            Self::factorize(in_features, out_features).map_err(candle_core::Error::wrap)?;
        Ok(Self {
            proj_right: linear(p, p, vb.pp("proj_right"))?,
            proj_left: linear(k_in, k_out, vb.pp("proj_left"))?,
            act,
            p,
            k_in,
            k_out,
        })
    }

    pub fn num_parameters(&self) -> usize {
        self.p * self.p + self.p + self.k_in * self.k_out + self.k_out
    }
}

impl Module for LowRankShortcut {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dims = xs.dims().to_vec();
        let Some((&features, lead)) = dims.split_last() else {
            candle_core::bail!("LowRankShortcut expects at least one dimension");
        };
        if features != self.k_in * self.p {
            candle_core::bail!(
                "LowRankShortcut expected {} features, got {features}",
                self.k_in * self.p
            );
        }
        let rows: usize = lead.iter().product();
        let xs = xs.reshape((rows, self.k_in, self.p))?;
        let xs = self
            .proj_right
            .forward(&xs)?
            .transpose(D::Minus1, D::Minus2)?
            .contiguous()?;
        let xs = self.act.forward(&xs)?;
        let xs = self
            .proj_left
            .forward(&xs)?
            .transpose(D::Minus1, D::Minus2)?
            .contiguous()?;
        let mut out_dims = lead.to_vec();
        out_dims.push(self.k_out * self.p);
        xs.reshape(out_dims)
    }
}
