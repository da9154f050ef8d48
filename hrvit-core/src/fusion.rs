use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::layers::{conv2d, Activation, ConvBn};

/// How input branch `j` reaches output branch `i`.
#[derive(Debug, Clone)]
enum FusePath {
    Identity,
    /// Channel projection at the same resolution.
    Project(ConvBn),
    /// Channel projection, then nearest upsampling to the target grid.
    Up(ConvBn),
    /// Strided depthwise conv, then channel projection.
    Down { dw: ConvBn, pw: ConvBn },
}

impl FusePath {
    fn forward(&self, xs: &Tensor, target: Option<(usize, usize)>) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(xs.clone()),
            Self::Project(proj) => proj.forward(xs),
            Self::Up(proj) => {
                let Some((h, w)) = target else {
                    candle_core::bail!("Upsampling path needs a target resolution");
                };
                proj.forward(xs)?.upsample_nearest2d(h, w)
            }
            Self::Down { dw, pw } => pw.forward(&dw.forward(xs)?),
        }
    }
}

/// Exchanges information between parallel branches.
///
/// Output `i` is the sum over inputs `j` of a resampled projection of branch
/// `j`, followed by the activation. Outputs beyond the last input branch are
/// new, lower-resolution branches built from downsampled inputs only.
#[derive(Debug, Clone)]
pub struct FusionBlock {
    paths: Vec<Vec<FusePath>>,
    in_channels: Vec<usize>,
    act: Activation,
}

impl FusionBlock {
    pub fn new(
        in_channels: &[usize],
        out_channels: &[usize],
        act: Activation,
        bn_eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if in_channels.is_empty() || out_channels.len() < in_channels.len() {
            candle_core::bail!(
                "Fusion cannot map {} branches to {}",
                in_channels.len(),
                out_channels.len()
            );
        }
        let mut paths = Vec::with_capacity(out_channels.len());
        for (i, &outc) in out_channels.iter().enumerate() {
            let vb_i = vb.pp("blocks").pp(i);
            let mut row = Vec::with_capacity(in_channels.len());
            for (j, &inc) in in_channels.iter().enumerate() {
                let vb_ij = vb_i.pp(j);
                let path = if i == j {
                    if inc == outc {
                        FusePath::Identity
                    } else {
                        let conv = conv2d(inc, outc, 1, 1, 0, 1, true, vb_ij.pp("0"))?;
                        FusePath::Project(ConvBn::new(conv, outc, bn_eps, vb_ij.pp("1"))?)
                    }
                } else if j > i {
                    let conv = conv2d(inc, outc, 1, 1, 0, 1, true, vb_ij.pp("0"))?;
                    FusePath::Up(ConvBn::new(conv, outc, bn_eps, vb_ij.pp("1"))?)
                } else {
                    let factor = 1usize << (i - j);
                    let dw = conv2d(
                        inc,
                        inc,
                        factor + 1,
                        factor,
                        factor / 2,
                        inc,
                        false,
                        vb_ij.pp("0"),
                    )?;
                    let pw = conv2d(inc, outc, 1, 1, 0, 1, true, vb_ij.pp("2"))?;
                    FusePath::Down {
                        dw: ConvBn::new(dw, inc, bn_eps, vb_ij.pp("1"))?,
                        pw: ConvBn::new(pw, outc, bn_eps, vb_ij.pp("3"))?,
                    }
                };
                row.push(path);
            }
            paths.push(row);
        }
        Ok(Self {
            paths,
            in_channels: in_channels.to_vec(),
            act,
        })
    }

    pub fn num_outputs(&self) -> usize {
        self.paths.len()
    }

    pub fn forward(&self, xs: &[Tensor]) -> Result<Vec<Tensor>> {
        if xs.len() != self.in_channels.len() {
            candle_core::bail!(
                "Fusion expected {} branches, got {}",
                self.in_channels.len(),
                xs.len()
            );
        }
        for (x, &c) in xs.iter().zip(&self.in_channels) {
            let (_, got, _, _) = x.dims4()?;
            if got != c {
                candle_core::bail!("Fusion branch expected {c} channels, got {got}");
            }
        }
        let mut out = Vec::with_capacity(self.paths.len());
        for (i, row) in self.paths.iter().enumerate() {
            let target = match xs.get(i) {
                Some(x) => {
                    let (_, _, h, w) = x.dims4()?;
                    Some((h, w))
                }
                None => None,
            };
            let mut acc: Option<Tensor> = None;
            for (path, x) in row.iter().zip(xs) {
                let y = path.forward(x, target)?;
                acc = Some(match acc {
                    Some(acc) => (acc + y)?,
                    None => y,
                });
            }
            match acc {
                Some(acc) => out.push(self.act.forward(&acc)?),
                None => candle_core::bail!("Fusion output {i} has no inputs"),
            }
        }
        Ok(out)
    }
}
