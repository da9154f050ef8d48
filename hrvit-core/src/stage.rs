use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, LayerNorm, Module, VarBuilder};
use tracing::debug;

use crate::{block::HrvitBlock, config::HrvitConfig, fusion::FusionBlock, layers::PatchEmbed};

/// One parallel branch of a stage: embed, transformer blocks, norm.
#[derive(Debug, Clone)]
struct Branch {
    patch_embed: PatchEmbed,
    blocks: Vec<HrvitBlock>,
    norm: LayerNorm,
}

impl Branch {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, _, _, _) = xs.dims4()?;
        let (mut tokens, h, w) = self.patch_embed.forward(xs)?;
        for block in &self.blocks {
            tokens = block.forward(&tokens, h, w)?;
        }
        let tokens = self.norm.forward(&tokens)?;
        let (_, _, c) = tokens.dims3()?;
        tokens.transpose(1, 2)?.reshape((b, c, h, w))
    }
}

/// Multi-resolution stage `index`: fuses its inputs into `index + 1`
/// branches and runs the branches in parallel.
#[derive(Debug, Clone)]
pub struct HrvitStage {
    fusion: FusionBlock,
    branches: Vec<Branch>,
    index: usize,
}

impl HrvitStage {
    pub fn new(cfg: &HrvitConfig, index: usize, vb: VarBuilder) -> Result<Self> {
        cfg.validate().map_err(candle_core::Error::wrap)?;
        if index >= cfg.num_stages() {
            candle_core::bail!(
                "Stage {index} is out of range for a {}-stage config",
                cfg.num_stages()
            );
        }
        let in_channels = if index == 0 {
            vec![cfg.stem_channels]
        } else {
            cfg.channels[..index].to_vec()
        };
        let out_channels = &cfg.channels[..=index];
        let fusion = FusionBlock::new(
            &in_channels,
            out_channels,
            cfg.hidden_act,
            cfg.batch_norm_eps,
            vb.pp("fusion"),
        )?;

        let mut branches = Vec::with_capacity(out_channels.len());
        for (i, &dim) in out_channels.iter().enumerate() {
            let vb_b = vb.pp("branches").pp(i);
            let blocks = (0..cfg.block_list[index][i])
                .map(|j| HrvitBlock::new(cfg, i, vb_b.pp(j)))
                .collect::<Result<Vec<_>>>()?;
            branches.push(Branch {
                patch_embed: PatchEmbed::new(
                    dim,
                    dim,
                    3,
                    cfg.layer_norm_eps,
                    vb.pp("patch_embed").pp(i),
                )?,
                blocks,
                norm: layer_norm(dim, cfg.layer_norm_eps, vb.pp("norm").pp(i))?,
            });
        }
        Ok(Self {
            fusion,
            branches,
            index,
        })
    }

    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    pub fn forward(&self, xs: &[Tensor]) -> Result<Vec<Tensor>> {
        let fused = self.fusion.forward(xs)?;
        let mut out = Vec::with_capacity(self.branches.len());
        for (i, (x, branch)) in fused.iter().zip(&self.branches).enumerate() {
            let y = branch.forward(x)?;
            debug!("stage {} branch {i}: {:?}", self.index, y.dims());
            out.push(y);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn stage_grows_one_branch() -> Result<()> {
        let cfg = HrvitConfig {
            stem_channels: 8,
            channels: vec![8, 16, 32],
            dim_head: 8,
            block_list: vec![vec![1], vec![1, 1], vec![1, 0, 2]],
            ws_list: vec![1, 2, 3],
            mlp_ratio_list: vec![2.0, 2.0, 2.0],
            ..HrvitConfig::b1()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let stage = HrvitStage::new(&cfg, 2, vb)?;
        assert_eq!(stage.num_branches(), 3);
        let xs = [
            Tensor::ones((2, 8, 10, 10), DType::F32, &Device::Cpu)?,
            Tensor::ones((2, 16, 5, 5), DType::F32, &Device::Cpu)?,
        ];
        let ys = stage.forward(&xs)?;
        let dims = ys.iter().map(|y| y.dims().to_vec()).collect::<Vec<_>>();
        assert_eq!(
            dims,
            vec![vec![2, 8, 10, 10], vec![2, 16, 5, 5], vec![2, 32, 3, 3]]
        );
        assert!(stage.forward(&xs[..1]).is_err());
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_stage() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(HrvitStage::new(&HrvitConfig::b1(), 4, vb.clone()).is_err());

        let mut cfg = HrvitConfig::b1();
        cfg.channels.pop();
        assert!(HrvitStage::new(&cfg, 3, vb).is_err());
    }
}
