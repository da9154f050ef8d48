use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Module, VarBuilder};

use super::conv2d;

/// Two convolutions with different kernel sizes applied to the two halves of
/// the channel axis. The second half uses a kernel two wider than the first.
///
/// When `groups == in_channels == out_channels` this is a mixed-kernel
/// depthwise conv. Halves are split as `c / 2` and `c - c / 2`.
#[derive(Debug, Clone)]
pub struct MixConv2d {
    conv_3: Conv2d,
    conv_5: Conv2d,
    in_channels: usize,
    split: usize,
}

impl MixConv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if in_channels < 2 || out_channels < 2 || groups < 2 {
            candle_core::bail!(
                "MixConv2d needs at least 2 channels and groups per side, got in={in_channels} out={out_channels} groups={groups}"
            );
        }
        let split = in_channels / 2;
        let padding = kernel_size / 2;
        let conv_3 = conv2d(
            split,
            out_channels / 2,
            kernel_size,
            stride,
            padding,
            groups / 2,
            bias,
            vb.pp("conv_3"),
        )?;
        let conv_5 = conv2d(
            in_channels - split,
            out_channels - out_channels / 2,
            kernel_size + 2,
            stride,
            padding + 1,
            groups - groups / 2,
            bias,
            vb.pp("conv_5"),
        )?;
        Ok(Self {
            conv_3,
            conv_5,
            in_channels,
            split,
        })
    }

    /// Depthwise variant used inside the feed-forward block.
    pub fn depthwise(channels: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        Self::new(channels, channels, kernel_size, 1, channels, true, vb)
    }
}

impl Module for MixConv2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, c, _h, _w) = xs.dims4()?;
        if c != self.in_channels {
            candle_core::bail!("MixConv2d expected {} channels, got {c}", self.in_channels);
        }
        let lhs = xs.narrow(1, 0, self.split)?.contiguous()?;
        let rhs = xs.narrow(1, self.split, c - self.split)?.contiguous()?;
        Tensor::cat(&[self.conv_3.forward(&lhs)?, self.conv_5.forward(&rhs)?], 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn keeps_spatial_size() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let conv = MixConv2d::depthwise(12, 3, vb)?;
        let xs = Tensor::ones((2, 12, 7, 5), DType::F32, &Device::Cpu)?;
        assert_eq!(conv.forward(&xs)?.dims(), &[2, 12, 7, 5]);
        Ok(())
    }

    #[test]
    fn odd_channel_split() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = MixConv2d::depthwise(7, 3, vb)?;
        // 3 channels with the 3x3 kernel, 4 with the 5x5 kernel
        let shapes = {
            let data = varmap.data().lock().unwrap();
            let mut shapes = data
                .iter()
                .filter(|(k, _)| k.ends_with("weight"))
                .map(|(k, v)| (k.clone(), v.dims().to_vec()))
                .collect::<Vec<_>>();
            shapes.sort();
            shapes
        };
        assert_eq!(
            shapes,
            vec![
                ("conv_3.weight".to_string(), vec![3, 1, 3, 3]),
                ("conv_5.weight".to_string(), vec![4, 1, 5, 5]),
            ]
        );
        let xs = Tensor::ones((1, 7, 6, 6), DType::F32, &Device::Cpu)?;
        assert_eq!(conv.forward(&xs)?.dims(), &[1, 7, 6, 6]);
        Ok(())
    }

    #[test]
    fn halves_are_independent() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = MixConv2d::depthwise(4, 3, vb)?;
        let base = Tensor::randn(0f32, 1f32, (1, 4, 5, 5), &Device::Cpu)?;
        let bumped = Tensor::cat(
            &[
                base.narrow(1, 0, 2)?,
                (base.narrow(1, 2, 2)? + 1.0)?,
            ],
            1,
        )?;
        let lhs_a = conv.forward(&base)?.narrow(1, 0, 2)?;
        let lhs_b = conv.forward(&bumped)?.narrow(1, 0, 2)?;
        let diff = (lhs_a - lhs_b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn rejects_wrong_channels() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let conv = MixConv2d::depthwise(8, 3, vb)?;
        let xs = Tensor::ones((1, 6, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(conv.forward(&xs).is_err());
        Ok(())
    }
}
