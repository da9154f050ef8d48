#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

use std::{fs, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{layers::Activation, layers::LowRankShortcut, serde_default_fn};

serde_default_fn!(usize, d_num_channels, 3);
serde_default_fn!(usize, d_stem_channels, 64);
serde_default_fn!(usize, d_dim_head, 32);
serde_default_fn!(usize, d_num_classes, 1000);
serde_default_fn!(Activation, d_hidden_act, Activation::Gelu);
serde_default_fn!(f64, d_layer_norm_eps, 1e-5);
serde_default_fn!(f64, d_batch_norm_eps, 1e-5);
serde_default_fn!(usize, d_image_size, 224);
serde_default_fn!(Vec<f64>, d_image_mean, vec![0.485, 0.456, 0.406]);
serde_default_fn!(Vec<f64>, d_image_std, vec![0.229, 0.224, 0.225]);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("`channels` must name at least one branch.")]
    EmptyChannels,
    #[error("`{field}` has {got} entries, expected {expected}.")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Stage {stage} lists {got} branch depths, expected {expected}.")]
    BranchCount {
        stage: usize,
        expected: usize,
        got: usize,
    },
    #[error("`{field}` must be a non-zero multiple of 2, got {value}.")]
    OddChannels { field: &'static str, value: usize },
    #[error("`{0}` must be non-zero.")]
    Zero(&'static str),
    #[error("Window size of branch {0} must be at least 1.")]
    WindowSize(usize),
    #[error("Cannot split {channels} channels into heads of width {dim_head}.")]
    HeadSplit { channels: usize, dim_head: usize },
    #[error("Cannot factor {features} features into blocks of {p}.")]
    Factorization { features: usize, p: usize },
    #[error("Branch {branch} has a feed-forward width of {hidden}, needs an even width of at least 2.")]
    MlpHidden { branch: usize, hidden: usize },
}

/// HRViT hyperparameters, as found in a `config.json`.
///
/// Stage `s` runs `s + 1` parallel branches, so it uses the first `s + 1`
/// entries of `channels`, `ws_list` and `mlp_ratio_list` and the depths in
/// `block_list[s]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrvitConfig {
    #[serde(default = "d_num_channels")]
    pub num_channels: usize,
    #[serde(default = "d_stem_channels")]
    pub stem_channels: usize,
    pub channels: Vec<usize>,
    #[serde(default = "d_dim_head")]
    pub dim_head: usize,
    pub block_list: Vec<Vec<usize>>,
    pub ws_list: Vec<usize>,
    pub mlp_ratio_list: Vec<f64>,
    #[serde(default = "d_num_classes")]
    pub num_classes: usize,
    #[serde(default = "d_hidden_act")]
    pub hidden_act: Activation,
    #[serde(default = "d_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "d_batch_norm_eps")]
    pub batch_norm_eps: f64,
    #[serde(default = "d_image_size")]
    pub image_size: usize,
    #[serde(default = "d_image_mean")]
    pub image_mean: Vec<f64>,
    #[serde(default = "d_image_std")]
    pub image_std: Vec<f64>,
    #[serde(default)]
    pub id2label: Option<IndexMap<usize, String>>,
}

impl HrvitConfig {
    pub fn b1() -> Self {
        Self {
            num_channels: d_num_channels(),
            stem_channels: 64,
            channels: vec![32, 64, 128, 256],
            dim_head: 32,
            block_list: vec![vec![1], vec![1, 1], vec![1, 1, 6], vec![1, 1, 6, 2]],
            ws_list: vec![1, 2, 7, 7],
            mlp_ratio_list: vec![4.0, 4.0, 4.0, 4.0],
            num_classes: d_num_classes(),
            hidden_act: d_hidden_act(),
            layer_norm_eps: d_layer_norm_eps(),
            batch_norm_eps: d_batch_norm_eps(),
            image_size: d_image_size(),
            image_mean: d_image_mean(),
            image_std: d_image_std(),
            id2label: None,
        }
    }

    pub fn b2() -> Self {
        Self {
            channels: vec![64, 128, 256, 512],
            block_list: vec![vec![1], vec![2, 2], vec![2, 2, 6], vec![2, 2, 6, 2]],
            mlp_ratio_list: vec![2.0, 3.0, 3.0, 3.0],
            ..Self::b1()
        }
    }

    pub fn b3() -> Self {
        Self {
            channels: vec![64, 128, 256, 512],
            block_list: vec![vec![2], vec![2, 2], vec![3, 3, 6], vec![3, 3, 6, 4]],
            mlp_ratio_list: vec![2.0, 2.0, 2.0, 2.0],
            ..Self::b1()
        }
    }

    pub fn from_preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "b1" => Some(Self::b1()),
            "b2" => Some(Self::b2()),
            "b3" => Some(Self::b3()),
            _ => None,
        }
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Read and validate a JSON config.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn num_stages(&self) -> usize {
        self.block_list.len()
    }

    /// Width of the hidden layer of the feed-forward block on `branch`.
    pub fn mlp_hidden(&self, branch: usize) -> usize {
        (self.channels[branch] as f64 * self.mlp_ratio_list[branch]).round() as usize
    }

    /// Feature width of the classification head input.
    pub fn head_features(&self) -> usize {
        self.channels.iter().sum()
    }

    pub fn label(&self, idx: usize) -> String {
        self.id2label
            .as_ref()
            .and_then(|labels| labels.get(&idx).cloned())
            .unwrap_or_else(|| format!("class_{idx}"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.channels.len();
        if n == 0 {
            return Err(ConfigError::EmptyChannels);
        }
        for (field, got) in [
            ("block_list", self.block_list.len()),
            ("ws_list", self.ws_list.len()),
            ("mlp_ratio_list", self.mlp_ratio_list.len()),
        ] {
            if got != n {
                return Err(ConfigError::LengthMismatch {
                    field,
                    expected: n,
                    got,
                });
            }
        }
        for (stage, depths) in self.block_list.iter().enumerate() {
            if depths.len() != stage + 1 {
                return Err(ConfigError::BranchCount {
                    stage,
                    expected: stage + 1,
                    got: depths.len(),
                });
            }
        }
        if self.num_channels == 0 {
            return Err(ConfigError::Zero("num_channels"));
        }
        for (field, got) in [
            ("image_mean", self.image_mean.len()),
            ("image_std", self.image_std.len()),
        ] {
            if got != self.num_channels {
                return Err(ConfigError::LengthMismatch {
                    field,
                    expected: self.num_channels,
                    got,
                });
            }
        }
        if self.num_classes == 0 {
            return Err(ConfigError::Zero("num_classes"));
        }
        if self.dim_head == 0 {
            return Err(ConfigError::Zero("dim_head"));
        }
        if self.stem_channels == 0 || self.stem_channels % 2 != 0 {
            return Err(ConfigError::OddChannels {
                field: "stem_channels",
                value: self.stem_channels,
            });
        }
        for (branch, &c) in self.channels.iter().enumerate() {
            if c == 0 || c % 2 != 0 {
                return Err(ConfigError::OddChannels {
                    field: "channels",
                    value: c,
                });
            }
            if self.ws_list[branch] == 0 {
                return Err(ConfigError::WindowSize(branch));
            }
            let half = c / 2;
            let heads = (half / self.dim_head).max(1);
            if half % heads != 0 {
                return Err(ConfigError::HeadSplit {
                    channels: half,
                    dim_head: self.dim_head,
                });
            }
            LowRankShortcut::factorize(c, c)?;
            let hidden = self.mlp_hidden(branch);
            if hidden < 2 || hidden % 2 != 0 {
                return Err(ConfigError::MlpHidden { branch, hidden });
            }
        }
        Ok(())
    }
}
