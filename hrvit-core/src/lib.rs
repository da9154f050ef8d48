#![deny(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

//! High-resolution vision transformer (HRViT) for image classification.
//!
//! A stem takes the image to 1/4 resolution. Each following stage fuses the
//! previous branches, adds one branch at half the lowest resolution, and runs
//! cross-shaped window attention blocks on every branch in parallel.

mod attention;
mod block;
mod config;
mod fusion;
pub mod layers;
mod model;
mod stage;
mod utils;

pub use attention::{cross_shaped_attention, window_mask, CrossShapedAttention, StripAxis};
pub use block::{HrvitBlock, MixCfn};
pub use config::{ConfigError, HrvitConfig};
pub use fusion::FusionBlock;
pub use model::HrvitModel;
pub use stage::HrvitStage;
pub use utils::log::{initialize_logging, once_log_info};
pub use utils::normal::{DTypeParseError, ModelDType, TryIntoDType};
pub use utils::varbuilder_utils::{
    from_mmaped_safetensors, group_parameter_counts, load_safetensors, parameter_counts,
    random_init,
};
