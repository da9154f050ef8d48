use std::path::PathBuf;

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use clap::{Args as ClapArgs, Parser, Subcommand};
use hrvit_core::{
    from_mmaped_safetensors, initialize_logging, once_log_info, random_init, HrvitConfig,
    HrvitModel, ModelDType, TryIntoDType,
};
use tracing::{info, warn};

mod bench;
mod classify;
mod summary;

#[derive(ClapArgs, Clone)]
struct ModelArgs {
    /// Path to a `config.json` describing the model.
    #[arg(short, long, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Built-in architecture to use when no config is given: b1, b2 or b3.
    #[arg(short, long, default_value = "b1")]
    preset: String,

    /// Number of classes, overriding the config or preset.
    #[arg(long)]
    num_classes: Option<usize>,

    /// Safetensors file to load, repeat for sharded checkpoints. Without
    /// weights the model is randomly initialized.
    #[arg(short, long)]
    weights: Vec<PathBuf>,
}

impl ModelArgs {
    fn config(&self) -> Result<HrvitConfig> {
        let cfg = match &self.config {
            Some(path) => HrvitConfig::from_file(path)?,
            None => match HrvitConfig::from_preset(&self.preset) {
                Some(cfg) => cfg,
                None => anyhow::bail!("Unknown preset `{}`, expected b1, b2 or b3.", self.preset),
            },
        };
        Ok(match self.num_classes {
            Some(n) => cfg.with_num_classes(n),
            None => cfg,
        })
    }

    fn load(&self, cfg: &HrvitConfig, dtype: DType, device: &Device) -> Result<HrvitModel> {
        let vb: VarBuilder = if self.weights.is_empty() {
            warn!("No weights given, using random initialization.");
            random_init(dtype, device).1
        } else {
            info!("Loading {} weight file(s).", self.weights.len());
            from_mmaped_safetensors(self.weights.clone(), dtype, device, false)?
        };
        Ok(HrvitModel::new(cfg, vb)?)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Classify images and print the most likely labels.
    Classify {
        #[command(flatten)]
        model: ModelArgs,

        /// Number of labels to show per image.
        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,

        /// Images to classify.
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Print the branch layout and parameter counts of a model.
    Summary {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Time forward passes on random input.
    Bench {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(short, long, default_value_t = 1)]
        batch_size: usize,

        /// Height and width of the random input. Defaults to the config's image size.
        #[arg(short, long)]
        image_size: Option<usize>,

        /// Number of timed forward passes.
        #[arg(short, long, default_value_t = 10)]
        repetitions: usize,
    },
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Run on the CPU even if an accelerator is available.
    #[arg(long, global = true)]
    cpu: bool,

    /// Model data type: auto, bf16, f16 or f32.
    #[arg(short, long, global = true, default_value_t = ModelDType::Auto)]
    dtype: ModelDType,

    /// Integer seed to ensure reproducible random number generation.
    #[arg(short, long, global = true)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging();

    #[cfg(feature = "metal")]
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::new_metal(0)?
    };
    #[cfg(not(feature = "metal"))]
    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };

    if let Some(seed) = args.seed {
        device.set_seed(seed)?;
    }
    let dtype = args.dtype.try_into_dtype(&device)?;
    once_log_info(format!("Running on {device:?}."));

    match args.command {
        Command::Classify {
            model,
            top_k,
            images,
        } => classify::run(&model, top_k, &images, dtype, &device),
        Command::Summary { model } => summary::run(&model, dtype, &device),
        Command::Bench {
            model,
            batch_size,
            image_size,
            repetitions,
        } => bench::run(&model, batch_size, image_size, repetitions, dtype, &device),
    }
}
