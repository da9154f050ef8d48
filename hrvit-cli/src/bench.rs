use std::{fmt::Display, time::Instant};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use cli_table::{format::Justify, print_stdout, Cell, Style, Table};
use tracing::info;

use crate::ModelArgs;

struct Uncertain {
    mean: f64,
    std_dev: f64,
}

impl Display for Uncertain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}±{:.3}", self.mean, self.std_dev)
    }
}

#[allow(clippy::cast_precision_loss)]
fn uncertainty(measurements: &[f64]) -> Uncertain {
    let n = measurements.len().max(1) as f64;
    let mean = measurements.iter().sum::<f64>() / n;
    let variance = measurements
        .iter()
        .map(|e| (mean - e).powf(2.))
        .sum::<f64>()
        / n;
    Uncertain {
        mean,
        std_dev: variance.sqrt(),
    }
}

fn backend(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn run(
    model_args: &ModelArgs,
    batch_size: usize,
    image_size: Option<usize>,
    repetitions: usize,
    dtype: DType,
    device: &Device,
) -> Result<()> {
    if batch_size == 0 || repetitions == 0 {
        anyhow::bail!("`batch_size` and `repetitions` must be at least 1.");
    }
    let cfg = model_args.config()?;
    let model = model_args.load(&cfg, dtype, device)?;
    let size = image_size.unwrap_or(cfg.image_size);
    let shape = (batch_size, cfg.num_channels, size, size);
    let pixels = Tensor::randn(0f32, 1f32, shape, device)?.to_dtype(dtype)?;

    info!("Warming up.");
    model.forward(&pixels)?;
    device.synchronize()?;

    let mut ms = Vec::with_capacity(repetitions);
    for _ in 0..repetitions {
        let start = Instant::now();
        model.forward(&pixels)?;
        device.synchronize()?;
        ms.push(start.elapsed().as_secs_f64() * 1000.);
    }

    let ms_batch = uncertainty(&ms);
    let images_s = uncertainty(
        &ms.iter()
            .map(|t| batch_size as f64 * 1000. / t)
            .collect::<Vec<_>>(),
    );
    let rows = vec![vec![
        backend(device).cell(),
        format!("{dtype:?}").cell(),
        batch_size.cell().justify(Justify::Right),
        format!("{size}x{size}").cell().justify(Justify::Right),
        ms_batch.cell().justify(Justify::Right),
        images_s.cell().justify(Justify::Right),
    ]];
    let table = rows
        .table()
        .title(vec![
            "backend".cell().bold(true),
            "dtype".cell().bold(true),
            "batch".cell().bold(true),
            "input".cell().bold(true),
            "ms/batch".cell().bold(true),
            "images/s".cell().bold(true),
        ])
        .bold(true);
    print_stdout(table)?;
    Ok(())
}
