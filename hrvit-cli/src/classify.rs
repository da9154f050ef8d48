use std::path::PathBuf;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use hrvit_vision::preprocess;
use tracing::info;

use crate::ModelArgs;

/// Indices and values of the `k` largest entries, largest first.
fn top_k(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked = probs.iter().copied().enumerate().collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

pub(crate) fn run(
    model_args: &ModelArgs,
    k: usize,
    images: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<()> {
    if k == 0 {
        anyhow::bail!("`top_k` must be at least 1.");
    }
    let cfg = model_args.config()?;
    let model = model_args.load(&cfg, dtype, device)?;

    let mut batch = Vec::with_capacity(images.len());
    for path in images {
        let image = image::open(path)?;
        batch.push(preprocess(
            &image,
            cfg.image_size,
            &cfg.image_mean,
            &cfg.image_std,
            device,
        )?);
    }
    let pixels = Tensor::stack(&batch, 0)?.to_dtype(dtype)?;
    info!("Classifying {} image(s) at {}px.", images.len(), cfg.image_size);

    let logits = model.forward(&pixels)?;
    let probs = candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?;
    let probs = probs.to_vec2::<f32>()?;

    for (path, probs) in images.iter().zip(probs) {
        let rows: Vec<Vec<CellStruct>> = top_k(&probs, k)
            .into_iter()
            .map(|(idx, p)| {
                vec![
                    idx.cell().justify(Justify::Right),
                    cfg.label(idx).cell(),
                    format!("{:.4}", p).cell().justify(Justify::Right),
                ]
            })
            .collect();
        println!("{}", path.display());
        let table = rows
            .table()
            .title(vec![
                "class".cell().bold(true),
                "label".cell().bold(true),
                "probability".cell().bold(true),
            ])
            .bold(true);
        print_stdout(table)?;
    }
    Ok(())
}
