use anyhow::Result;
use candle_core::{DType, Device};
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use hrvit_core::{parameter_counts, random_init, HrvitConfig, HrvitModel};

use crate::ModelArgs;

/// Per-branch row: stage, branch, stride, channels, window, blocks, heads, hidden.
fn branch_rows(cfg: &HrvitConfig) -> Vec<[usize; 8]> {
    let mut rows = Vec::new();
    for (stage, depths) in cfg.block_list.iter().enumerate() {
        for (branch, &blocks) in depths.iter().enumerate() {
            let half = cfg.channels[branch] / 2;
            let heads = (half / cfg.dim_head).max(1);
            rows.push([
                stage,
                branch,
                4 << branch,
                cfg.channels[branch],
                cfg.ws_list[branch],
                blocks,
                heads,
                cfg.mlp_hidden(branch),
            ]);
        }
    }
    rows
}

pub(crate) fn run(model_args: &ModelArgs, dtype: DType, device: &Device) -> Result<()> {
    let cfg = model_args.config()?;
    cfg.validate()?;

    let rows: Vec<Vec<CellStruct>> = branch_rows(&cfg)
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|v| v.cell().justify(Justify::Right))
                .collect()
        })
        .collect();
    let table = rows
        .table()
        .title(vec![
            "stage".cell().bold(true),
            "branch".cell().bold(true),
            "stride".cell().bold(true),
            "channels".cell().bold(true),
            "window".cell().bold(true),
            "blocks".cell().bold(true),
            "heads".cell().bold(true),
            "mlp hidden".cell().bold(true),
        ])
        .bold(true);
    print_stdout(table)?;

    // Counts come from the architecture, so random variables are enough.
    let (varmap, vb) = random_init(dtype, device);
    HrvitModel::new(&cfg, vb)?;
    let counts = parameter_counts(&varmap)?;
    let total = counts.values().sum::<usize>();
    let mut rows: Vec<Vec<CellStruct>> = counts
        .into_iter()
        .map(|(group, n)| vec![group.cell(), n.cell().justify(Justify::Right)])
        .collect();
    rows.push(vec![
        "total".cell().bold(true),
        total.cell().justify(Justify::Right).bold(true),
    ]);
    let table = rows
        .table()
        .title(vec!["module".cell().bold(true), "parameters".cell().bold(true)])
        .bold(true);
    print_stdout(table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b1_layout() {
        let rows = branch_rows(&HrvitConfig::b1());
        assert_eq!(rows.len(), 1 + 2 + 3 + 4);
        // Last stage, last branch: 1/32 resolution, 256 channels, 4 heads.
        assert_eq!(rows[9], [3, 3, 32, 256, 7, 2, 4, 1024]);
    }
}
