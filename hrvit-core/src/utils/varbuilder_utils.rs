//! Utilities for creating a VarBuilder from safetensors checkpoints or from
//! freshly initialized variables.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    thread,
};

use candle_core::{safetensors::MmapedSafetensors, DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tqdm::Iter;
use tracing::info;

/// Prefix added by data-parallel training wrappers.
const DDP_PREFIX: &str = "module.";

fn load_one(
    path: PathBuf,
    silent: bool,
    device: Device,
    dtype: DType,
) -> Result<HashMap<String, Tensor>> {
    let mut accum = HashMap::new();
    let tensors = unsafe { MmapedSafetensors::new(&path)? };
    let names = tensors.tensors().into_iter().map(|(name, _)| name);
    let names: Box<dyn Iterator<Item = String>> = if silent {
        Box::new(names)
    } else {
        Box::new(names.tqdm())
    };
    for name in names {
        let new_name = name.strip_prefix(DDP_PREFIX).unwrap_or(&name).to_string();
        let tensor = tensors.load(&name, &device)?.to_dtype(dtype)?;
        accum.insert(new_name, tensor);
    }
    Ok(accum)
}

/// Load every tensor of `paths`, one thread per file.
/// Set `silent` to not show a progress bar.
pub fn load_safetensors(
    paths: Vec<PathBuf>,
    dtype: DType,
    device: &Device,
    silent: bool,
) -> Result<HashMap<String, Tensor>> {
    let handles = paths
        .into_iter()
        .map(|path| {
            let device = device.clone();
            thread::spawn(move || load_one(path, silent, device, dtype))
        })
        .collect::<Vec<_>>();
    let mut ws = HashMap::new();
    for h in handles {
        let loaded = h
            .join()
            .map_err(|_| candle_core::Error::Msg("weight loading thread panicked".to_string()))??;
        ws.extend(loaded);
    }
    info!("Loaded {} tensors.", ws.len());
    Ok(ws)
}

/// Load tensors into a VarBuilder using MmapedSafetensors.
pub fn from_mmaped_safetensors<'a>(
    paths: Vec<PathBuf>,
    dtype: DType,
    device: &Device,
    silent: bool,
) -> Result<VarBuilder<'a>> {
    let ws = load_safetensors(paths, dtype, device, silent)?;
    Ok(VarBuilder::from_tensors(ws, dtype, device))
}

/// A VarBuilder whose variables are created on first use with the default
/// initializers of each layer.
pub fn random_init<'a>(dtype: DType, device: &Device) -> (VarMap, VarBuilder<'a>) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    (varmap, vb)
}

/// Top-level group of a parameter: `features.{s}` for stages, otherwise the
/// first path component.
fn parameter_group(name: &str) -> String {
    let mut parts = name.split('.');
    match (parts.next(), parts.next()) {
        (Some("features"), Some(stage)) => format!("features.{stage}"),
        (Some(first), _) => first.to_string(),
        (None, _) => String::new(),
    }
}

/// Sum element counts per top-level group.
pub fn group_parameter_counts<'a, I>(params: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = (&'a str, usize)>,
{
    let mut counts = BTreeMap::new();
    for (name, n) in params {
        *counts.entry(parameter_group(name)).or_insert(0) += n;
    }
    counts
}

/// Parameter counts of an initialized VarMap, grouped per top-level module.
pub fn parameter_counts(varmap: &VarMap) -> Result<BTreeMap<String, usize>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("VarMap lock poisoned".to_string()))?;
    Ok(group_parameter_counts(
        data.iter().map(|(k, v)| (k.as_str(), v.elem_count())),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::linear;

    #[test]
    fn groups_by_stage() {
        let counts = group_parameter_counts([
            ("stem.conv1.weight", 10),
            ("stem.conv1.bias", 2),
            ("features.0.fusion.blocks.0.0.0.weight", 5),
            ("features.0.norm.0.weight", 1),
            ("features.1.norm.1.bias", 3),
            ("head.fc.weight", 7),
        ]);
        let counts = counts.into_iter().collect::<Vec<_>>();
        assert_eq!(
            counts,
            vec![
                ("features.0".to_string(), 6),
                ("features.1".to_string(), 3),
                ("head".to_string(), 7),
                ("stem".to_string(), 12),
            ]
        );
    }

    #[test]
    fn counts_random_init() -> Result<()> {
        let (varmap, vb) = random_init(DType::F32, &Device::Cpu);
        linear(4, 3, vb.pp("head").pp("fc"))?;
        let counts = parameter_counts(&varmap)?;
        assert_eq!(counts.get("head"), Some(&15));
        Ok(())
    }

    #[test]
    fn reads_written_safetensors() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("hrvit-vb-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("model.safetensors");
        let w = Tensor::arange(0f32, 6., &Device::Cpu)?.reshape((2, 3))?;
        candle_core::safetensors::save(
            &HashMap::from([("module.head.fc.weight".to_string(), w)]),
            &path,
        )?;

        let vb = from_mmaped_safetensors(vec![path], DType::F32, &Device::Cpu, true)?;
        let got = vb.get((2, 3), "head.fc.weight")?;
        assert_eq!(got.to_vec2::<f32>()?, vec![vec![0., 1., 2.], vec![3., 4., 5.]]);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
