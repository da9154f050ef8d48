use candle_core::{DType, Device, Tensor};
use hrvit_core::{parameter_counts, random_init, HrvitConfig, HrvitModel};

fn tiny_config() -> HrvitConfig {
    HrvitConfig {
        stem_channels: 8,
        channels: vec![8, 16, 32],
        dim_head: 8,
        block_list: vec![vec![1], vec![1, 1], vec![1, 1, 2]],
        ws_list: vec![1, 2, 3],
        mlp_ratio_list: vec![2.0, 2.0, 2.0],
        num_classes: 5,
        ..HrvitConfig::b1()
    }
}

#[test]
fn classifies_a_batch() {
    let cfg = tiny_config();
    let (_varmap, vb) = random_init(DType::F32, &Device::Cpu);
    let model = HrvitModel::new(&cfg, vb).unwrap();
    assert_eq!(model.num_classes(), 5);

    let pixels = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
    let logits = model.forward(&pixels).unwrap();
    assert_eq!(logits.dims(), &[2, 5]);
    let values = logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn features_halve_per_branch() {
    let cfg = tiny_config();
    let (_varmap, vb) = random_init(DType::F32, &Device::Cpu);
    let model = HrvitModel::new(&cfg, vb).unwrap();

    // 30 -> 15 -> 8 through the stem, then 8, 4, 2.
    let pixels = Tensor::randn(0f32, 1f32, (1, 3, 30, 30), &Device::Cpu).unwrap();
    let features = model.forward_features(&pixels).unwrap();
    let dims = features.iter().map(|f| f.dims().to_vec()).collect::<Vec<_>>();
    assert_eq!(
        dims,
        vec![vec![1, 8, 8, 8], vec![1, 16, 4, 4], vec![1, 32, 2, 2]]
    );
}

#[test]
fn ragged_windows_over_several_strips() {
    // 40 -> 10 through the stem, branches of 10, 5 and 3. Branch 1 cuts its
    // 5 rows into strips of 2, leaving a padded third strip.
    let cfg = tiny_config();
    let (_varmap, vb) = random_init(DType::F32, &Device::Cpu);
    let model = HrvitModel::new(&cfg, vb).unwrap();

    let pixels = Tensor::randn(0f32, 1f32, (2, 3, 40, 40), &Device::Cpu).unwrap();
    let features = model.forward_features(&pixels).unwrap();
    assert_eq!(features[1].dims(), &[2, 16, 5, 5]);
    assert_eq!(features[2].dims(), &[2, 32, 3, 3]);

    let logits = model.forward(&pixels).unwrap();
    assert_eq!(logits.dims(), &[2, 5]);
    let values = logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
}

#[test]
fn weight_names_follow_checkpoint_layout() {
    let cfg = tiny_config();
    let (varmap, vb) = random_init(DType::F32, &Device::Cpu);
    HrvitModel::new(&cfg, vb).unwrap();
    let data = varmap.data().lock().unwrap();
    for name in [
        "stem.conv1.weight",
        "stem.conv2.bias",
        "features.0.patch_embed.0.proj.0.weight",
        "features.0.patch_embed.0.proj.1.weight",
        "features.0.patch_embed.0.norm.weight",
        "features.0.norm.0.weight",
        "features.1.fusion.blocks.1.0.0.weight",
        "features.1.fusion.blocks.1.0.1.running_var",
        "features.1.fusion.blocks.1.0.3.weight",
        "features.2.fusion.blocks.0.1.0.weight",
        "features.1.branches.1.0.attn.to_qkv.weight",
        "features.1.branches.1.0.attn.to_out.0.weight",
        "features.1.branches.1.0.attn.attn_bn.running_mean",
        "features.1.branches.1.0.attn.parallel_conv.1.weight",
        "features.1.branches.1.0.attn_norm.weight",
        "features.1.branches.1.0.des.proj_right.weight",
        "features.1.branches.1.0.des.proj_left.weight",
        "features.1.branches.1.0.ffn.fc1.weight",
        "features.1.branches.1.0.ffn.conv.conv_3.weight",
        "features.1.branches.1.0.ffn.conv.conv_5.weight",
        "features.1.branches.1.0.ffn.fc2.weight",
        "features.2.branches.2.1.ffn_norm.bias",
        "features.2.norm.2.bias",
        "head.norm.weight",
        "head.fc.weight",
        "head.fc.bias",
    ] {
        assert!(data.contains_key(name), "missing {name}");
    }
}

#[test]
fn parameters_grouped_by_stage() {
    let cfg = tiny_config();
    let (varmap, vb) = random_init(DType::F32, &Device::Cpu);
    HrvitModel::new(&cfg, vb).unwrap();
    let counts = parameter_counts(&varmap).unwrap();
    let groups = counts.keys().cloned().collect::<Vec<_>>();
    assert_eq!(
        groups,
        vec!["features.0", "features.1", "features.2", "head", "stem"]
    );
    // LayerNorm and Linear over the 56 concatenated features.
    assert_eq!(counts["head"], 2 * 56 + 56 * 5 + 5);
}

#[test]
fn rejects_wrong_channel_count() {
    let cfg = tiny_config();
    let (_varmap, vb) = random_init(DType::F32, &Device::Cpu);
    let model = HrvitModel::new(&cfg, vb).unwrap();
    let pixels = Tensor::zeros((1, 1, 32, 32), DType::F32, &Device::Cpu).unwrap();
    assert!(model.forward(&pixels).is_err());
}
