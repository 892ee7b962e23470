// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/config.rs - 模型配置文件测试
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{fs, path::PathBuf};

use ndarray::{Array4, ArrayD};
use safetensors::{Dtype, tensor::TensorView};
use shanan_export::{
  Backend, DeployAdapter, DetectorBuilder, ModelConfig,
  args::ModelArgs,
  model::{BlockType, StemConfig},
  nn::LayerKind,
  tensor::max_abs_diff,
  weights::{RandomInit, WeightError, WeightSource},
};

const TINY: &str = r#"
[data_preprocessor]
mean = [0.0, 0.0, 0.0]
std = [255.0, 255.0, 255.0]

[backbone]
out_indices = [0, 1]

[backbone.stem]
type = "focus"
out_channels = 4

[[backbone.stages]]
out_channels = 8
num_blocks = 1

[[backbone.stages]]
out_channels = 8
num_blocks = 1

[bbox_head]
num_classes = 2
"#;

/// 记录随机初始化产生的每个参数，用于生成检查点文件
struct Recording {
  inner: RandomInit,
  tensors: Vec<(String, Vec<usize>, Vec<u8>)>,
}

impl WeightSource for Recording {
  fn tensor(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, WeightError> {
    let array = self.inner.tensor(name, shape)?;
    let raw = array.iter().flat_map(|v| v.to_le_bytes()).collect();
    self.tensors.push((name.to_string(), shape.to_vec(), raw));
    Ok(array)
  }
}

fn bundled(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("configs")
    .join(name)
}

#[test]
fn bundled_config_builds() {
  let builder = DetectorBuilder::from_config_path(bundled("repvgg_focus_s.toml")).unwrap();
  let config = builder.config();
  assert!(matches!(
    config.backbone.stem,
    StemConfig::Focus {
      out_channels: 32,
      ..
    }
  ));
  assert!(config.backbone.stages.iter().all(|s| s.block == BlockType::RepVgg));
  assert_eq!(config.bbox_head.num_classes, 80);

  let model = builder.build(&mut RandomInit::seeded(0)).unwrap();
  assert_eq!(model.num_levels(), 3);
  let repvgg = model
    .layers()
    .iter()
    .filter(|(_, layer)| layer.kind() == LayerKind::RepVgg)
    .count();
  assert_eq!(repvgg, 14);
}

#[test]
fn missing_files_fail_adapter_construction() {
  let dir = tempfile::tempdir().unwrap();
  let args = ModelArgs {
    config: dir.path().join("missing.toml"),
    checkpoint: dir.path().join("missing.safetensors"),
  };
  assert!(args.build_adapter(Backend::OnnxRuntime).is_err());

  let args = ModelArgs {
    config: bundled("repvgg_focus_s.toml"),
    checkpoint: dir.path().join("missing.safetensors"),
  };
  let message = format!("{:#}", args.build_adapter(Backend::Ncnn).unwrap_err());
  assert!(message.contains("missing.safetensors"));
}

#[test]
fn checkpoint_file_reproduces_the_model() {
  let dir = tempfile::tempdir().unwrap();
  let config_path = dir.path().join("tiny.toml");
  fs::write(&config_path, TINY).unwrap();

  let mut recording = Recording {
    inner: RandomInit::seeded(17),
    tensors: Vec::new(),
  };
  let reference = DetectorBuilder::new(ModelConfig::from_toml_str(TINY).unwrap())
    .build(&mut recording)
    .unwrap();
  let views: Vec<(String, TensorView)> = recording
    .tensors
    .iter()
    .map(|(name, shape, raw)| {
      (
        name.clone(),
        TensorView::new(Dtype::F32, shape.clone(), raw).unwrap(),
      )
    })
    .collect();
  let checkpoint_path = dir.path().join("tiny.safetensors");
  fs::write(&checkpoint_path, safetensors::serialize(views, &None).unwrap()).unwrap();

  let args = ModelArgs {
    config: config_path,
    checkpoint: checkpoint_path,
  };
  let adapter = args.build_adapter(Backend::Ncnn).unwrap();
  let expected = DeployAdapter::new(reference, Backend::Ncnn).unwrap();

  let x = Array4::from_shape_fn((1, 3, 32, 32), |(_, c, y, x)| ((c + y * x) % 11) as f32);
  let outputs = adapter.forward(&x).unwrap();
  for (a, b) in outputs.iter().zip(&expected.forward(&x).unwrap()) {
    assert!(max_abs_diff(a, b) < 1e-6);
  }
}
