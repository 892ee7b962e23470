// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/config.rs - 模型结构配置
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

use std::path::Path;

use serde::Deserialize;

use super::ModelError;
use crate::{adapter::INPUT_CHANNELS, tensor::Activation};

/// 检测模型配置（TOML）
///
/// ```toml
/// [data_preprocessor]
/// mean = [0.0, 0.0, 0.0]
/// std = [255.0, 255.0, 255.0]
///
/// [backbone]
/// out_indices = [1, 2, 3]
///
/// [backbone.stem]
/// type = "focus"
/// out_channels = 16
///
/// [[backbone.stages]]
/// out_channels = 32
/// num_blocks = 1
///
/// [bbox_head]
/// num_classes = 80
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
  pub data_preprocessor: DataPreprocessorConfig,
  pub backbone: BackboneConfig,
  pub bbox_head: HeadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataPreprocessorConfig {
  pub mean: Vec<f32>,
  pub std: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackboneConfig {
  #[serde(default = "default_in_channels")]
  pub in_channels: usize,
  #[serde(default = "default_bn_eps")]
  pub bn_eps: f32,
  #[serde(default)]
  pub act: Activation,
  pub stem: StemConfig,
  pub stages: Vec<StageConfig>,
  pub out_indices: Vec<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StemConfig {
  Focus {
    out_channels: usize,
    #[serde(default = "default_kernel_size")]
    kernel_size: usize,
  },
  Conv {
    out_channels: usize,
    #[serde(default = "default_kernel_size")]
    kernel_size: usize,
    #[serde(default = "default_stride")]
    stride: usize,
  },
}

impl StemConfig {
  pub fn out_channels(&self) -> usize {
    match self {
      StemConfig::Focus { out_channels, .. } | StemConfig::Conv { out_channels, .. } => {
        *out_channels
      }
    }
  }

  fn validate(&self) -> Result<(), ModelError> {
    let (kernel_size, stride) = match self {
      StemConfig::Focus { kernel_size, .. } => (*kernel_size, 1),
      StemConfig::Conv {
        kernel_size,
        stride,
        ..
      } => (*kernel_size, *stride),
    };
    if kernel_size == 0 {
      return Err(ModelError::InvalidConfig(
        "backbone.stem.kernel_size 不能为 0".into(),
      ));
    }
    if stride == 0 {
      return Err(ModelError::InvalidConfig(
        "backbone.stem.stride 不能为 0".into(),
      ));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
  #[default]
  RepVgg,
  Conv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
  pub out_channels: usize,
  #[serde(default)]
  pub num_blocks: usize,
  #[serde(default)]
  pub block: BlockType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadConfig {
  pub num_classes: usize,
  #[serde(default = "default_box_channels")]
  pub box_channels: usize,
}

fn default_in_channels() -> usize {
  3
}

fn default_bn_eps() -> f32 {
  1e-3
}

fn default_kernel_size() -> usize {
  3
}

fn default_stride() -> usize {
  2
}

fn default_box_channels() -> usize {
  4
}

impl ModelConfig {
  pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
    let path = path.as_ref();
    if !path.exists() {
      return Err(ModelError::ConfigNotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    Self::from_toml_str(&text)
  }

  pub fn from_toml_str(text: &str) -> Result<Self, ModelError> {
    let config: ModelConfig = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ModelError> {
    let channels = self.backbone.in_channels;
    if channels != INPUT_CHANNELS {
      return Err(ModelError::InvalidConfig(format!(
        "backbone.in_channels 必须为 {}, 实际为 {}",
        INPUT_CHANNELS, channels
      )));
    }
    let pre = &self.data_preprocessor;
    if pre.mean.len() != channels || pre.std.len() != channels {
      return Err(ModelError::InvalidConfig(format!(
        "mean/std 长度 ({}/{}) 必须等于输入通道数 {}",
        pre.mean.len(),
        pre.std.len(),
        channels
      )));
    }
    if self.backbone.stages.is_empty() {
      return Err(ModelError::InvalidConfig("backbone.stages 不能为空".into()));
    }
    if self.backbone.out_indices.is_empty() {
      return Err(ModelError::InvalidConfig(
        "backbone.out_indices 不能为空".into(),
      ));
    }
    let stages = self.backbone.stages.len();
    if let Some(&index) = self.backbone.out_indices.iter().find(|&&i| i >= stages) {
      return Err(ModelError::InvalidConfig(format!(
        "out_indices 中的 {} 超出阶段数 {}",
        index, stages
      )));
    }
    // 特征按阶段顺序产出，检测头按 out_indices 顺序构建
    if self.backbone.out_indices.windows(2).any(|w| w[0] >= w[1]) {
      return Err(ModelError::InvalidConfig(format!(
        "out_indices 必须严格递增: {:?}",
        self.backbone.out_indices
      )));
    }
    self.backbone.stem.validate()?;
    if self.bbox_head.num_classes == 0 {
      return Err(ModelError::InvalidConfig("num_classes 不能为 0".into()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const CONFIG: &str = r#"
[data_preprocessor]
mean = [0.0, 0.0, 0.0]
std = [255.0, 255.0, 255.0]

[backbone]
act = "relu"
out_indices = [1, 2]

[backbone.stem]
type = "focus"
out_channels = 8

[[backbone.stages]]
out_channels = 16

[[backbone.stages]]
out_channels = 16
num_blocks = 2

[[backbone.stages]]
out_channels = 32
num_blocks = 1
block = "conv"

[bbox_head]
num_classes = 3
"#;

  #[test]
  fn parses_defaults() {
    let config = ModelConfig::from_toml_str(CONFIG).unwrap();
    assert_eq!(config.backbone.in_channels, 3);
    assert_eq!(config.backbone.act, Activation::Relu);
    assert_eq!(config.backbone.stages[0].num_blocks, 0);
    assert_eq!(config.backbone.stages[0].block, BlockType::RepVgg);
    assert_eq!(config.backbone.stages[2].block, BlockType::Conv);
    assert_eq!(config.bbox_head.box_channels, 4);
    assert!(matches!(
      config.backbone.stem,
      StemConfig::Focus {
        out_channels: 8,
        kernel_size: 3
      }
    ));
  }

  #[test]
  fn rejects_out_of_range_index() {
    let text = CONFIG.replace("out_indices = [1, 2]", "out_indices = [1, 5]");
    assert!(matches!(
      ModelConfig::from_toml_str(&text),
      Err(ModelError::InvalidConfig(_))
    ));
  }

  #[test]
  fn rejects_repeated_or_unsorted_indices() {
    for indices in ["[1, 1]", "[2, 1]", "[0, 2, 1]"] {
      let text = CONFIG.replace("out_indices = [1, 2]", &format!("out_indices = {indices}"));
      assert!(
        matches!(
          ModelConfig::from_toml_str(&text),
          Err(ModelError::InvalidConfig(_))
        ),
        "{indices}"
      );
    }
  }

  #[test]
  fn rejects_zero_stride_and_kernel() {
    let stem = "type = \"focus\"\nout_channels = 8";
    for replacement in [
      "type = \"conv\"\nout_channels = 8\nstride = 0",
      "type = \"conv\"\nout_channels = 8\nkernel_size = 0",
      "type = \"focus\"\nout_channels = 8\nkernel_size = 0",
    ] {
      let text = CONFIG.replace(stem, replacement);
      assert!(
        matches!(
          ModelConfig::from_toml_str(&text),
          Err(ModelError::InvalidConfig(_))
        ),
        "{replacement}"
      );
    }
  }

  #[test]
  fn rejects_non_rgb_input() {
    let text = CONFIG
      .replace("[backbone]\n", "[backbone]\nin_channels = 4\n")
      .replace("mean = [0.0, 0.0, 0.0]", "mean = [0.0, 0.0, 0.0, 0.0]")
      .replace("std = [255.0, 255.0, 255.0]", "std = [255.0, 255.0, 255.0, 255.0]");
    assert!(matches!(
      ModelConfig::from_toml_str(&text),
      Err(ModelError::InvalidConfig(message)) if message.contains("in_channels")
    ));
  }

  #[test]
  fn rejects_missing_backbone() {
    let text = "[data_preprocessor]\nmean = [0.0]\nstd = [1.0]\n[bbox_head]\nnum_classes = 1\n";
    assert!(matches!(
      ModelConfig::from_toml_str(text),
      Err(ModelError::Toml(_))
    ));
  }
}
