// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测模型
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

use std::path::PathBuf;

use ndarray::Array4;
use thiserror::Error;

use crate::{
  nn::Layer,
  tensor::{Conv2d, TensorError},
  weights::WeightError,
};

mod builder;
mod config;

pub use self::builder::DetectorBuilder;
pub use self::config::{
  BackboneConfig, BlockType, DataPreprocessorConfig, HeadConfig, ModelConfig, StageConfig,
  StemConfig,
};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("配置文件不存在: {0}")]
  ConfigNotFound(PathBuf),
  #[error("配置文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("配置文件解析错误: {0}")]
  Toml(#[from] toml::de::Error),
  #[error("配置无效: {0}")]
  InvalidConfig(String),
  #[error("权重错误: {0}")]
  Weight(#[from] WeightError),
}

/// 输入归一化参数，每个输入通道一项
#[derive(Debug, Clone, PartialEq)]
pub struct DataPreprocessor {
  pub mean: Vec<f32>,
  pub std: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Backbone {
  pub stem: Layer,
  pub stages: Vec<Vec<Layer>>,
  pub out_indices: Vec<usize>,
}

impl Backbone {
  /// 返回 `out_indices` 所选阶段的输出特征
  pub fn forward(&self, x: &Array4<f32>) -> Result<Vec<Array4<f32>>, TensorError> {
    let mut x = self.stem.forward(x)?;
    let mut features = Vec::with_capacity(self.out_indices.len());
    for (index, stage) in self.stages.iter().enumerate() {
      for layer in stage {
        x = layer.forward(&x)?;
      }
      if self.out_indices.contains(&index) {
        features.push(x.clone());
      }
    }
    Ok(features)
  }
}

/// 每个尺度一组分类卷积与回归卷积
#[derive(Debug, Clone)]
pub struct Head {
  pub cls_preds: Vec<Conv2d>,
  pub reg_preds: Vec<Conv2d>,
}

impl Head {
  /// 每个特征层必须恰好对应一组分类卷积与回归卷积
  pub fn check_levels(&self, features: usize) -> Result<(), TensorError> {
    if self.cls_preds.len() != features || self.reg_preds.len() != features {
      return Err(TensorError::LevelMismatch {
        features,
        cls: self.cls_preds.len(),
        reg: self.reg_preds.len(),
      });
    }
    Ok(())
  }

  pub fn forward(
    &self,
    features: &[Array4<f32>],
  ) -> Result<(Vec<Array4<f32>>, Vec<Array4<f32>>), TensorError> {
    self.check_levels(features.len())?;
    let scores = features
      .iter()
      .zip(&self.cls_preds)
      .map(|(feature, conv)| conv.forward(feature))
      .collect::<Result<Vec<_>, _>>()?;
    let boxes = features
      .iter()
      .zip(&self.reg_preds)
      .map(|(feature, conv)| conv.forward(feature))
      .collect::<Result<Vec<_>, _>>()?;
    Ok((scores, boxes))
  }
}

#[derive(Debug, Clone)]
pub struct DetectionModel {
  pub data_preprocessor: DataPreprocessor,
  pub backbone: Backbone,
  pub bbox_head: Head,
}

impl DetectionModel {
  pub fn num_levels(&self) -> usize {
    self.backbone.out_indices.len()
  }

  /// 所有可改写的层及其路径，每个实例出现一次
  pub fn layers_mut(&mut self) -> Vec<(String, &mut Layer)> {
    let mut layers = vec![("backbone.stem".to_string(), &mut self.backbone.stem)];
    for (i, stage) in self.backbone.stages.iter_mut().enumerate() {
      for (j, layer) in stage.iter_mut().enumerate() {
        layers.push((format!("backbone.stage{}.{}", i + 1, j), layer));
      }
    }
    layers
  }

  pub fn layers(&self) -> Vec<(String, &Layer)> {
    let mut layers = vec![("backbone.stem".to_string(), &self.backbone.stem)];
    for (i, stage) in self.backbone.stages.iter().enumerate() {
      for (j, layer) in stage.iter().enumerate() {
        layers.push((format!("backbone.stage{}.{}", i + 1, j), layer));
      }
    }
    layers
  }

  /// 返回 (分类分数, 边界框)，每个尺度一项，按模型原生顺序
  pub fn forward(
    &self,
    x: &Array4<f32>,
  ) -> Result<(Vec<Array4<f32>>, Vec<Array4<f32>>), TensorError> {
    let features = self.backbone.forward(x)?;
    self.bbox_head.forward(&features)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn head(levels: usize) -> Head {
    let conv = Conv2d::new(Array4::ones((2, 4, 1, 1)), None, 1, 0, 1);
    Head {
      cls_preds: vec![conv.clone(); levels],
      reg_preds: vec![conv; levels],
    }
  }

  #[test]
  fn head_keeps_one_output_per_level() {
    let features = vec![Array4::<f32>::zeros((1, 4, 8, 8)), Array4::zeros((1, 4, 4, 4))];
    let (scores, boxes) = head(2).forward(&features).unwrap();
    assert_eq!(scores.len(), 2);
    assert_eq!(boxes.len(), 2);
    assert_eq!(scores[1].dim(), (1, 2, 4, 4));
  }

  #[test]
  fn head_rejects_fewer_features_than_levels() {
    let features = vec![Array4::<f32>::zeros((1, 4, 8, 8))];
    assert!(matches!(
      head(2).forward(&features),
      Err(TensorError::LevelMismatch {
        features: 1,
        cls: 2,
        reg: 2
      })
    ));
  }
}
