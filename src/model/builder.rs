// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/builder.rs - 检测模型构建
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

use tracing::{debug, info};

use super::{
  Backbone, BlockType, DataPreprocessor, DetectionModel, Head, ModelConfig, ModelError,
  StemConfig,
};
use crate::{
  nn::{ConvModule, Focus, Layer, RepVggBlock},
  weights::{WeightSource, load_conv_with_bias},
};

pub struct DetectorBuilder {
  config: ModelConfig,
}

impl DetectorBuilder {
  pub fn new(config: ModelConfig) -> Self {
    Self { config }
  }

  pub fn from_config_path<P: AsRef<Path>>(path: P) -> Result<Self, ModelError> {
    let path = path.as_ref();
    info!("加载模型配置: {}", path.display());
    Ok(Self::new(ModelConfig::from_path(path)?))
  }

  pub fn config(&self) -> &ModelConfig {
    &self.config
  }

  pub fn build(&self, source: &mut dyn WeightSource) -> Result<DetectionModel, ModelError> {
    self.config.validate()?;
    let backbone_cfg = &self.config.backbone;
    let act = backbone_cfg.act;
    let eps = backbone_cfg.bn_eps;

    let stem = match &backbone_cfg.stem {
      StemConfig::Focus {
        out_channels,
        kernel_size,
      } => Layer::Focus(Focus::load(
        source,
        "backbone.stem",
        backbone_cfg.in_channels,
        *out_channels,
        *kernel_size,
        act,
        eps,
      )?),
      StemConfig::Conv {
        out_channels,
        kernel_size,
        stride,
      } => Layer::Conv(ConvModule::load(
        source,
        "backbone.stem",
        backbone_cfg.in_channels,
        *out_channels,
        *kernel_size,
        *stride,
        act,
        eps,
      )?),
    };
    debug!("stem: {}", stem.kind());

    let mut in_channels = backbone_cfg.stem.out_channels();
    let mut stage_channels = Vec::with_capacity(backbone_cfg.stages.len());
    let mut stages = Vec::with_capacity(backbone_cfg.stages.len());

    for (i, stage_cfg) in backbone_cfg.stages.iter().enumerate() {
      let prefix = format!("backbone.stage{}", i + 1);
      let out_channels = stage_cfg.out_channels;
      let mut layers = Vec::with_capacity(stage_cfg.num_blocks + 1);

      layers.push(Layer::Conv(ConvModule::load(
        source,
        &format!("{prefix}.0"),
        in_channels,
        out_channels,
        3,
        2,
        act,
        eps,
      )?));

      for j in 1..=stage_cfg.num_blocks {
        let block_prefix = format!("{prefix}.{j}");
        let layer = match stage_cfg.block {
          BlockType::RepVgg => Layer::RepVgg(RepVggBlock::load(
            source,
            &block_prefix,
            out_channels,
            out_channels,
            1,
            act,
            eps,
          )?),
          BlockType::Conv => Layer::Conv(ConvModule::load(
            source,
            &block_prefix,
            out_channels,
            out_channels,
            3,
            1,
            act,
            eps,
          )?),
        };
        layers.push(layer);
      }

      debug!(
        "{}: {} -> {}, {} 个模块",
        prefix,
        in_channels,
        out_channels,
        layers.len()
      );
      stages.push(layers);
      stage_channels.push(out_channels);
      in_channels = out_channels;
    }

    let head_cfg = &self.config.bbox_head;
    let mut cls_preds = Vec::with_capacity(backbone_cfg.out_indices.len());
    let mut reg_preds = Vec::with_capacity(backbone_cfg.out_indices.len());
    for (level, &index) in backbone_cfg.out_indices.iter().enumerate() {
      let channels = stage_channels[index];
      cls_preds.push(load_conv_with_bias(
        source,
        &format!("bbox_head.cls_preds.{level}"),
        [head_cfg.num_classes, channels, 1, 1],
      )?);
      reg_preds.push(load_conv_with_bias(
        source,
        &format!("bbox_head.reg_preds.{level}"),
        [head_cfg.box_channels, channels, 1, 1],
      )?);
    }

    info!(
      "模型构建完成: {} 个阶段, {} 个输出尺度, {} 个类别",
      stages.len(),
      cls_preds.len(),
      head_cfg.num_classes
    );

    Ok(DetectionModel {
      data_preprocessor: DataPreprocessor {
        mean: self.config.data_preprocessor.mean.clone(),
        std: self.config.data_preprocessor.std.clone(),
      },
      backbone: Backbone {
        stem,
        stages,
        out_indices: backbone_cfg.out_indices.clone(),
      },
      bbox_head: Head {
        cls_preds,
        reg_preds,
      },
    })
  }
}
