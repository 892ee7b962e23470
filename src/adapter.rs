// 该文件是 Shanan （山南西风） 项目的一部分。
// src/adapter.rs - 面向部署后端的模型包装
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

use ndarray::Array4;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  backend::{Backend, FocusStrategy},
  model::{DetectionModel, Head},
  nn::{GConvFocus, Layer, LayerKind, ShuffleFocus, SliceFocus},
  tensor::{TensorError, to_channel_last},
};

/// 输入图像固定为 3 通道
pub const INPUT_CHANNELS: usize = 3;

const STEM_PATH: &str = "backbone.stem";

#[derive(Error, Debug)]
pub enum AdapterError {
  #[error("模型中没有找到 backbone.stem 处的 Focus 模块")]
  MissingFocus,
  #[error("Focus 模块只允许出现在 backbone.stem，实际位于 {0}")]
  UnexpectedFocus(String),
  #[error("输入通道数必须为 3, 实际为 {0}")]
  InputChannels(usize),
  #[error("分类输出 {scores} 个与边界框输出 {boxes} 个无法配对")]
  UnpairedOutputs { scores: usize, boxes: usize },
  #[error("张量运算错误: {0}")]
  Tensor(#[from] TensorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewrite {
  FoldRepVgg,
  ReplaceFocus(FocusStrategy),
}

pub(crate) fn check_paired(head: &Head) -> Result<(), AdapterError> {
  if head.cls_preds.len() != head.reg_preds.len() {
    return Err(AdapterError::UnpairedOutputs {
      scores: head.cls_preds.len(),
      boxes: head.reg_preds.len(),
    });
  }
  Ok(())
}

fn rewrite_rule(
  path: &str,
  kind: LayerKind,
  backend: Backend,
) -> Result<Option<Rewrite>, AdapterError> {
  match kind {
    LayerKind::RepVgg => Ok(Some(Rewrite::FoldRepVgg)),
    LayerKind::Focus if path == STEM_PATH => {
      Ok(Some(Rewrite::ReplaceFocus(backend.focus_strategy())))
    }
    LayerKind::Focus => Err(AdapterError::UnexpectedFocus(path.to_string())),
    _ => Ok(None),
  }
}

fn apply_rewrite(layer: &mut Layer, rewrite: Rewrite) -> Result<(), AdapterError> {
  match (rewrite, &mut *layer) {
    (Rewrite::FoldRepVgg, Layer::RepVgg(block)) => block.switch_to_deploy()?,
    (Rewrite::ReplaceFocus(strategy), Layer::Focus(focus)) => {
      let focus = focus.clone();
      *layer = match strategy {
        FocusStrategy::Slice => Layer::SliceFocus(SliceFocus::from_focus(focus)),
        FocusStrategy::Shuffle => Layer::ShuffleFocus(ShuffleFocus::from_focus(focus)),
        FocusStrategy::GroupConv => Layer::GConvFocus(GConvFocus::from_focus(focus)),
      };
    }
    _ => {}
  }
  Ok(())
}

/// 改写结果统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteSummary {
  pub folded: usize,
  pub focus: LayerKind,
}

/// 包装检测模型，构造时一次性改写为部署形态
///
/// 适配器独占模型的所有权且不再交还，同一个模型无法被包装两次。
#[derive(Debug)]
pub struct DeployAdapter {
  model: DetectionModel,
  backend: Backend,
  mean: Vec<f32>,
  std: Vec<f32>,
  force_transpose: bool,
  summary: RewriteSummary,
}

impl DeployAdapter {
  pub const FORCE_TRANSPOSE: bool = true;

  pub fn new(mut model: DetectionModel, backend: Backend) -> Result<Self, AdapterError> {
    info!("切换模型到部署形态, 后端: {}", backend);
    let mean = model.data_preprocessor.mean.clone();
    let std = model.data_preprocessor.std.clone();
    let summary = Self::switch_deploy(&mut model, backend)?;
    info!(
      "部署改写完成: 折叠 {} 个 RepVGG 模块, stem 替换为 {}",
      summary.folded, summary.focus
    );

    Ok(Self {
      model,
      backend,
      mean,
      std,
      force_transpose: Self::FORCE_TRANSPOSE,
      summary,
    })
  }

  fn switch_deploy(
    model: &mut DetectionModel,
    backend: Backend,
  ) -> Result<RewriteSummary, AdapterError> {
    let mut folded = 0;
    let mut focus = None;

    for (path, layer) in model.layers_mut() {
      let Some(rewrite) = rewrite_rule(&path, layer.kind(), backend)? else {
        continue;
      };
      apply_rewrite(layer, rewrite)?;
      debug!("{}: {:?} -> {}", path, rewrite, layer.kind());
      match rewrite {
        Rewrite::FoldRepVgg => folded += 1,
        Rewrite::ReplaceFocus(_) => focus = Some(layer.kind()),
      }
    }

    let focus = focus.ok_or(AdapterError::MissingFocus)?;
    Ok(RewriteSummary { folded, focus })
  }

  /// 关闭或开启输出的通道后置
  pub fn with_force_transpose(mut self, force_transpose: bool) -> Self {
    self.force_transpose = force_transpose;
    self
  }

  pub fn force_transpose(&self) -> bool {
    self.force_transpose
  }

  pub fn backend(&self) -> Backend {
    self.backend
  }

  pub fn mean(&self) -> &[f32] {
    &self.mean
  }

  pub fn std(&self) -> &[f32] {
    &self.std
  }

  pub fn summary(&self) -> RewriteSummary {
    self.summary
  }

  /// 改写后的模型，只读
  pub fn model(&self) -> &DetectionModel {
    &self.model
  }

  /// 输出按 [score_0, bbox_0, score_1, bbox_1, ...] 交错排列
  pub fn forward(&self, inputs: &Array4<f32>) -> Result<Vec<Array4<f32>>, AdapterError> {
    let channels = inputs.dim().1;
    if channels != INPUT_CHANNELS {
      return Err(AdapterError::InputChannels(channels));
    }

    check_paired(&self.model.bbox_head)?;
    let (scores, boxes) = self.model.forward(inputs)?;

    let mut outputs = Vec::with_capacity(scores.len() * 2);
    for (score, bbox) in scores.into_iter().zip(boxes) {
      if self.force_transpose {
        outputs.push(to_channel_last(&score));
        outputs.push(to_channel_last(&bbox));
      } else {
        outputs.push(score);
        outputs.push(bbox);
      }
    }
    Ok(outputs)
  }
}
