// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nn.rs - 网络层定义
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

use std::fmt;

use ndarray::Array4;

use crate::tensor::TensorError;

mod conv;
mod focus;
mod repvgg;

pub use self::conv::ConvModule;
pub use self::focus::{Focus, GConvFocus, ShuffleFocus, SliceFocus};
pub use self::repvgg::{RepVggBlock, RepVggForm};

/// 层的种类，闭合集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
  Conv,
  RepVgg,
  Focus,
  SliceFocus,
  ShuffleFocus,
  GConvFocus,
}

impl LayerKind {
  pub fn as_str(self) -> &'static str {
    match self {
      LayerKind::Conv => "ConvModule",
      LayerKind::RepVgg => "RepVGGBlock",
      LayerKind::Focus => "Focus",
      LayerKind::SliceFocus => "SliceFocus",
      LayerKind::ShuffleFocus => "ShuffleFocus",
      LayerKind::GConvFocus => "GConvFocus",
    }
  }

  pub fn is_focus_replacement(self) -> bool {
    matches!(
      self,
      LayerKind::SliceFocus | LayerKind::ShuffleFocus | LayerKind::GConvFocus
    )
  }
}

impl fmt::Display for LayerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone)]
pub enum Layer {
  Conv(ConvModule),
  RepVgg(RepVggBlock),
  Focus(Focus),
  SliceFocus(SliceFocus),
  ShuffleFocus(ShuffleFocus),
  GConvFocus(GConvFocus),
}

impl Layer {
  pub fn kind(&self) -> LayerKind {
    match self {
      Layer::Conv(_) => LayerKind::Conv,
      Layer::RepVgg(_) => LayerKind::RepVgg,
      Layer::Focus(_) => LayerKind::Focus,
      Layer::SliceFocus(_) => LayerKind::SliceFocus,
      Layer::ShuffleFocus(_) => LayerKind::ShuffleFocus,
      Layer::GConvFocus(_) => LayerKind::GConvFocus,
    }
  }

  pub fn out_channels(&self) -> usize {
    match self {
      Layer::Conv(m) => m.out_channels(),
      Layer::RepVgg(b) => b.out_channels(),
      Layer::Focus(f) => f.conv.out_channels(),
      Layer::SliceFocus(f) => f.conv.out_channels(),
      Layer::ShuffleFocus(f) => f.conv.out_channels(),
      Layer::GConvFocus(f) => f.conv.out_channels(),
    }
  }

  pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, TensorError> {
    match self {
      Layer::Conv(m) => m.forward(x),
      Layer::RepVgg(b) => b.forward(x),
      Layer::Focus(f) => f.forward(x),
      Layer::SliceFocus(f) => f.forward(x),
      Layer::ShuffleFocus(f) => f.forward(x),
      Layer::GConvFocus(f) => f.forward(x),
    }
  }
}
