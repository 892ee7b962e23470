// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nn/conv.rs - 卷积 + 批归一化 + 激活
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

use crate::{
  tensor::{Activation, BatchNorm2d, Conv2d, TensorError},
  weights::{WeightError, WeightSource, load_batch_norm, load_conv},
};

#[derive(Debug, Clone)]
pub struct ConvModule {
  pub conv: Conv2d,
  pub bn: BatchNorm2d,
  pub act: Activation,
}

impl ConvModule {
  /// 从 `{prefix}.conv` 与 `{prefix}.bn` 读取参数，padding 取 `kernel / 2`
  #[allow(clippy::too_many_arguments)]
  pub fn load(
    source: &mut dyn WeightSource,
    prefix: &str,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    act: Activation,
    eps: f32,
  ) -> Result<Self, WeightError> {
    let conv = load_conv(
      source,
      &format!("{prefix}.conv"),
      [out_channels, in_channels, kernel_size, kernel_size],
      stride,
      kernel_size / 2,
    )?;
    let bn = load_batch_norm(source, &format!("{prefix}.bn"), out_channels, eps)?;
    Ok(Self { conv, bn, act })
  }

  pub fn in_channels(&self) -> usize {
    self.conv.in_channels()
  }

  pub fn out_channels(&self) -> usize {
    self.conv.out_channels()
  }

  pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, TensorError> {
    let y = self.bn.forward(self.conv.forward(x)?)?;
    Ok(self.act.forward(y))
  }

  /// 卷积与批归一化融合后的等效卷积
  pub fn fused(&self) -> Result<Conv2d, TensorError> {
    self.bn.fold(&self.conv)
  }
}
