// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nn/repvgg.rs - 可重参数化 RepVGG 模块
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

use ndarray::{Array1, Array4, s};
use tracing::debug;

use super::ConvModule;
use crate::{
  tensor::{Activation, BatchNorm2d, Conv2d, TensorError},
  weights::{WeightError, WeightSource, load_batch_norm},
};

#[derive(Debug, Clone)]
pub enum RepVggForm {
  /// 训练形态: 3x3 分支 + 1x1 分支 + 可选恒等分支
  Train {
    dense: ConvModule,
    one_by_one: ConvModule,
    identity: Option<BatchNorm2d>,
  },
  /// 部署形态: 单个带偏置的 3x3 卷积
  Deploy { reparam: Conv2d },
}

#[derive(Debug, Clone)]
pub struct RepVggBlock {
  form: RepVggForm,
  act: Activation,
}

impl RepVggBlock {
  pub fn new(form: RepVggForm, act: Activation) -> Self {
    Self { form, act }
  }

  /// 读取 `{prefix}.rbr_dense`、`{prefix}.rbr_1x1` 与 `{prefix}.rbr_identity`
  pub fn load(
    source: &mut dyn WeightSource,
    prefix: &str,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    act: Activation,
    eps: f32,
  ) -> Result<Self, WeightError> {
    let dense = ConvModule::load(
      source,
      &format!("{prefix}.rbr_dense"),
      in_channels,
      out_channels,
      3,
      stride,
      Activation::Identity,
      eps,
    )?;
    let one_by_one = ConvModule::load(
      source,
      &format!("{prefix}.rbr_1x1"),
      in_channels,
      out_channels,
      1,
      stride,
      Activation::Identity,
      eps,
    )?;
    let identity = if in_channels == out_channels && stride == 1 {
      Some(load_batch_norm(
        source,
        &format!("{prefix}.rbr_identity"),
        out_channels,
        eps,
      )?)
    } else {
      None
    };

    Ok(Self::new(
      RepVggForm::Train {
        dense,
        one_by_one,
        identity,
      },
      act,
    ))
  }

  pub fn form(&self) -> &RepVggForm {
    &self.form
  }

  pub fn act(&self) -> Activation {
    self.act
  }

  pub fn is_deploy(&self) -> bool {
    matches!(self.form, RepVggForm::Deploy { .. })
  }

  /// 部署形态下的重参数化卷积
  pub fn reparam(&self) -> Option<&Conv2d> {
    match &self.form {
      RepVggForm::Deploy { reparam } => Some(reparam),
      RepVggForm::Train { .. } => None,
    }
  }

  pub fn out_channels(&self) -> usize {
    match &self.form {
      RepVggForm::Train { dense, .. } => dense.out_channels(),
      RepVggForm::Deploy { reparam } => reparam.out_channels(),
    }
  }

  pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, TensorError> {
    let y = match &self.form {
      RepVggForm::Train {
        dense,
        one_by_one,
        identity,
      } => {
        let mut y = dense.forward(x)?;
        y += &one_by_one.forward(x)?;
        if let Some(bn) = identity {
          y += &bn.forward(x.clone())?;
        }
        y
      }
      RepVggForm::Deploy { reparam } => reparam.forward(x)?,
    };
    Ok(self.act.forward(y))
  }

  /// 不可逆地切换到部署形态，已是部署形态时不做任何事
  pub fn switch_to_deploy(&mut self) -> Result<(), TensorError> {
    let reparam = match &self.form {
      RepVggForm::Deploy { .. } => return Ok(()),
      RepVggForm::Train {
        dense,
        one_by_one,
        identity,
      } => equivalent_conv(dense, one_by_one, identity.as_ref())?,
    };
    debug!(
      "RepVGG 模块折叠为单个 {}x{} 卷积",
      reparam.out_channels(),
      reparam.in_channels()
    );
    self.form = RepVggForm::Deploy { reparam };
    Ok(())
  }
}

fn equivalent_conv(
  dense: &ConvModule,
  one_by_one: &ConvModule,
  identity: Option<&BatchNorm2d>,
) -> Result<Conv2d, TensorError> {
  let dense = dense.fused()?;
  let one_by_one = one_by_one.fused()?;
  let out_channels = dense.out_channels();
  let in_channels = dense.in_channels();
  let stride = dense.stride;

  let mut weight = dense.weight;
  let mut bias = dense
    .bias
    .unwrap_or_else(|| Array1::zeros(out_channels));

  // 1x1 核放到 3x3 核的中心
  {
    let mut center = weight.slice_mut(s![.., .., 1, 1]);
    center += &one_by_one.weight.slice(s![.., .., 0, 0]);
  }
  if let Some(b) = &one_by_one.bias {
    bias += b;
  }

  if let Some(bn) = identity {
    if in_channels != out_channels {
      return Err(TensorError::ChannelMismatch {
        expected: out_channels,
        actual: in_channels,
      });
    }
    let (scale, shift) = bn.scale_shift();
    for c in 0..out_channels {
      weight[[c, c, 1, 1]] += scale[c];
    }
    bias += &shift;
  }

  Ok(Conv2d::new(weight, Some(bias), stride, 1, 1))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{tensor::max_abs_diff, weights::RandomInit};

  fn input(channels: usize, size: usize) -> Array4<f32> {
    Array4::from_shape_fn((2, channels, size, size), |(b, c, y, x)| {
      ((b * 7 + c * 5 + y * 3 + x) % 11) as f32 * 0.1 - 0.5
    })
  }

  #[test]
  fn folded_block_matches_training_form_with_identity() {
    let mut source = RandomInit::seeded(1);
    let mut block =
      RepVggBlock::load(&mut source, "b", 4, 4, 1, Activation::Relu, 1e-3).unwrap();
    let x = input(4, 6);
    let expected = block.forward(&x).unwrap();

    block.switch_to_deploy().unwrap();
    assert!(block.is_deploy());
    let folded = block.forward(&x).unwrap();
    assert!(max_abs_diff(&expected, &folded) < 1e-4);
  }

  #[test]
  fn folded_block_matches_training_form_with_stride() {
    let mut source = RandomInit::seeded(2);
    let mut block =
      RepVggBlock::load(&mut source, "b", 3, 6, 2, Activation::Silu, 1e-3).unwrap();
    let x = input(3, 8);
    let expected = block.forward(&x).unwrap();

    block.switch_to_deploy().unwrap();
    let folded = block.forward(&x).unwrap();
    assert_eq!(folded.dim(), (2, 6, 4, 4));
    assert!(max_abs_diff(&expected, &folded) < 1e-4);
  }

  #[test]
  fn switching_twice_is_a_no_op() {
    let mut source = RandomInit::seeded(3);
    let mut block =
      RepVggBlock::load(&mut source, "b", 2, 2, 1, Activation::Relu, 1e-3).unwrap();
    block.switch_to_deploy().unwrap();
    let first = block.reparam().unwrap().weight.clone();
    block.switch_to_deploy().unwrap();
    assert_eq!(block.reparam().unwrap().weight, first);
  }
}
