// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nn/focus.rs - Focus 切片模块及其部署替代
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

use super::ConvModule;
use crate::{
  tensor::{
    Activation, Conv2d, FOCUS_PATCHES, TensorError, concat_channels, ensure_even_spatial,
    strided_patch,
  },
  weights::{WeightError, WeightSource},
};

fn sliced_patches(x: &Array4<f32>) -> Result<Array4<f32>, TensorError> {
  ensure_even_spatial(x)?;
  let patches: Vec<Array4<f32>> = FOCUS_PATCHES
    .iter()
    .map(|&(row, col)| strided_patch(x, row, col))
    .collect();
  concat_channels(&patches)
}

/// 训练时的 Focus: 四个步长为 2 的切片在通道维拼接，再接一个卷积
#[derive(Debug, Clone)]
pub struct Focus {
  pub conv: ConvModule,
}

impl Focus {
  pub fn load(
    source: &mut dyn WeightSource,
    prefix: &str,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    act: Activation,
    eps: f32,
  ) -> Result<Self, WeightError> {
    let conv = ConvModule::load(
      source,
      &format!("{prefix}.conv"),
      in_channels * 4,
      out_channels,
      kernel_size,
      1,
      act,
      eps,
    )?;
    Ok(Self { conv })
  }

  pub fn in_channels(&self) -> usize {
    self.conv.in_channels() / 4
  }

  pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, TensorError> {
    self.conv.forward(&sliced_patches(x)?)
  }
}

/// 切片实现，适用于 TensorRT 与 ONNX Runtime
#[derive(Debug, Clone)]
pub struct SliceFocus {
  pub conv: ConvModule,
}

impl SliceFocus {
  pub fn from_focus(focus: Focus) -> Self {
    Self { conv: focus.conv }
  }

  pub fn in_channels(&self) -> usize {
    self.conv.in_channels() / 4
  }

  pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, TensorError> {
    self.conv.forward(&sliced_patches(x)?)
  }
}

/// 单个分组卷积 + 通道重排，适用于 NCNN
///
/// 分组卷积对每个输入通道输出 4 个通道（按 [`FOCUS_PATCHES`] 顺序），
/// 随后经 reshape / transpose / reshape 把同一切片的通道排到一起。
#[derive(Debug, Clone)]
pub struct ShuffleFocus {
  pub space_to_depth: Conv2d,
  pub conv: ConvModule,
}

impl ShuffleFocus {
  pub fn from_focus(focus: Focus) -> Self {
    let channels = focus.in_channels();
    let mut weight = Array4::<f32>::zeros((channels * 4, 1, 2, 2));
    for c in 0..channels {
      for (k, &(row, col)) in FOCUS_PATCHES.iter().enumerate() {
        weight[[c * 4 + k, 0, row, col]] = 1.0;
      }
    }
    Self {
      space_to_depth: Conv2d::new(weight, None, 2, 0, channels),
      conv: focus.conv,
    }
  }

  pub fn in_channels(&self) -> usize {
    self.space_to_depth.groups
  }

  pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, TensorError> {
    ensure_even_spatial(x)?;
    let y = self.space_to_depth.forward(x)?;
    let (n, _, h, w) = y.dim();
    let c = self.in_channels();
    let shuffled = y
      .into_shape_with_order((n, c, 4, h, w))?
      .permuted_axes([0, 2, 1, 3, 4])
      .as_standard_layout()
      .into_owned()
      .into_shape_with_order((n, c * 4, h, w))?;
    self.conv.forward(&shuffled)
  }
}

/// 四个独热核的分组卷积，通用回退实现
#[derive(Debug, Clone)]
pub struct GConvFocus {
  pub kernels: [Conv2d; 4],
  pub conv: ConvModule,
}

impl GConvFocus {
  pub fn from_focus(focus: Focus) -> Self {
    let channels = focus.in_channels();
    let kernels = FOCUS_PATCHES.map(|(row, col)| {
      let mut weight = Array4::<f32>::zeros((channels, 1, 2, 2));
      for c in 0..channels {
        weight[[c, 0, row, col]] = 1.0;
      }
      Conv2d::new(weight, None, 2, 0, channels)
    });
    Self {
      kernels,
      conv: focus.conv,
    }
  }

  pub fn in_channels(&self) -> usize {
    self.kernels[0].groups
  }

  pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, TensorError> {
    ensure_even_spatial(x)?;
    let parts = self
      .kernels
      .iter()
      .map(|k| k.forward(x))
      .collect::<Result<Vec<_>, _>>()?;
    self.conv.forward(&concat_channels(&parts)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{tensor::max_abs_diff, weights::RandomInit};

  fn focus() -> Focus {
    let mut source = RandomInit::seeded(11);
    Focus::load(&mut source, "stem", 3, 8, 3, Activation::Silu, 1e-3).unwrap()
  }

  fn image() -> Array4<f32> {
    Array4::from_shape_fn((2, 3, 8, 10), |(b, c, y, x)| {
      ((b * 31 + c * 17 + y * 5 + x * 3) % 23) as f32 / 23.0
    })
  }

  #[test]
  fn focus_halves_spatial_size() {
    let y = focus().forward(&image()).unwrap();
    assert_eq!(y.dim(), (2, 8, 4, 5));
  }

  #[test]
  fn every_replacement_matches_focus() {
    let original = focus();
    let x = image();
    let expected = original.forward(&x).unwrap();

    let slice = SliceFocus::from_focus(original.clone()).forward(&x).unwrap();
    let shuffle = ShuffleFocus::from_focus(original.clone()).forward(&x).unwrap();
    let gconv = GConvFocus::from_focus(original).forward(&x).unwrap();

    assert!(max_abs_diff(&expected, &slice) < 1e-5);
    assert!(max_abs_diff(&expected, &shuffle) < 1e-5);
    assert!(max_abs_diff(&expected, &gconv) < 1e-5);
  }

  #[test]
  fn replacements_reject_odd_input() {
    let x = Array4::<f32>::zeros((1, 3, 7, 8));
    assert!(matches!(
      GConvFocus::from_focus(focus()).forward(&x),
      Err(TensorError::OddSpatial { .. })
    ));
    assert!(matches!(
      ShuffleFocus::from_focus(focus()).forward(&x),
      Err(TensorError::OddSpatial { .. })
    ));
  }
}
