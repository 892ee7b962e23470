// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - NCHW 张量基础运算
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

use ndarray::{Array1, Array4, ArrayView4, Axis, s};
use serde::Deserialize;
use thiserror::Error;

/// Focus 切片顺序: (行偏移, 列偏移)
/// 依次为左上、左下、右上、右下
pub const FOCUS_PATCHES: [(usize, usize); 4] = [(0, 0), (1, 0), (0, 1), (1, 1)];

#[derive(Error, Debug)]
pub enum TensorError {
  #[error("输入通道数不匹配: 期望 {expected}, 实际 {actual}")]
  ChannelMismatch { expected: usize, actual: usize },
  #[error("分组数 {groups} 无法整除通道数 {channels}")]
  InvalidGroups { groups: usize, channels: usize },
  #[error("输入尺寸 {height}x{width} 小于卷积核 {kernel_h}x{kernel_w}")]
  InputTooSmall {
    height: usize,
    width: usize,
    kernel_h: usize,
    kernel_w: usize,
  },
  #[error("卷积步长必须大于 0")]
  ZeroStride,
  #[error("特征层数 {features} 与分类头 {cls} 个、回归头 {reg} 个不一致")]
  LevelMismatch {
    features: usize,
    cls: usize,
    reg: usize,
  },
  #[error("空间尺寸必须为偶数: {height}x{width}")]
  OddSpatial { height: usize, width: usize },
  #[error("张量内存布局不连续")]
  NonContiguous,
  #[error("拼接失败: 张量列表为空")]
  EmptyConcat,
  #[error("形状错误: {0}")]
  Shape(#[from] ndarray::ShapeError),
}

/// 激活函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
  #[default]
  Silu,
  Relu,
  Identity,
}

impl Activation {
  pub fn forward(self, mut x: Array4<f32>) -> Array4<f32> {
    match self {
      Activation::Silu => x.mapv_inplace(|v| v / (1.0 + (-v).exp())),
      Activation::Relu => x.mapv_inplace(|v| v.max(0.0)),
      Activation::Identity => {}
    }
    x
  }
}

/// 二维卷积，权重布局为 [out, in / groups, kh, kw]
#[derive(Debug, Clone)]
pub struct Conv2d {
  pub weight: Array4<f32>,
  pub bias: Option<Array1<f32>>,
  pub stride: usize,
  pub padding: usize,
  pub groups: usize,
}

impl Conv2d {
  pub fn new(
    weight: Array4<f32>,
    bias: Option<Array1<f32>>,
    stride: usize,
    padding: usize,
    groups: usize,
  ) -> Self {
    Self {
      weight,
      bias,
      stride,
      padding,
      groups,
    }
  }

  pub fn in_channels(&self) -> usize {
    self.weight.dim().1 * self.groups
  }

  pub fn out_channels(&self) -> usize {
    self.weight.dim().0
  }

  pub fn kernel_size(&self) -> (usize, usize) {
    let (_, _, kh, kw) = self.weight.dim();
    (kh, kw)
  }

  pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
    let (kh, kw) = self.kernel_size();
    (
      (height + 2 * self.padding - kh) / self.stride + 1,
      (width + 2 * self.padding - kw) / self.stride + 1,
    )
  }

  pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, TensorError> {
    let (n, c, h, w) = x.dim();
    let (oc, icg, kh, kw) = self.weight.dim();

    if self.stride == 0 {
      return Err(TensorError::ZeroStride);
    }
    if c != self.in_channels() {
      return Err(TensorError::ChannelMismatch {
        expected: self.in_channels(),
        actual: c,
      });
    }
    if self.groups == 0 || oc % self.groups != 0 {
      return Err(TensorError::InvalidGroups {
        groups: self.groups,
        channels: oc,
      });
    }
    if h + 2 * self.padding < kh || w + 2 * self.padding < kw {
      return Err(TensorError::InputTooSmall {
        height: h,
        width: w,
        kernel_h: kh,
        kernel_w: kw,
      });
    }

    let (oh, ow) = self.output_size(h, w);
    let ocg = oc / self.groups;
    let pad = self.padding as isize;

    let x = x.as_standard_layout();
    let xs = x.as_slice().ok_or(TensorError::NonContiguous)?;
    let weight = self.weight.as_standard_layout();
    let ws = weight.as_slice().ok_or(TensorError::NonContiguous)?;

    let mut out = Array4::<f32>::zeros((n, oc, oh, ow));
    let os = out.as_slice_mut().ok_or(TensorError::NonContiguous)?;

    for b in 0..n {
      for o in 0..oc {
        let group = o / ocg;
        let obase = (b * oc + o) * oh * ow;
        let bias = self.bias.as_ref().map_or(0.0, |bias| bias[o]);
        os[obase..obase + oh * ow].fill(bias);

        for i in 0..icg {
          let xbase = (b * c + group * icg + i) * h * w;
          for ky in 0..kh {
            for kx in 0..kw {
              let wv = ws[((o * icg + i) * kh + ky) * kw + kx];
              if wv == 0.0 {
                continue;
              }
              for oy in 0..oh {
                let iy = (oy * self.stride + ky) as isize - pad;
                if iy < 0 || iy >= h as isize {
                  continue;
                }
                let row = xbase + iy as usize * w;
                let orow = obase + oy * ow;
                for ox in 0..ow {
                  let ix = (ox * self.stride + kx) as isize - pad;
                  if ix < 0 || ix >= w as isize {
                    continue;
                  }
                  os[orow + ox] += wv * xs[row + ix as usize];
                }
              }
            }
          }
        }
      }
    }

    Ok(out)
  }
}

/// 推理模式下的批归一化
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
  pub weight: Array1<f32>,
  pub bias: Array1<f32>,
  pub running_mean: Array1<f32>,
  pub running_var: Array1<f32>,
  pub eps: f32,
}

impl BatchNorm2d {
  pub fn channels(&self) -> usize {
    self.weight.len()
  }

  /// 返回等效的逐通道 (scale, shift)
  pub fn scale_shift(&self) -> (Array1<f32>, Array1<f32>) {
    let std = self.running_var.mapv(|v| (v + self.eps).sqrt());
    let scale = &self.weight / &std;
    let shift = &self.bias - &(&self.running_mean * &scale);
    (scale, shift)
  }

  pub fn forward(&self, mut x: Array4<f32>) -> Result<Array4<f32>, TensorError> {
    let channels = x.dim().1;
    if channels != self.channels() {
      return Err(TensorError::ChannelMismatch {
        expected: self.channels(),
        actual: channels,
      });
    }

    let (scale, shift) = self.scale_shift();
    for (c, mut plane) in x.axis_iter_mut(Axis(1)).enumerate() {
      let (k, b) = (scale[c], shift[c]);
      plane.mapv_inplace(|v| v * k + b);
    }
    Ok(x)
  }

  /// 将批归一化折叠进前置卷积，得到带偏置的单个卷积
  pub fn fold(&self, conv: &Conv2d) -> Result<Conv2d, TensorError> {
    if conv.out_channels() != self.channels() {
      return Err(TensorError::ChannelMismatch {
        expected: self.channels(),
        actual: conv.out_channels(),
      });
    }

    let (scale, shift) = self.scale_shift();
    let mut weight = conv.weight.clone();
    for (o, mut kernel) in weight.axis_iter_mut(Axis(0)).enumerate() {
      kernel.mapv_inplace(|v| v * scale[o]);
    }
    let bias = match &conv.bias {
      Some(bias) => &shift + &(bias * &scale),
      None => shift,
    };

    Ok(Conv2d::new(
      weight,
      Some(bias),
      conv.stride,
      conv.padding,
      conv.groups,
    ))
  }
}

/// 沿通道维拼接
pub fn concat_channels(parts: &[Array4<f32>]) -> Result<Array4<f32>, TensorError> {
  if parts.is_empty() {
    return Err(TensorError::EmptyConcat);
  }
  let views: Vec<ArrayView4<f32>> = parts.iter().map(|p| p.view()).collect();
  Ok(ndarray::concatenate(Axis(1), &views)?)
}

/// 取步长为 2 的空间子块
pub fn strided_patch(x: &Array4<f32>, row: usize, col: usize) -> Array4<f32> {
  x.slice(s![.., .., row..;2, col..;2]).to_owned()
}

pub fn ensure_even_spatial(x: &Array4<f32>) -> Result<(), TensorError> {
  let (_, _, h, w) = x.dim();
  if h % 2 != 0 || w % 2 != 0 {
    return Err(TensorError::OddSpatial {
      height: h,
      width: w,
    });
  }
  Ok(())
}

/// (N, C, H, W) -> (N, H, W, C)
pub fn to_channel_last(x: &Array4<f32>) -> Array4<f32> {
  x.view()
    .permuted_axes([0, 2, 3, 1])
    .as_standard_layout()
    .into_owned()
}

pub fn max_abs_diff(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
  if a.shape() != b.shape() {
    return f32::INFINITY;
  }
  a.iter()
    .zip(b.iter())
    .map(|(x, y)| (x - y).abs())
    .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array;

  fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    Array::from_iter((0..len).map(|v| v as f32 * 0.01))
      .into_shape_with_order(shape)
      .unwrap()
  }

  #[test]
  fn identity_kernel_keeps_input() {
    let mut weight = Array4::<f32>::zeros((2, 2, 1, 1));
    weight[[0, 0, 0, 0]] = 1.0;
    weight[[1, 1, 0, 0]] = 1.0;
    let conv = Conv2d::new(weight, None, 1, 0, 1);
    let x = ramp((1, 2, 3, 3));
    let y = conv.forward(&x).unwrap();
    assert_eq!(max_abs_diff(&x, &y), 0.0);
  }

  #[test]
  fn padded_stride_two_output_size() {
    let conv = Conv2d::new(Array4::ones((4, 3, 3, 3)), None, 2, 1, 1);
    let y = conv.forward(&ramp((2, 3, 8, 6))).unwrap();
    assert_eq!(y.dim(), (2, 4, 4, 3));
  }

  #[test]
  fn zero_stride_is_an_error() {
    let conv = Conv2d::new(Array4::ones((4, 3, 3, 3)), None, 0, 1, 1);
    assert!(matches!(
      conv.forward(&ramp((1, 3, 8, 8))),
      Err(TensorError::ZeroStride)
    ));
  }

  #[test]
  fn grouped_conv_keeps_channels_apart() {
    // 每组只看到自己的输入通道
    let conv = Conv2d::new(Array4::ones((2, 1, 1, 1)), None, 1, 0, 2);
    let mut x = Array4::<f32>::zeros((1, 2, 2, 2));
    x.slice_mut(s![.., 1, .., ..]).fill(3.0);
    let y = conv.forward(&x).unwrap();
    assert!(y.slice(s![.., 0, .., ..]).iter().all(|&v| v == 0.0));
    assert!(y.slice(s![.., 1, .., ..]).iter().all(|&v| v == 3.0));
  }

  #[test]
  fn channel_mismatch_is_reported() {
    let conv = Conv2d::new(Array4::ones((1, 3, 1, 1)), None, 1, 0, 1);
    let err = conv.forward(&ramp((1, 4, 2, 2))).unwrap_err();
    assert!(matches!(
      err,
      TensorError::ChannelMismatch {
        expected: 3,
        actual: 4
      }
    ));
  }

  #[test]
  fn folded_batch_norm_matches_conv_then_bn() {
    let conv = Conv2d::new(ramp((3, 2, 3, 3)), None, 1, 1, 1);
    let bn = BatchNorm2d {
      weight: Array1::from_vec(vec![0.5, 1.5, -1.0]),
      bias: Array1::from_vec(vec![0.1, -0.2, 0.3]),
      running_mean: Array1::from_vec(vec![0.2, 0.0, -0.4]),
      running_var: Array1::from_vec(vec![1.0, 0.25, 2.0]),
      eps: 1e-3,
    };
    let x = ramp((1, 2, 5, 5));
    let expected = bn.forward(conv.forward(&x).unwrap()).unwrap();
    let folded = bn.fold(&conv).unwrap().forward(&x).unwrap();
    assert!(max_abs_diff(&expected, &folded) < 1e-4);
  }

  #[test]
  fn channel_last_moves_channel_axis() {
    let x = ramp((2, 3, 4, 5));
    let y = to_channel_last(&x);
    assert_eq!(y.dim(), (2, 4, 5, 3));
    assert_eq!(y[[1, 2, 3, 0]], x[[1, 0, 2, 3]]);
  }

  #[test]
  fn odd_spatial_is_rejected() {
    assert!(ensure_even_spatial(&ramp((1, 1, 4, 4))).is_ok());
    assert!(matches!(
      ensure_even_spatial(&ramp((1, 1, 5, 4))),
      Err(TensorError::OddSpatial { .. })
    ));
  }
}
