// 该文件是 Shanan （山南西风） 项目的一部分。
// src/export.rs - 模型导出
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
use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;
use tract_onnx::prelude::TractError;
use tracing::{debug, info};

use crate::{
  adapter::{AdapterError, DeployAdapter, INPUT_CHANNELS},
  nn::LayerKind,
  tensor::TensorError,
};

mod artifact;
mod check;
mod graph;
mod lower;
mod nnef;
mod onnx;
mod simplify;

pub use self::artifact::{MEAN_STD_FILE, MeanStd};
pub use self::check::{TOLERANCE, check_model, run_onnx};
pub use self::graph::GraphBuilder;
pub use self::lower::{INPUT_NAME, lower};
pub use self::nnef::{NNEF_FILE, NnefExport, write_nnef};
pub use self::onnx::{
  DEFAULT_OPSET, ExportReport, MIN_OPSET, ONNX_FILE, OnnxExport, Simplifier, encode_model,
};
pub use self::simplify::{SimplifyError, SimplifyReport, simplify};

#[derive(Error, Debug)]
pub enum ExportError {
  #[error("图像尺寸必须为 1 个或 2 个正整数, 实际为 {0:?}")]
  ImageSize(Vec<usize>),
  #[error("批大小必须大于 0")]
  BatchSize,
  #[error("ONNX 算子集版本至少为 {min}, 实际为 {opset}")]
  Opset { opset: i64, min: i64 },
  #[error("文件读写错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("模型前向错误: {0}")]
  Adapter(#[from] AdapterError),
  #[error("张量运算错误: {0}")]
  Tensor(#[from] TensorError),
  #[error("{path} 处的 {kind} 无法导出, 未处于部署形态")]
  NotDeployable { path: String, kind: LayerKind },
  #[error("计算图构建错误: {0}")]
  Graph(String),
  #[error("tract 错误: {0}")]
  Tract(TractError),
  #[error("导出模型校验失败: {0}")]
  CheckFailed(String),
  #[error("计算图化简失败: {0}")]
  Simplify(#[from] SimplifyError),
}

/// 输入图像尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
  pub height: usize,
  pub width: usize,
}

impl ImageSize {
  /// 一个值表示正方形，两个值依次为高和宽
  pub fn from_dims(dims: &[usize]) -> Result<Self, ExportError> {
    match *dims {
      [side] if side > 0 => Ok(Self {
        height: side,
        width: side,
      }),
      [height, width] if height > 0 && width > 0 => Ok(Self { height, width }),
      _ => Err(ExportError::ImageSize(dims.to_vec())),
    }
  }
}

impl Default for ImageSize {
  fn default() -> Self {
    Self {
      height: 640,
      width: 640,
    }
  }
}

/// 空跑一次前向得到的输入、输出与输出名
#[derive(Debug, Clone)]
pub struct DryRun {
  pub input: Array4<f32>,
  pub outputs: Vec<Array4<f32>>,
  pub output_names: Vec<String>,
}

impl DryRun {
  pub fn input_shape(&self) -> [usize; 4] {
    let (n, c, h, w) = self.input.dim();
    [n, c, h, w]
  }
}

/// 偶数位为 `score_{H}x{W}`，奇数位为 `bbox_{H}x{W}`，取输出的第 1、2 维
pub fn output_names(outputs: &[Array4<f32>]) -> Vec<String> {
  outputs
    .iter()
    .enumerate()
    .map(|(i, output)| {
      let (_, d1, d2, _) = output.dim();
      let kind = if i % 2 == 1 { "bbox" } else { "score" };
      format!("{kind}_{d1}x{d2}")
    })
    .collect()
}

pub fn synthetic_input(batch_size: usize, size: ImageSize, seed: u64) -> Array4<f32> {
  let mut rng = StdRng::seed_from_u64(seed);
  Array4::from_shape_simple_fn((batch_size, INPUT_CHANNELS, size.height, size.width), || {
    rng.r#gen::<f32>()
  })
}

pub fn dry_run(
  adapter: &DeployAdapter,
  batch_size: usize,
  size: ImageSize,
  seed: u64,
) -> Result<DryRun, ExportError> {
  if batch_size == 0 {
    return Err(ExportError::BatchSize);
  }
  info!(
    "空跑前向: 输入 {}x{}x{}x{}",
    batch_size, INPUT_CHANNELS, size.height, size.width
  );
  let input = synthetic_input(batch_size, size, seed);
  let outputs = adapter.forward(&input)?;
  let output_names = output_names(&outputs);
  for (name, output) in output_names.iter().zip(&outputs) {
    debug!("输出 {}: {:?}", name, output.shape());
  }
  Ok(DryRun {
    input,
    outputs,
    output_names,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_image_size_is_square() {
    assert_eq!(
      ImageSize::from_dims(&[320]).unwrap(),
      ImageSize {
        height: 320,
        width: 320
      }
    );
    assert_eq!(
      ImageSize::from_dims(&[480, 640]).unwrap(),
      ImageSize {
        height: 480,
        width: 640
      }
    );
  }

  #[test]
  fn bad_image_sizes_are_rejected() {
    assert!(ImageSize::from_dims(&[]).is_err());
    assert!(ImageSize::from_dims(&[1, 2, 3]).is_err());
    assert!(ImageSize::from_dims(&[0, 640]).is_err());
  }

  #[test]
  fn names_alternate_score_and_bbox() {
    let outputs = vec![
      Array4::<f32>::zeros((1, 80, 80, 3)),
      Array4::<f32>::zeros((1, 80, 80, 4)),
      Array4::<f32>::zeros((1, 40, 40, 3)),
      Array4::<f32>::zeros((1, 40, 40, 4)),
    ];
    assert_eq!(
      output_names(&outputs),
      vec!["score_80x80", "bbox_80x80", "score_40x40", "bbox_40x40"]
    );
  }

  #[test]
  fn synthetic_input_is_seeded() {
    let size = ImageSize::from_dims(&[8]).unwrap();
    assert_eq!(synthetic_input(2, size, 3), synthetic_input(2, size, 3));
    assert_eq!(synthetic_input(2, size, 3).dim(), (2, 3, 8, 8));
  }
}
