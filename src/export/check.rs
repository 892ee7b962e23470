// 该文件是 Shanan （山南西风） 项目的一部分。
// src/export/check.rs - 导出模型校验
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
use prost::Message;
use tract_onnx::pb::ModelProto;
use tract_onnx::prelude::*;
use tracing::{debug, info};

use super::ExportError;
use crate::tensor::TensorError;

/// 相对误差容限
pub const TOLERANCE: f32 = 1e-3;

/// 用 tract 重新加载并执行 ONNX 模型，返回每个输出的形状和数据
pub fn run_onnx(
  model: &ModelProto,
  input: &Array4<f32>,
) -> Result<Vec<(Vec<usize>, Vec<f32>)>, ExportError> {
  let bytes = model.encode_to_vec();
  let plan = tract_onnx::onnx()
    .model_for_read(&mut &*bytes)
    .and_then(|model| model.into_optimized())
    .and_then(|model| model.into_runnable())
    .map_err(ExportError::Tract)?;

  let input = input.as_standard_layout();
  let data = input.as_slice().ok_or(TensorError::NonContiguous)?;
  let tensor = Tensor::from_shape::<f32>(input.shape(), data).map_err(ExportError::Tract)?;
  let outputs = plan
    .run(tvec!(tensor.into()))
    .map_err(ExportError::Tract)?;

  outputs
    .iter()
    .map(|output| {
      let values = output.as_slice::<f32>().map_err(ExportError::Tract)?;
      Ok((output.shape().to_vec(), values.to_vec()))
    })
    .collect()
}

/// 校验导出模型与参考输出一致，误差超过 [`TOLERANCE`] 即失败
pub fn check_model(
  model: &ModelProto,
  input: &Array4<f32>,
  expected: &[Array4<f32>],
  names: &[String],
) -> Result<(), ExportError> {
  let actual = run_onnx(model, input)?;
  if actual.len() != expected.len() {
    return Err(ExportError::CheckFailed(format!(
      "输出个数 {} 与参考 {} 不一致",
      actual.len(),
      expected.len()
    )));
  }

  for (((shape, values), reference), name) in actual.iter().zip(expected).zip(names) {
    if shape.as_slice() != reference.shape() {
      return Err(ExportError::CheckFailed(format!(
        "{name}: 形状 {shape:?} 与参考 {:?} 不一致",
        reference.shape()
      )));
    }
    let mut worst = 0.0f32;
    for (a, e) in values.iter().zip(reference.iter()) {
      let err = (a - e).abs() / (1.0 + e.abs());
      if err.is_nan() || err > TOLERANCE {
        return Err(ExportError::CheckFailed(format!(
          "{name}: 误差 {err} 超过容限 {TOLERANCE}"
        )));
      }
      worst = worst.max(err);
    }
    debug!("{}: 最大相对误差 {:.2e}", name, worst);
  }
  info!("导出模型校验通过: {} 个输出", actual.len());
  Ok(())
}
