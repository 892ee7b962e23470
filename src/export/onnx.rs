// 该文件是 Shanan （山南西风） 项目的一部分。
// src/export/onnx.rs - ONNX 导出流程
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

use std::{
  fs,
  path::{Path, PathBuf},
};

use prost::Message;
use tract_onnx::pb::ModelProto;
use tracing::{info, warn};

use super::{
  DryRun, ExportError, ImageSize, MeanStd, SimplifyError, SimplifyReport, check_model, dry_run,
  lower, simplify,
};
use crate::adapter::DeployAdapter;

pub const ONNX_FILE: &str = "exported.onnx";
pub const DEFAULT_OPSET: i64 = 11;
/// `Slice` 以输入张量给出 starts/ends 需要 opset 10
pub const MIN_OPSET: i64 = 10;

/// 计算图化简函数，默认为 [`simplify`]
pub type Simplifier = fn(&ModelProto) -> Result<(ModelProto, SimplifyReport), SimplifyError>;

pub fn encode_model(model: &ModelProto) -> Vec<u8> {
  model.encode_to_vec()
}

/// 一次导出的产物
#[derive(Debug, Clone)]
pub struct ExportReport {
  pub model_path: PathBuf,
  pub mean_std_path: PathBuf,
  pub output_names: Vec<String>,
  /// 未开启或化简失败时为 `None`
  pub simplified: Option<SimplifyReport>,
}

/// ONNX 导出参数
#[derive(Debug, Clone)]
pub struct OnnxExport {
  pub work_dir: PathBuf,
  pub batch_size: usize,
  pub image_size: ImageSize,
  pub opset: i64,
  pub simplify: bool,
  pub simplifier: Simplifier,
  pub seed: u64,
}

impl OnnxExport {
  pub fn new<P: AsRef<Path>>(work_dir: P) -> Self {
    Self {
      work_dir: work_dir.as_ref().to_path_buf(),
      batch_size: 1,
      image_size: ImageSize::default(),
      opset: DEFAULT_OPSET,
      simplify: false,
      simplifier: simplify,
      seed: 0,
    }
  }

  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }

  pub fn with_image_size(mut self, image_size: ImageSize) -> Self {
    self.image_size = image_size;
    self
  }

  pub fn with_opset(mut self, opset: i64) -> Self {
    self.opset = opset;
    self
  }

  pub fn with_simplify(mut self, simplify: bool) -> Self {
    self.simplify = simplify;
    self
  }

  pub fn with_simplifier(mut self, simplifier: Simplifier) -> Self {
    self.simplifier = simplifier;
    self
  }

  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = seed;
    self
  }

  fn try_simplify(
    &self,
    model: &ModelProto,
    dry: &DryRun,
  ) -> Result<(ModelProto, SimplifyReport), ExportError> {
    let (simplified, report) = (self.simplifier)(model)?;
    check_model(&simplified, &dry.input, &dry.outputs, &dry.output_names)?;
    Ok((simplified, report))
  }

  pub fn run(&self, adapter: &DeployAdapter) -> Result<ExportReport, ExportError> {
    if self.opset < MIN_OPSET {
      return Err(ExportError::Opset {
        opset: self.opset,
        min: MIN_OPSET,
      });
    }
    fs::create_dir_all(&self.work_dir)?;

    let dry = dry_run(adapter, self.batch_size, self.image_size, self.seed)?;
    let model = lower(adapter, dry.input_shape(), &dry.output_names, self.opset)?;
    check_model(&model, &dry.input, &dry.outputs, &dry.output_names)?;

    let (model, simplified) = if self.simplify {
      match self.try_simplify(&model, &dry) {
        Ok((simplified, report)) => {
          info!("计算图化简完成: {:?}", report);
          (simplified, Some(report))
        }
        Err(e) => {
          warn!("计算图化简失败, 保存未化简的模型: {}", e);
          (model, None)
        }
      }
    } else {
      (model, None)
    };

    let model_path = self.work_dir.join(ONNX_FILE);
    fs::write(&model_path, encode_model(&model))?;
    info!("ONNX 模型已保存: {}", model_path.display());
    let mean_std_path = MeanStd::from_adapter(adapter).write_to_dir(&self.work_dir)?;

    Ok(ExportReport {
      model_path,
      mean_std_path,
      output_names: dry.output_names,
      simplified,
    })
  }
}
