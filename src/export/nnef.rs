// 该文件是 Shanan （山南西风） 项目的一部分。
// src/export/nnef.rs - 追踪程序（NNEF）导出流程
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
  fs::{self, File},
  io::BufWriter,
  path::{Path, PathBuf},
};

use tract_onnx::pb::ModelProto;
use tract_onnx::prelude::*;
use tracing::{info, warn};

use super::{
  DEFAULT_OPSET, ExportError, ExportReport, ImageSize, MeanStd, check_model, dry_run,
  encode_model, lower,
};
use crate::{adapter::DeployAdapter, backend::Backend};

pub const NNEF_FILE: &str = "exported.nnef.tar";

/// 经 tract 类型化、去冗余后写为 NNEF tar 包
pub fn write_nnef(model: &ModelProto, path: &Path) -> Result<(), ExportError> {
  let bytes = encode_model(model);
  let typed = tract_onnx::onnx()
    .model_for_read(&mut &*bytes)
    .and_then(|model| model.into_typed())
    .and_then(|model| model.into_decluttered())
    .map_err(ExportError::Tract)?;

  let file = BufWriter::new(File::create(path)?);
  let file = tract_nnef::nnef()
    .with_tract_core()
    .write_to_tar(&typed, file)
    .map_err(ExportError::Tract)?;
  file.into_inner().map_err(|e| e.into_error())?;
  Ok(())
}

#[derive(Debug, Clone)]
pub struct NnefExport {
  pub work_dir: PathBuf,
  pub batch_size: usize,
  pub image_size: ImageSize,
  pub seed: u64,
}

impl NnefExport {
  pub fn new<P: AsRef<Path>>(work_dir: P) -> Self {
    Self {
      work_dir: work_dir.as_ref().to_path_buf(),
      batch_size: 1,
      image_size: ImageSize::default(),
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

  pub fn with_seed(mut self, seed: u64) -> Self {
    self.seed = seed;
    self
  }

  pub fn run(&self, adapter: &DeployAdapter) -> Result<ExportReport, ExportError> {
    if adapter.backend() != Backend::TorchScript {
      warn!(
        "追踪程序通常使用 {} 后端, 当前为 {}",
        Backend::TorchScript,
        adapter.backend()
      );
    }
    fs::create_dir_all(&self.work_dir)?;

    let dry = dry_run(adapter, self.batch_size, self.image_size, self.seed)?;
    let model = lower(adapter, dry.input_shape(), &dry.output_names, DEFAULT_OPSET)?;
    check_model(&model, &dry.input, &dry.outputs, &dry.output_names)?;

    let model_path = self.work_dir.join(NNEF_FILE);
    write_nnef(&model, &model_path)?;
    info!("追踪程序已保存: {}", model_path.display());
    let mean_std_path = MeanStd::from_adapter(adapter).write_to_dir(&self.work_dir)?;

    Ok(ExportReport {
      model_path,
      mean_std_path,
      output_names: dry.output_names,
      simplified: None,
    })
  }
}
