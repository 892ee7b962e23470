// 该文件是 Shanan （山南西风） 项目的一部分。
// src/export/artifact.rs - 导出附带的归一化参数文件
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

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::ExportError;
use crate::adapter::DeployAdapter;

pub const MEAN_STD_FILE: &str = "mean_std.json";

/// `mean_std.json` 的内容，推理端据此归一化输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanStd {
  pub mean: Vec<f32>,
  pub std: Vec<f32>,
}

impl MeanStd {
  pub fn from_adapter(adapter: &DeployAdapter) -> Self {
    Self {
      mean: adapter.mean().to_vec(),
      std: adapter.std().to_vec(),
    }
  }

  /// 写入 `dir/mean_std.json`，返回文件路径
  pub fn write_to_dir(&self, dir: &Path) -> Result<std::path::PathBuf, ExportError> {
    let path = dir.join(MEAN_STD_FILE);
    fs::write(&path, serde_json::to_string(self)?)?;
    info!("归一化参数已保存: {}", path.display());
    Ok(path)
  }

  pub fn read(path: &Path) -> Result<Self, ExportError> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
  }
}
