// 该文件是 Shanan （山南西风） 项目的一部分。
// src/backend.rs - 部署后端标签
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

use std::{fmt, str::FromStr};

use thiserror::Error;

/// 导出目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
  /// 通用计算图导出（ONNX）
  OnnxRuntime,
  /// 硬件加速引擎
  TensorRt,
  /// 移动端推理
  Ncnn,
  /// 追踪程序
  #[default]
  TorchScript,
}

/// Focus 的部署替代方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusStrategy {
  Slice,
  Shuffle,
  GroupConv,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("未知的部署后端: {0}（可选: onnxruntime, tensorrt, ncnn, torchscript）")]
pub struct UnknownBackend(pub String);

impl Backend {
  pub const ALL: [Backend; 4] = [
    Backend::OnnxRuntime,
    Backend::TensorRt,
    Backend::Ncnn,
    Backend::TorchScript,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Backend::OnnxRuntime => "onnxruntime",
      Backend::TensorRt => "tensorrt",
      Backend::Ncnn => "ncnn",
      Backend::TorchScript => "torchscript",
    }
  }

  pub fn focus_strategy(self) -> FocusStrategy {
    match self {
      Backend::TensorRt | Backend::OnnxRuntime => FocusStrategy::Slice,
      Backend::Ncnn => FocusStrategy::Shuffle,
      Backend::TorchScript => FocusStrategy::GroupConv,
    }
  }
}

impl fmt::Display for Backend {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Backend {
  type Err = UnknownBackend;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "onnxruntime" | "onnx" => Ok(Backend::OnnxRuntime),
      "tensorrt" | "trt" => Ok(Backend::TensorRt),
      "ncnn" => Ok(Backend::Ncnn),
      "torchscript" | "traced" => Ok(Backend::TorchScript),
      _ => Err(UnknownBackend(s.to_string())),
    }
  }
}
