// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tools/convert.rs - 外部转换命令
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

use std::{path::PathBuf, process::Command};

use tracing::{debug, info};

use super::{ToolError, find_tool};
use crate::{adapter::INPUT_CHANNELS, export::ImageSize};

/// 一次外部转换
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Converter {
  /// `trtexec`，输出序列化引擎
  TensorRt {
    onnx: PathBuf,
    engine: PathBuf,
    fp16: bool,
  },
  /// `onnx2ncnn`，输出 param 与 bin
  Ncnn {
    onnx: PathBuf,
    param: PathBuf,
    bin: PathBuf,
  },
  /// OpenVINO 模型优化器 `mo`
  OpenVino {
    onnx: PathBuf,
    output_dir: PathBuf,
    fp16: bool,
  },
  /// `pnnx`，从追踪程序生成 NCNN 模型
  Pnnx {
    model: PathBuf,
    batch_size: usize,
    image_size: ImageSize,
    device: String,
    fp16: bool,
  },
}

impl Converter {
  pub fn tool_name(&self) -> &'static str {
    match self {
      Converter::TensorRt { .. } => "trtexec",
      Converter::Ncnn { .. } => "onnx2ncnn",
      Converter::OpenVino { .. } => "mo",
      Converter::Pnnx { .. } => "pnnx",
    }
  }

  pub fn input(&self) -> &PathBuf {
    match self {
      Converter::TensorRt { onnx, .. }
      | Converter::Ncnn { onnx, .. }
      | Converter::OpenVino { onnx, .. } => onnx,
      Converter::Pnnx { model, .. } => model,
    }
  }

  /// 输出所在位置，用于成功提示
  pub fn output(&self) -> PathBuf {
    match self {
      Converter::TensorRt { engine, .. } => engine.clone(),
      Converter::Ncnn { param, .. } => param.clone(),
      Converter::OpenVino { output_dir, .. } => output_dir.clone(),
      Converter::Pnnx { model, .. } => model
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".")),
    }
  }

  pub fn args(&self) -> Vec<String> {
    match self {
      Converter::TensorRt { onnx, engine, fp16 } => {
        let mut args = vec![
          format!("--onnx={}", onnx.display()),
          format!("--saveEngine={}", engine.display()),
        ];
        if *fp16 {
          args.push("--fp16".to_string());
        }
        args
      }
      Converter::Ncnn { onnx, param, bin } => vec![
        onnx.display().to_string(),
        param.display().to_string(),
        bin.display().to_string(),
      ],
      Converter::OpenVino {
        onnx,
        output_dir,
        fp16,
      } => vec![
        "--input_model".to_string(),
        onnx.display().to_string(),
        "--output_dir".to_string(),
        output_dir.display().to_string(),
        "--data_type".to_string(),
        if *fp16 { "FP16" } else { "FP32" }.to_string(),
      ],
      Converter::Pnnx {
        model,
        batch_size,
        image_size,
        device,
        fp16,
      } => {
        let mut args = vec![
          model.display().to_string(),
          format!(
            "inputshape=[{},{},{},{}]",
            batch_size, INPUT_CHANNELS, image_size.height, image_size.width
          ),
          format!("device={device}"),
        ];
        if *fp16 {
          args.push("fp16=1".to_string());
        }
        args
      }
    }
  }

  /// 查找工具、确认输入存在后同步执行，继承当前环境变量
  pub fn run(&self, search_path: &[PathBuf]) -> Result<PathBuf, ToolError> {
    let name = self.tool_name();
    let exe = find_tool(name, search_path).ok_or_else(|| ToolError::NotFound {
      name: name.to_string(),
    })?;

    let input = self.input();
    if !input.exists() {
      return Err(ToolError::MissingInput(input.clone()));
    }

    let args = self.args();
    info!("执行: {} {}", exe.display(), args.join(" "));
    let status = Command::new(&exe)
      .args(&args)
      .status()
      .map_err(|source| ToolError::Spawn {
        tool: name.to_string(),
        source,
      })?;
    debug!("{} 退出状态: {}", name, status);

    if !status.success() {
      return Err(ToolError::Failed {
        tool: name.to_string(),
        code: status.code(),
      });
    }
    Ok(exe)
  }
}
