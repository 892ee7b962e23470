// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/onnx2ncnn.rs - ONNX 转 NCNN 模型
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use shanan_export::tools::{Converter, path_entries};

/// 调用 onnx2ncnn 生成 param 与 bin 文件
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型路径
  #[arg(value_name = "ONNX")]
  pub onnx: PathBuf,

  /// param 文件保存路径
  #[arg(value_name = "PARAM")]
  pub param: PathBuf,

  /// bin 文件保存路径
  #[arg(value_name = "BIN")]
  pub bin: PathBuf,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("ONNX 模型: {}", args.onnx.display());

  let converter = Converter::Ncnn {
    onnx: args.onnx,
    param: args.param,
    bin: args.bin,
  };
  converter.run(&path_entries())?;

  println!("NCNN 导出成功, 保存至 {}", converter.output().display());
  Ok(())
}
