// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/traced2ncnn.rs - 追踪程序经 pnnx 转换为 NCNN
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

use shanan_export::{
  args::ShapeArgs,
  tools::{Converter, path_entries},
};

/// 调用 pnnx 把追踪程序转换为 NCNN 模型
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 追踪程序路径
  #[arg(value_name = "MODEL")]
  pub model: PathBuf,

  #[command(flatten)]
  pub shape: ShapeArgs,

  /// 转换使用的设备
  #[arg(long, default_value = "cpu", value_name = "DEVICE")]
  pub device: String,

  /// 半精度
  #[arg(long)]
  pub fp16: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("追踪程序: {}", args.model.display());

  let converter = Converter::Pnnx {
    model: args.model,
    batch_size: args.shape.batch_size,
    image_size: args.shape.image_size()?,
    device: args.device,
    fp16: args.fp16,
  };
  converter.run(&path_entries())?;

  println!("NCNN 导出成功, 保存至 {}", converter.output().display());
  Ok(())
}
