// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/export_onnx.rs - 导出 ONNX 计算图
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

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use shanan_export::{
  Backend,
  args::{ModelArgs, ShapeArgs, WorkDirArgs},
  export::{DEFAULT_OPSET, MIN_OPSET, OnnxExport},
};

/// 把检测模型导出为 ONNX
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub model: ModelArgs,

  #[command(flatten)]
  pub shape: ShapeArgs,

  #[command(flatten)]
  pub output: WorkDirArgs,

  /// ONNX 算子集版本，至少为 10
  #[arg(
    long,
    default_value_t = DEFAULT_OPSET,
    value_name = "VERSION",
    value_parser = clap::value_parser!(i64).range(MIN_OPSET..)
  )]
  pub opset: i64,

  /// 导出后化简计算图
  #[arg(long)]
  pub simplify: bool,

  /// 部署后端: onnxruntime, tensorrt, ncnn
  #[arg(long, default_value = "onnxruntime", value_name = "BACKEND")]
  pub backend: Backend,

  /// 空跑输入的随机种子
  #[arg(long, default_value = "0", value_name = "SEED")]
  pub seed: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型配置: {}", args.model.config.display());
  info!("权重文件: {}", args.model.checkpoint.display());
  info!("输出目录: {}", args.output.work_dir.display());

  let image_size = args.shape.image_size()?;
  let adapter = args.model.build_adapter(args.backend)?;

  let report = OnnxExport::new(&args.output.work_dir)
    .with_batch_size(args.shape.batch_size)
    .with_image_size(image_size)
    .with_opset(args.opset)
    .with_simplify(args.simplify)
    .with_seed(args.seed)
    .run(&adapter)
    .context("ONNX 导出失败")?;

  info!("输出: {}", report.output_names.join(", "));
  println!("ONNX 导出成功, 保存至 {}", report.model_path.display());
  Ok(())
}
