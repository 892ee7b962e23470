// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/export_nnef.rs - 导出 NNEF 追踪程序
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
  export::NnefExport,
};

/// 把检测模型导出为 NNEF 追踪程序
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub model: ModelArgs,

  #[command(flatten)]
  pub shape: ShapeArgs,

  #[command(flatten)]
  pub output: WorkDirArgs,

  /// 空跑输入的随机种子
  #[arg(long, default_value = "0", value_name = "SEED")]
  pub seed: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型配置: {}", args.model.config.display());
  info!("权重文件: {}", args.model.checkpoint.display());

  let image_size = args.shape.image_size()?;
  let adapter = args.model.build_adapter(Backend::TorchScript)?;

  let report = NnefExport::new(&args.output.work_dir)
    .with_batch_size(args.shape.batch_size)
    .with_image_size(image_size)
    .with_seed(args.seed)
    .run(&adapter)
    .context("追踪程序导出失败")?;

  println!("追踪程序导出成功, 保存至 {}", report.model_path.display());
  Ok(())
}
