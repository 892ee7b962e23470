// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 导出工具共用的命令行参数
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

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::{
  adapter::DeployAdapter,
  backend::Backend,
  export::{ExportError, ImageSize},
  model::DetectorBuilder,
  weights::Checkpoint,
};

/// 模型配置与权重
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
  /// 模型结构配置文件（TOML）
  #[arg(value_name = "CONFIG")]
  pub config: PathBuf,

  /// 权重文件（safetensors）
  #[arg(value_name = "CHECKPOINT")]
  pub checkpoint: PathBuf,
}

impl ModelArgs {
  /// 构建模型并包装为指定后端的部署形态
  pub fn build_adapter(&self, backend: Backend) -> Result<DeployAdapter> {
    let builder = DetectorBuilder::from_config_path(&self.config)
      .with_context(|| format!("无法加载模型配置 {}", self.config.display()))?;
    let mut checkpoint = Checkpoint::open(&self.checkpoint)
      .with_context(|| format!("无法加载权重 {}", self.checkpoint.display()))?;
    let model = builder.build(&mut checkpoint).context("模型构建失败")?;
    checkpoint.warn_unused();

    let adapter = DeployAdapter::new(model, backend).context("部署改写失败")?;
    info!("模型已就绪, 后端: {}", adapter.backend());
    Ok(adapter)
  }
}

/// 导出产物目录，不存在时自动创建
#[derive(Args, Debug, Clone)]
pub struct WorkDirArgs {
  /// 输出目录
  #[arg(long, default_value = "./work_dir", value_name = "DIR")]
  pub work_dir: PathBuf,
}

/// 输入形状
#[derive(Args, Debug, Clone)]
pub struct ShapeArgs {
  /// 图像尺寸，一个值表示正方形，两个值依次为高和宽
  #[arg(long, num_args = 1..=2, default_values_t = vec![640, 640], value_name = "SIZE")]
  pub img_size: Vec<usize>,

  /// 批大小
  #[arg(long, default_value = "1", value_name = "N")]
  pub batch_size: usize,
}

impl ShapeArgs {
  pub fn image_size(&self) -> Result<ImageSize, ExportError> {
    ImageSize::from_dims(&self.img_size)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;

  #[derive(Parser, Debug)]
  struct Cli {
    #[command(flatten)]
    shape: ShapeArgs,
  }

  #[test]
  fn default_image_size_is_640() {
    let cli = Cli::try_parse_from(["test"]).unwrap();
    assert_eq!(cli.shape.image_size().unwrap(), ImageSize::default());
    assert_eq!(cli.shape.batch_size, 1);
  }

  #[test]
  fn single_image_size_expands_to_square() {
    let cli = Cli::try_parse_from(["test", "--img-size", "320"]).unwrap();
    assert_eq!(
      cli.shape.image_size().unwrap(),
      ImageSize {
        height: 320,
        width: 320
      }
    );
  }

  #[test]
  fn three_image_sizes_are_rejected() {
    assert!(Cli::try_parse_from(["test", "--img-size", "1", "2", "3"]).is_err());
  }
}
