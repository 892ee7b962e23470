// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tools.rs - 外部转换工具
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

use thiserror::Error;

mod convert;
mod discover;

pub use self::convert::Converter;
pub use self::discover::{find_tool, path_entries};

#[derive(Error, Debug)]
pub enum ToolError {
  #[error("在 PATH 中没有找到 {name}")]
  NotFound { name: String },
  #[error("输入文件不存在: {0}")]
  MissingInput(PathBuf),
  #[error("无法启动 {tool}: {source}")]
  Spawn {
    tool: String,
    #[source]
    source: std::io::Error,
  },
  #[error("{tool} 执行失败, 退出码: {code:?}")]
  Failed { tool: String, code: Option<i32> },
}
