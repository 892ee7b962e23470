// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tools/discover.rs - 可执行文件查找
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
  env, fs,
  path::{Path, PathBuf},
};

use tracing::debug;

/// 当前进程的 `PATH`，每次调用重新读取
pub fn path_entries() -> Vec<PathBuf> {
  env::var_os("PATH")
    .map(|paths| env::split_paths(&paths).collect())
    .unwrap_or_default()
}

fn stem_is(path: &Path, name: &str) -> bool {
  path.file_stem().is_some_and(|stem| stem == name)
}

fn file_name_is(path: &Path, name: &str) -> bool {
  path.file_name().is_some_and(|file| file == name)
}

/// 按顺序查找名为 `name` 的工具
///
/// 条目本身是文件时按文件名主干匹配；是目录时查找其中文件名或主干为 `name` 的子项。
/// 返回第一个匹配。
pub fn find_tool(name: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
  for entry in search_path {
    if entry.is_file() {
      if stem_is(entry, name) {
        debug!("找到 {}: {}", name, entry.display());
        return Some(entry.clone());
      }
    } else if entry.is_dir() {
      let Ok(children) = fs::read_dir(entry) else {
        continue;
      };
      let mut children: Vec<PathBuf> = children.flatten().map(|child| child.path()).collect();
      children.sort();
      if let Some(found) = children
        .iter()
        .find(|child| file_name_is(child, name))
        .or_else(|| children.iter().find(|child| stem_is(child, name)))
      {
        debug!("找到 {}: {}", name, found.display());
        return Some(found.clone());
      }
    }
  }
  None
}
