// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/tools.rs - 外部转换工具测试
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

use std::fs;

use shanan_export::tools::{Converter, ToolError, find_tool};

#[test]
fn missing_tool_writes_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let onnx = dir.path().join("exported.onnx");
  fs::write(&onnx, b"onnx").unwrap();
  let engine = dir.path().join("model.engine");

  let converter = Converter::TensorRt {
    onnx,
    engine: engine.clone(),
    fp16: false,
  };
  let search = vec![dir.path().join("bin")];
  assert!(matches!(
    converter.run(&search),
    Err(ToolError::NotFound { name }) if name == "trtexec"
  ));
  assert!(!engine.exists());
}

#[test]
fn missing_input_is_reported_after_discovery() {
  let dir = tempfile::tempdir().unwrap();
  fs::write(dir.path().join("mo"), b"").unwrap();
  let output_dir = dir.path().join("openvino");

  let converter = Converter::OpenVino {
    onnx: dir.path().join("missing.onnx"),
    output_dir: output_dir.clone(),
    fp16: true,
  };
  assert!(matches!(
    converter.run(&[dir.path().to_path_buf()]),
    Err(ToolError::MissingInput(path)) if path == dir.path().join("missing.onnx")
  ));
  assert!(!output_dir.exists());
}

/// 执行脚本的场景集中在一个测试里，脚本写完后才会被执行
#[cfg(unix)]
#[test]
fn scripted_tools_run_synchronously() {
  use std::os::unix::fs::PermissionsExt;

  let dir = tempfile::tempdir().unwrap();
  let bin = dir.path().join("bin");
  fs::create_dir(&bin).unwrap();

  let script = |name: &str, body: &str| {
    let path = bin.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
  };
  let record = dir.path().join("args.txt");
  let trtexec = script("trtexec", &format!("echo \"$@\" > {}", record.display()));
  script("onnx2ncnn", "exit 3");

  let onnx = dir.path().join("exported.onnx");
  fs::write(&onnx, b"onnx").unwrap();
  let search = vec![bin.clone()];
  assert_eq!(find_tool("trtexec", &search), Some(trtexec.clone()));

  let converter = Converter::TensorRt {
    onnx: onnx.clone(),
    engine: dir.path().join("model.engine"),
    fp16: true,
  };
  assert_eq!(converter.run(&search).unwrap(), trtexec);
  let recorded = fs::read_to_string(&record).unwrap();
  assert_eq!(
    recorded.trim(),
    format!(
      "--onnx={} --saveEngine={} --fp16",
      onnx.display(),
      dir.path().join("model.engine").display()
    )
  );

  let failing = Converter::Ncnn {
    onnx,
    param: dir.path().join("model.param"),
    bin: dir.path().join("model.bin"),
  };
  assert!(matches!(
    failing.run(&search),
    Err(ToolError::Failed { tool, code: Some(3) }) if tool == "onnx2ncnn"
  ));
}
