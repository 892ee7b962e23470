// 该文件是 Shanan （山南西风） 项目的一部分。
// src/export/lower.rs - 部署模型降级为 ONNX 计算图
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

use tract_onnx::pb::ModelProto;
use tracing::debug;

use super::{ExportError, GraphBuilder};
use crate::{
  adapter::{DeployAdapter, check_paired},
  nn::{ConvModule, Layer},
  tensor::FOCUS_PATCHES,
};

pub const INPUT_NAME: &str = "images";

fn lower_conv_module(
  g: &mut GraphBuilder,
  x: &str,
  module: &ConvModule,
  path: &str,
) -> Result<String, ExportError> {
  let fused = module.fused()?;
  let y = g.conv(x, &fused, path)?;
  g.activation(&y, module.act, path)
}

fn lower_layer(
  g: &mut GraphBuilder,
  x: &str,
  path: &str,
  layer: &Layer,
) -> Result<String, ExportError> {
  let not_deployable = || ExportError::NotDeployable {
    path: path.to_string(),
    kind: layer.kind(),
  };

  match layer {
    Layer::Conv(module) => lower_conv_module(g, x, module, path),
    Layer::RepVgg(block) => {
      let conv = block.reparam().ok_or_else(not_deployable)?;
      let y = g.conv(x, conv, path)?;
      g.activation(&y, block.act(), path)
    }
    Layer::Focus(_) => Err(not_deployable()),
    Layer::SliceFocus(focus) => {
      let parts = FOCUS_PATCHES
        .iter()
        .map(|&(row, col)| g.slice_spatial(x, row, col, path))
        .collect::<Result<Vec<_>, _>>()?;
      let y = g.concat(&parts, 1, path)?;
      lower_conv_module(g, &y, &focus.conv, &format!("{path}.conv"))
    }
    Layer::ShuffleFocus(focus) => {
      let y = g.conv(x, &focus.space_to_depth, path)?;
      let shape = g.shape(&y)?.to_vec();
      let &[n, c4, h, w] = shape.as_slice() else {
        return Err(ExportError::Graph(format!("{path}: 非 4 维输出")));
      };
      let c = focus.in_channels();
      let y = g.reshape(&y, &[n, c, 4, h, w], path)?;
      let y = g.transpose(&y, &[0, 2, 1, 3, 4], path)?;
      let y = g.reshape(&y, &[n, c4, h, w], path)?;
      lower_conv_module(g, &y, &focus.conv, &format!("{path}.conv"))
    }
    Layer::GConvFocus(focus) => {
      let parts = focus
        .kernels
        .iter()
        .map(|kernel| g.conv(x, kernel, path))
        .collect::<Result<Vec<_>, _>>()?;
      let y = g.concat(&parts, 1, path)?;
      lower_conv_module(g, &y, &focus.conv, &format!("{path}.conv"))
    }
  }
}

/// 把改写后的模型降级为静态形状的 ONNX 计算图
///
/// 输出顺序与 [`DeployAdapter::forward`] 一致，名称取自 `output_names`。
pub fn lower(
  adapter: &DeployAdapter,
  input_shape: [usize; 4],
  output_names: &[String],
  opset: i64,
) -> Result<ModelProto, ExportError> {
  let model = adapter.model();
  let mut g = GraphBuilder::new();
  let images = g.input(INPUT_NAME, &input_shape);

  let mut x = lower_layer(&mut g, &images, "backbone.stem", &model.backbone.stem)?;
  let mut features = Vec::with_capacity(model.backbone.out_indices.len());
  for (i, stage) in model.backbone.stages.iter().enumerate() {
    for (j, layer) in stage.iter().enumerate() {
      x = lower_layer(&mut g, &x, &format!("backbone.stage{}.{}", i + 1, j), layer)?;
    }
    if model.backbone.out_indices.contains(&i) {
      features.push(x.clone());
    }
  }

  let head = &model.bbox_head;
  check_paired(head)?;
  head.check_levels(features.len())?;
  let mut scores = Vec::with_capacity(features.len());
  for (level, (feature, conv)) in features.iter().zip(&head.cls_preds).enumerate() {
    scores.push(g.conv(feature, conv, &format!("bbox_head.cls_preds.{level}"))?);
  }
  let mut boxes = Vec::with_capacity(features.len());
  for (level, (feature, conv)) in features.iter().zip(&head.reg_preds).enumerate() {
    boxes.push(g.conv(feature, conv, &format!("bbox_head.reg_preds.{level}"))?);
  }
  let mut outputs = Vec::with_capacity(scores.len() * 2);
  for (score, bbox) in scores.into_iter().zip(boxes) {
    outputs.push(score);
    outputs.push(bbox);
  }
  if adapter.force_transpose() {
    outputs = outputs
      .iter()
      .map(|value| g.transpose(value, &[0, 2, 3, 1], "force_transpose"))
      .collect::<Result<Vec<_>, _>>()?;
  }

  if outputs.len() != output_names.len() {
    return Err(ExportError::Graph(format!(
      "计算图有 {} 个输出, 但提供了 {} 个输出名",
      outputs.len(),
      output_names.len()
    )));
  }
  for (value, name) in outputs.iter().zip(output_names) {
    g.mark_output(value, name)?;
  }

  debug!(
    "计算图降级完成: {} 个节点, {} 个输出",
    g.num_nodes(),
    outputs.len()
  );
  Ok(g.finish(&format!("shanan_{}", adapter.backend()), opset))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    backend::Backend,
    export::output_names,
    model::{DetectorBuilder, ModelConfig},
    weights::RandomInit,
  };
  use ndarray::Array4;

  const CONFIG: &str = r#"
[data_preprocessor]
mean = [0.0, 0.0, 0.0]
std = [1.0, 1.0, 1.0]

[backbone]
out_indices = [0, 1]

[backbone.stem]
type = "focus"
out_channels = 4

[[backbone.stages]]
out_channels = 8
num_blocks = 1

[[backbone.stages]]
out_channels = 8
num_blocks = 1

[bbox_head]
num_classes = 3
"#;

  fn adapter(backend: Backend) -> DeployAdapter {
    let model = DetectorBuilder::new(ModelConfig::from_toml_str(CONFIG).unwrap())
      .build(&mut RandomInit::seeded(21))
      .unwrap();
    DeployAdapter::new(model, backend).unwrap()
  }

  fn names(adapter: &DeployAdapter) -> Vec<String> {
    let outputs = adapter.forward(&Array4::zeros((1, 3, 32, 32))).unwrap();
    output_names(&outputs)
  }

  fn op_types(model: &ModelProto) -> Vec<String> {
    model
      .graph
      .as_ref()
      .unwrap()
      .node
      .iter()
      .map(|n| n.op_type.clone())
      .collect()
  }

  #[test]
  fn focus_lowering_depends_on_backend() {
    for backend in Backend::ALL {
      let adapter = adapter(backend);
      let model = lower(&adapter, [1, 3, 32, 32], &names(&adapter), 11).unwrap();
      let ops = op_types(&model);
      let slices = ops.iter().filter(|op| *op == "Slice").count();
      let reshapes = ops.iter().filter(|op| *op == "Reshape").count();
      match backend {
        Backend::OnnxRuntime | Backend::TensorRt => assert_eq!((slices, reshapes), (4, 0)),
        Backend::Ncnn => assert_eq!((slices, reshapes), (0, 2)),
        Backend::TorchScript => assert_eq!((slices, reshapes), (0, 0)),
      }
    }
  }

  #[test]
  fn outputs_carry_the_given_names() {
    let adapter = adapter(Backend::TensorRt);
    let names = names(&adapter);
    assert_eq!(names, vec!["score_8x8", "bbox_8x8", "score_4x4", "bbox_4x4"]);
    let model = lower(&adapter, [1, 3, 32, 32], &names, 11).unwrap();
    let graph = model.graph.unwrap();
    let outputs: Vec<&str> = graph.output.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(outputs, names);
    assert_eq!(graph.input[0].name, INPUT_NAME);
  }

  #[test]
  fn wrong_number_of_names_is_rejected() {
    let adapter = adapter(Backend::Ncnn);
    let names = vec!["score_8x8".to_string()];
    assert!(matches!(
      lower(&adapter, [1, 3, 32, 32], &names, 11),
      Err(ExportError::Graph(_))
    ));
  }
}
