// 该文件是 Shanan （山南西风） 项目的一部分。
// src/export/simplify.rs - ONNX 计算图化简
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

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tract_onnx::pb::{GraphProto, ModelProto, NodeProto, TensorProto};
use tracing::debug;

#[derive(Error, Debug)]
pub enum SimplifyError {
  #[error("模型中缺少计算图")]
  MissingGraph,
  #[error("节点 {node} 引用了未定义的张量 {value}")]
  Dangling { node: String, value: String },
  #[error("图输出 {0} 没有被任何节点产生")]
  UnproducedOutput(String),
}

/// 化简统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimplifyReport {
  pub merged_constants: usize,
  pub removed_transposes: usize,
  pub merged_reshapes: usize,
  pub pruned_initializers: usize,
}

type ConstantKey = (Vec<i64>, i32, Vec<u32>, Vec<i64>, Vec<u8>);

fn constant_key(tensor: &TensorProto) -> ConstantKey {
  (
    tensor.dims.clone(),
    tensor.data_type,
    tensor.float_data.iter().map(|v| v.to_bits()).collect(),
    tensor.int64_data.clone(),
    tensor.raw_data.clone(),
  )
}

fn consumers(graph: &GraphProto, value: &str) -> usize {
  graph
    .node
    .iter()
    .flat_map(|node| &node.input)
    .filter(|input| input.as_str() == value)
    .count()
}

fn is_graph_output(graph: &GraphProto, value: &str) -> bool {
  graph.output.iter().any(|o| o.name == value)
}

fn rename_inputs(graph: &mut GraphProto, from: &str, to: &str) {
  for node in &mut graph.node {
    for input in node.input.iter_mut().filter(|i| i.as_str() == from) {
      *input = to.to_string();
    }
  }
}

fn ints_attribute<'a>(node: &'a NodeProto, name: &str) -> Option<&'a [i64]> {
  node
    .attribute
    .iter()
    .find(|a| a.name == name)
    .map(|a| a.ints.as_slice())
}

/// 内容相同的常量只保留一份
fn merge_constants(graph: &mut GraphProto) -> usize {
  let mut first: HashMap<ConstantKey, String> = HashMap::new();
  let mut renames = Vec::new();
  for tensor in &graph.initializer {
    let key = constant_key(tensor);
    match first.get(&key) {
      Some(kept) => renames.push((tensor.name.clone(), kept.clone())),
      None => {
        first.insert(key, tensor.name.clone());
      }
    }
  }
  for (from, to) in &renames {
    rename_inputs(graph, from, to);
  }
  renames.len()
}

fn find_producer(graph: &GraphProto, value: &str) -> Option<usize> {
  graph
    .node
    .iter()
    .position(|node| node.output.iter().any(|o| o == value))
}

/// 相邻且互逆的两个 Transpose 直接消去
fn cancel_transposes(graph: &mut GraphProto) -> usize {
  let mut removed = 0;
  loop {
    let pair = graph.node.iter().enumerate().find_map(|(second, node)| {
      if node.op_type != "Transpose" || node.input.len() != 1 {
        return None;
      }
      let first = find_producer(graph, &node.input[0])?;
      let producer = &graph.node[first];
      if producer.op_type != "Transpose"
        || consumers(graph, &node.input[0]) != 1
        || is_graph_output(graph, &node.input[0])
        || is_graph_output(graph, &node.output[0])
      {
        return None;
      }
      let outer = ints_attribute(producer, "perm")?;
      let inner = ints_attribute(node, "perm")?;
      let identity = inner.len() == outer.len()
        && inner
          .iter()
          .enumerate()
          .all(|(i, &p)| {
            usize::try_from(p).ok().and_then(|p| outer.get(p)) == Some(&(i as i64))
          });
      identity.then_some((first, second))
    });

    let Some((first, second)) = pair else {
      return removed;
    };
    let source = graph.node[first].input[0].clone();
    let result = graph.node[second].output[0].clone();
    rename_inputs(graph, &result, &source);
    let (low, high) = (first.min(second), first.max(second));
    graph.node.remove(high);
    graph.node.remove(low);
    removed += 2;
  }
}

/// 常量目标形状的连续 Reshape 合并为一个
fn merge_reshapes(graph: &mut GraphProto) -> usize {
  let static_shapes: HashSet<String> = graph
    .initializer
    .iter()
    .filter(|t| !t.int64_data.is_empty() && t.int64_data.iter().all(|&d| d > 0))
    .map(|t| t.name.clone())
    .collect();

  let mut merged = 0;
  loop {
    let pair = graph.node.iter().enumerate().find_map(|(second, node)| {
      if node.op_type != "Reshape"
        || node.input.len() != 2
        || !static_shapes.contains(&node.input[1])
      {
        return None;
      }
      let first = find_producer(graph, &node.input[0])?;
      let producer = &graph.node[first];
      (producer.op_type == "Reshape"
        && consumers(graph, &node.input[0]) == 1
        && !is_graph_output(graph, &node.input[0]))
      .then_some((first, second))
    });

    let Some((first, second)) = pair else {
      return merged;
    };
    let source = graph.node[first].input[0].clone();
    graph.node[second].input[0] = source;
    graph.node.remove(first);
    merged += 1;
  }
}

fn prune_initializers(graph: &mut GraphProto) -> usize {
  let used: HashSet<&str> = graph
    .node
    .iter()
    .flat_map(|node| node.input.iter().map(String::as_str))
    .collect();
  let before = graph.initializer.len();
  let kept: Vec<TensorProto> = graph
    .initializer
    .iter()
    .filter(|t| used.contains(t.name.as_str()))
    .cloned()
    .collect();
  graph.initializer = kept;
  before - graph.initializer.len()
}

/// 节点须按拓扑顺序排列，所有引用都必须有定义
pub fn validate(graph: &GraphProto) -> Result<(), SimplifyError> {
  let mut defined: HashSet<&str> = graph
    .input
    .iter()
    .map(|i| i.name.as_str())
    .chain(graph.initializer.iter().map(|t| t.name.as_str()))
    .collect();
  for node in &graph.node {
    for input in node.input.iter().filter(|i| !i.is_empty()) {
      if !defined.contains(input.as_str()) {
        return Err(SimplifyError::Dangling {
          node: node.name.clone(),
          value: input.clone(),
        });
      }
    }
    defined.extend(node.output.iter().map(String::as_str));
  }
  for output in &graph.output {
    if !defined.contains(output.name.as_str()) {
      return Err(SimplifyError::UnproducedOutput(output.name.clone()));
    }
  }
  Ok(())
}

/// 在副本上化简计算图，原模型不变
pub fn simplify(model: &ModelProto) -> Result<(ModelProto, SimplifyReport), SimplifyError> {
  let mut simplified = model.clone();
  let graph = simplified.graph.as_mut().ok_or(SimplifyError::MissingGraph)?;
  validate(graph)?;

  let report = SimplifyReport {
    merged_constants: merge_constants(graph),
    removed_transposes: cancel_transposes(graph),
    merged_reshapes: merge_reshapes(graph),
    pruned_initializers: prune_initializers(graph),
  };
  validate(graph)?;
  debug!("计算图化简: {:?}", report);
  Ok((simplified, report))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{export::GraphBuilder, tensor::Activation};

  fn graph(model: &ModelProto) -> &GraphProto {
    model.graph.as_ref().unwrap()
  }

  #[test]
  fn inverse_transposes_cancel() {
    let mut g = GraphBuilder::new();
    let x = g.input("images", &[1, 2, 3, 4]);
    let t = g.transpose(&x, &[0, 2, 3, 1], "a").unwrap();
    let t = g.transpose(&t, &[0, 3, 1, 2], "b").unwrap();
    let y = g.activation(&t, Activation::Relu, "act").unwrap();
    g.mark_output(&y, "out").unwrap();
    let (model, report) = simplify(&g.finish("t", 11)).unwrap();
    assert_eq!(report.removed_transposes, 2);
    let nodes = &graph(&model).node;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].input, vec!["images".to_string()]);
  }

  #[test]
  fn non_inverse_transposes_are_kept() {
    let mut g = GraphBuilder::new();
    let x = g.input("images", &[1, 2, 3, 4]);
    let t = g.transpose(&x, &[0, 2, 3, 1], "a").unwrap();
    let t = g.transpose(&t, &[0, 2, 3, 1], "b").unwrap();
    g.mark_output(&t, "out").unwrap();
    let (model, report) = simplify(&g.finish("t", 11)).unwrap();
    assert_eq!(report.removed_transposes, 0);
    assert_eq!(graph(&model).node.len(), 2);
  }

  #[test]
  fn duplicate_constants_are_merged_and_pruned() {
    let mut g = GraphBuilder::new();
    let x = g.input("images", &[1, 2, 3, 4]);
    let a = g.reshape(&x, &[1, 6, 4], "a").unwrap();
    let b = g.reshape(&a, &[1, 2, 12], "b").unwrap();
    let c = g.reshape(&b, &[1, 6, 4], "c").unwrap();
    g.mark_output(&c, "out").unwrap();
    let (model, report) = simplify(&g.finish("r", 11)).unwrap();
    assert_eq!(report.merged_constants, 1);
    assert_eq!(report.merged_reshapes, 2);
    let graph = graph(&model);
    assert_eq!(graph.node.len(), 1);
    assert_eq!(graph.node[0].output, vec!["out".to_string()]);
    assert_eq!(graph.initializer.len(), 1);
  }

  #[test]
  fn dangling_reference_is_reported() {
    let mut g = GraphBuilder::new();
    let x = g.input("images", &[1, 2, 3, 4]);
    let y = g.activation(&x, Activation::Relu, "act").unwrap();
    g.mark_output(&y, "out").unwrap();
    let mut model = g.finish("d", 11);
    model.graph.as_mut().unwrap().node[0].input[0] = "missing".to_string();
    assert!(matches!(
      simplify(&model),
      Err(SimplifyError::Dangling { value, .. }) if value == "missing"
    ));
  }
}
