// 该文件是 Shanan （山南西风） 项目的一部分。
// src/export/graph.rs - ONNX 计算图构建
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

use std::collections::HashMap;

use tract_onnx::pb::{
  AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
  TensorShapeProto, TypeProto, ValueInfoProto, attribute_proto::AttributeType,
  tensor_proto::DataType, tensor_shape_proto::Dimension,
  tensor_shape_proto::dimension::Value as DimValue, type_proto,
};

use super::ExportError;
use crate::tensor::{Activation, Conv2d, TensorError};

pub const IR_VERSION: i64 = 7;
pub const PRODUCER: &str = "shanan-export";

fn ints_attr(name: &str, values: &[i64]) -> AttributeProto {
  AttributeProto {
    name: name.to_string(),
    r#type: AttributeType::Ints as i32,
    ints: values.to_vec(),
    ..Default::default()
  }
}

fn int_attr(name: &str, value: i64) -> AttributeProto {
  AttributeProto {
    name: name.to_string(),
    r#type: AttributeType::Int as i32,
    i: value,
    ..Default::default()
  }
}

fn dims_i64(shape: &[usize]) -> Vec<i64> {
  shape.iter().map(|&d| d as i64).collect()
}

pub(crate) fn value_info(name: &str, shape: &[usize]) -> ValueInfoProto {
  let dim = shape
    .iter()
    .map(|&d| Dimension {
      value: Some(DimValue::DimValue(d as i64)),
      ..Default::default()
    })
    .collect();
  ValueInfoProto {
    name: name.to_string(),
    r#type: Some(TypeProto {
      value: Some(type_proto::Value::TensorType(type_proto::Tensor {
        elem_type: DataType::Float as i32,
        shape: Some(TensorShapeProto { dim }),
      })),
      ..Default::default()
    }),
    ..Default::default()
  }
}

/// 逐节点构建静态形状的 ONNX 计算图
///
/// 每个中间张量的形状都会被记录，新增节点时据此校验输入并推导输出形状。
#[derive(Debug, Default)]
pub struct GraphBuilder {
  nodes: Vec<NodeProto>,
  initializers: Vec<TensorProto>,
  inputs: Vec<ValueInfoProto>,
  outputs: Vec<ValueInfoProto>,
  shapes: HashMap<String, Vec<usize>>,
  counter: usize,
}

impl GraphBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn shape(&self, value: &str) -> Result<&[usize], ExportError> {
    self
      .shapes
      .get(value)
      .map(Vec::as_slice)
      .ok_or_else(|| ExportError::Graph(format!("未知的张量: {value}")))
  }

  pub fn num_nodes(&self) -> usize {
    self.nodes.len()
  }

  fn fresh(&mut self, hint: &str) -> String {
    self.counter += 1;
    format!("{hint}_{}", self.counter)
  }

  fn push_node(
    &mut self,
    op_type: &str,
    hint: &str,
    input: Vec<String>,
    attribute: Vec<AttributeProto>,
    shape: Vec<usize>,
  ) -> String {
    let output = self.fresh(&format!("{hint}/{op_type}"));
    self.nodes.push(NodeProto {
      input,
      output: vec![output.clone()],
      name: output.clone(),
      op_type: op_type.to_string(),
      attribute,
      ..Default::default()
    });
    self.shapes.insert(output.clone(), shape);
    output
  }

  pub fn input(&mut self, name: &str, shape: &[usize]) -> String {
    self.inputs.push(value_info(name, shape));
    self.shapes.insert(name.to_string(), shape.to_vec());
    name.to_string()
  }

  pub fn constant_f32(&mut self, hint: &str, shape: &[usize], data: Vec<f32>) -> String {
    let name = self.fresh(hint);
    self.initializers.push(TensorProto {
      name: name.clone(),
      dims: dims_i64(shape),
      data_type: DataType::Float as i32,
      float_data: data,
      ..Default::default()
    });
    self.shapes.insert(name.clone(), shape.to_vec());
    name
  }

  pub fn constant_i64(&mut self, hint: &str, values: &[i64]) -> String {
    let name = self.fresh(hint);
    self.initializers.push(TensorProto {
      name: name.clone(),
      dims: vec![values.len() as i64],
      data_type: DataType::Int64 as i32,
      int64_data: values.to_vec(),
      ..Default::default()
    });
    self.shapes.insert(name.clone(), vec![values.len()]);
    name
  }

  fn nchw(&self, x: &str) -> Result<[usize; 4], ExportError> {
    match *self.shape(x)? {
      [n, c, h, w] => Ok([n, c, h, w]),
      ref other => Err(ExportError::Graph(format!(
        "{x} 需要 4 维张量, 实际形状为 {other:?}"
      ))),
    }
  }

  pub fn conv(&mut self, x: &str, conv: &Conv2d, hint: &str) -> Result<String, ExportError> {
    let [n, c, h, w] = self.nchw(x)?;
    if c != conv.in_channels() {
      return Err(ExportError::Graph(format!(
        "{hint}: 卷积需要 {} 个输入通道, 实际为 {c}",
        conv.in_channels()
      )));
    }
    if conv.stride == 0 {
      return Err(TensorError::ZeroStride.into());
    }
    let (kh, kw) = conv.kernel_size();
    if h + 2 * conv.padding < kh || w + 2 * conv.padding < kw {
      return Err(ExportError::Graph(format!(
        "{hint}: 输入 {h}x{w} 小于卷积核 {kh}x{kw}"
      )));
    }
    let (oh, ow) = conv.output_size(h, w);

    let weight = self.constant_f32(
      &format!("{hint}.weight"),
      conv.weight.shape(),
      conv.weight.iter().copied().collect(),
    );
    let mut inputs = vec![x.to_string(), weight];
    if let Some(bias) = &conv.bias {
      inputs.push(self.constant_f32(
        &format!("{hint}.bias"),
        &[bias.len()],
        bias.iter().copied().collect(),
      ));
    }

    let pad = conv.padding as i64;
    let stride = conv.stride as i64;
    let attributes = vec![
      ints_attr("kernel_shape", &[kh as i64, kw as i64]),
      ints_attr("strides", &[stride, stride]),
      ints_attr("pads", &[pad, pad, pad, pad]),
      ints_attr("dilations", &[1, 1]),
      int_attr("group", conv.groups as i64),
    ];
    Ok(self.push_node(
      "Conv",
      hint,
      inputs,
      attributes,
      vec![n, conv.out_channels(), oh, ow],
    ))
  }

  /// SiLU 展开为 `x * Sigmoid(x)`
  pub fn activation(
    &mut self,
    x: &str,
    act: Activation,
    hint: &str,
  ) -> Result<String, ExportError> {
    let shape = self.shape(x)?.to_vec();
    Ok(match act {
      Activation::Identity => x.to_string(),
      Activation::Relu => self.push_node("Relu", hint, vec![x.to_string()], vec![], shape),
      Activation::Silu => {
        let gate = self.push_node("Sigmoid", hint, vec![x.to_string()], vec![], shape.clone());
        self.push_node("Mul", hint, vec![x.to_string(), gate], vec![], shape)
      }
    })
  }

  pub fn concat(
    &mut self,
    parts: &[String],
    axis: usize,
    hint: &str,
  ) -> Result<String, ExportError> {
    let first = parts
      .first()
      .ok_or_else(|| ExportError::Graph(format!("{hint}: 拼接列表为空")))?;
    let mut shape = self.shape(first)?.to_vec();
    if axis >= shape.len() {
      return Err(ExportError::Graph(format!("{hint}: 拼接轴 {axis} 越界")));
    }
    for part in &parts[1..] {
      let other = self.shape(part)?;
      let compatible = other.len() == shape.len()
        && other
          .iter()
          .zip(&shape)
          .enumerate()
          .all(|(i, (a, b))| i == axis || a == b);
      if !compatible {
        return Err(ExportError::Graph(format!(
          "{hint}: 无法拼接形状 {shape:?} 与 {other:?}"
        )));
      }
      shape[axis] += other[axis];
    }
    Ok(self.push_node(
      "Concat",
      hint,
      parts.to_vec(),
      vec![int_attr("axis", axis as i64)],
      shape,
    ))
  }

  /// 从 (row, col) 起在高宽两维上步长为 2 的切片
  pub fn slice_spatial(
    &mut self,
    x: &str,
    row: usize,
    col: usize,
    hint: &str,
  ) -> Result<String, ExportError> {
    let [n, c, h, w] = self.nchw(x)?;
    let starts = self.constant_i64(&format!("{hint}.starts"), &[row as i64, col as i64]);
    let ends = self.constant_i64(&format!("{hint}.ends"), &[h as i64, w as i64]);
    let axes = self.constant_i64(&format!("{hint}.axes"), &[2, 3]);
    let steps = self.constant_i64(&format!("{hint}.steps"), &[2, 2]);
    let shape = vec![
      n,
      c,
      h.saturating_sub(row).div_ceil(2),
      w.saturating_sub(col).div_ceil(2),
    ];
    Ok(self.push_node(
      "Slice",
      hint,
      vec![x.to_string(), starts, ends, axes, steps],
      vec![],
      shape,
    ))
  }

  pub fn reshape(&mut self, x: &str, shape: &[usize], hint: &str) -> Result<String, ExportError> {
    let from = self.shape(x)?;
    if from.iter().product::<usize>() != shape.iter().product::<usize>() {
      return Err(ExportError::Graph(format!(
        "{hint}: 无法把 {from:?} 变形为 {shape:?}"
      )));
    }
    let target = self.constant_i64(&format!("{hint}.shape"), &dims_i64(shape));
    Ok(self.push_node(
      "Reshape",
      hint,
      vec![x.to_string(), target],
      vec![],
      shape.to_vec(),
    ))
  }

  pub fn transpose(&mut self, x: &str, perm: &[usize], hint: &str) -> Result<String, ExportError> {
    let from = self.shape(x)?;
    let mut seen = vec![false; from.len()];
    let valid = perm.len() == from.len()
      && perm
        .iter()
        .all(|&p| p < seen.len() && !std::mem::replace(&mut seen[p], true));
    if !valid {
      return Err(ExportError::Graph(format!(
        "{hint}: 非法的维度置换 {perm:?}"
      )));
    }
    let shape = perm.iter().map(|&p| from[p]).collect();
    Ok(self.push_node(
      "Transpose",
      hint,
      vec![x.to_string()],
      vec![ints_attr("perm", &dims_i64(perm))],
      shape,
    ))
  }

  /// 把节点输出重命名为图输出名
  pub fn mark_output(&mut self, value: &str, name: &str) -> Result<(), ExportError> {
    if self.shapes.contains_key(name) {
      return Err(ExportError::Graph(format!("输出名 {name} 已被占用")));
    }
    let producer = self
      .nodes
      .iter_mut()
      .find(|node| node.output.iter().any(|o| o == value))
      .ok_or_else(|| ExportError::Graph(format!("{value} 不是任何节点的输出")))?;
    for output in producer.output.iter_mut().filter(|o| o.as_str() == value) {
      *output = name.to_string();
    }
    for node in &mut self.nodes {
      for input in node.input.iter_mut().filter(|i| i.as_str() == value) {
        *input = name.to_string();
      }
    }
    let shape = self
      .shapes
      .remove(value)
      .ok_or_else(|| ExportError::Graph(format!("未知的张量: {value}")))?;
    self.outputs.push(value_info(name, &shape));
    self.shapes.insert(name.to_string(), shape);
    Ok(())
  }

  pub fn finish(self, name: &str, opset: i64) -> ModelProto {
    ModelProto {
      ir_version: IR_VERSION,
      opset_import: vec![OperatorSetIdProto {
        domain: String::new(),
        version: opset,
      }],
      producer_name: PRODUCER.to_string(),
      producer_version: env!("CARGO_PKG_VERSION").to_string(),
      graph: Some(GraphProto {
        node: self.nodes,
        name: name.to_string(),
        initializer: self.initializers,
        input: self.inputs,
        output: self.outputs,
        ..Default::default()
      }),
      ..Default::default()
    }
  }
}
