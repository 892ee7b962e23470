// 该文件是 Shanan （山南西风） 项目的一部分。
// src/weights.rs - 模型权重来源
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
  collections::{HashMap, HashSet},
  path::Path,
};

use ndarray::{Array1, Array4, ArrayD, Ix1, Ix4, IxDyn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::tensor::{BatchNorm2d, Conv2d};

#[derive(Error, Debug)]
pub enum WeightError {
  #[error("权重文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("权重文件格式错误: {0}")]
  Format(#[from] safetensors::SafeTensorError),
  #[error("缺少权重: {0}")]
  Missing(String),
  #[error("权重 {name} 形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    name: String,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("权重 {name} 数据类型不受支持: {dtype}")]
  UnsupportedDtype { name: String, dtype: String },
  #[error("形状错误: {0}")]
  Shape(#[from] ndarray::ShapeError),
}

/// 按名称提供参数张量
pub trait WeightSource {
  fn tensor(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, WeightError>;

  fn array1(&mut self, name: &str, len: usize) -> Result<Array1<f32>, WeightError> {
    Ok(self.tensor(name, &[len])?.into_dimensionality::<Ix1>()?)
  }

  fn array4(&mut self, name: &str, shape: [usize; 4]) -> Result<Array4<f32>, WeightError> {
    Ok(self.tensor(name, &shape)?.into_dimensionality::<Ix4>()?)
  }
}

/// 读取 `{prefix}.weight`，无偏置
pub fn load_conv(
  source: &mut dyn WeightSource,
  prefix: &str,
  shape: [usize; 4],
  stride: usize,
  padding: usize,
) -> Result<Conv2d, WeightError> {
  let weight = source.array4(&format!("{prefix}.weight"), shape)?;
  Ok(Conv2d::new(weight, None, stride, padding, 1))
}

/// 读取 `{prefix}.weight` 与 `{prefix}.bias`
pub fn load_conv_with_bias(
  source: &mut dyn WeightSource,
  prefix: &str,
  shape: [usize; 4],
) -> Result<Conv2d, WeightError> {
  let weight = source.array4(&format!("{prefix}.weight"), shape)?;
  let bias = source.array1(&format!("{prefix}.bias"), shape[0])?;
  Ok(Conv2d::new(weight, Some(bias), 1, 0, 1))
}

pub fn load_batch_norm(
  source: &mut dyn WeightSource,
  prefix: &str,
  channels: usize,
  eps: f32,
) -> Result<BatchNorm2d, WeightError> {
  Ok(BatchNorm2d {
    weight: source.array1(&format!("{prefix}.weight"), channels)?,
    bias: source.array1(&format!("{prefix}.bias"), channels)?,
    running_mean: source.array1(&format!("{prefix}.running_mean"), channels)?,
    running_var: source.array1(&format!("{prefix}.running_var"), channels)?,
    eps,
  })
}

/// safetensors 格式的检查点
pub struct Checkpoint {
  tensors: HashMap<String, ArrayD<f32>>,
  used: HashSet<String>,
}

impl Checkpoint {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WeightError> {
    let path = path.as_ref();
    info!("加载权重文件: {}", path.display());
    let data = std::fs::read(path)?;
    debug!(
      "权重文件大小: {:.2} MB",
      data.len() as f64 / (1024.0 * 1024.0)
    );
    Self::from_bytes(&data)
  }

  pub fn from_bytes(data: &[u8]) -> Result<Self, WeightError> {
    let file = SafeTensors::deserialize(data)?;
    let mut tensors = HashMap::new();

    for (name, view) in file.tensors() {
      if view.dtype() != Dtype::F32 {
        return Err(WeightError::UnsupportedDtype {
          name,
          dtype: format!("{:?}", view.dtype()),
        });
      }
      let values: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
      let array = ArrayD::from_shape_vec(IxDyn(view.shape()), values)?;
      tensors.insert(name, array);
    }

    debug!("权重张量数量: {}", tensors.len());
    Ok(Self {
      tensors,
      used: HashSet::new(),
    })
  }

  pub fn len(&self) -> usize {
    self.tensors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tensors.is_empty()
  }

  /// 未被模型读取过的张量名
  pub fn unused(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self
      .tensors
      .keys()
      .filter(|name| !self.used.contains(*name))
      .map(String::as_str)
      .collect();
    names.sort_unstable();
    names
  }

  pub fn warn_unused(&self) {
    let unused = self.unused();
    if !unused.is_empty() {
      warn!("检查点中有 {} 个权重未被使用: {:?}", unused.len(), unused);
    }
  }
}

impl WeightSource for Checkpoint {
  fn tensor(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, WeightError> {
    let array = self
      .tensors
      .get(name)
      .ok_or_else(|| WeightError::Missing(name.to_string()))?;
    if array.shape() != shape {
      return Err(WeightError::ShapeMismatch {
        name: name.to_string(),
        expected: shape.to_vec(),
        actual: array.shape().to_vec(),
      });
    }
    self.used.insert(name.to_string());
    Ok(array.clone())
  }
}

/// 以固定种子随机初始化参数
pub struct RandomInit {
  rng: StdRng,
}

impl RandomInit {
  pub fn seeded(seed: u64) -> Self {
    Self {
      rng: StdRng::seed_from_u64(seed),
    }
  }
}

impl WeightSource for RandomInit {
  fn tensor(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, WeightError> {
    let len: usize = shape.iter().product();
    let positive =
      name.ends_with("running_var") || (shape.len() == 1 && name.ends_with("weight"));
    let values: Vec<f32> = if positive {
      (0..len).map(|_| self.rng.gen_range(0.5..1.5)).collect()
    } else {
      let fan_in: usize = shape.iter().skip(1).product::<usize>().max(1);
      let bound = 1.0 / (fan_in as f32).sqrt();
      (0..len).map(|_| self.rng.gen_range(-bound..bound)).collect()
    };
    Ok(ArrayD::from_shape_vec(IxDyn(shape), values)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use safetensors::tensor::TensorView;

  fn encode(entries: &[(&str, Vec<usize>, Vec<f32>)]) -> Vec<u8> {
    let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = entries
      .iter()
      .map(|(name, shape, values)| {
        let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        (name.to_string(), shape.clone(), raw)
      })
      .collect();
    let views: Vec<(String, TensorView)> = bytes
      .iter()
      .map(|(name, shape, raw)| {
        (
          name.clone(),
          TensorView::new(Dtype::F32, shape.clone(), raw).unwrap(),
        )
      })
      .collect();
    safetensors::serialize(views, &None).unwrap()
  }

  #[test]
  fn checkpoint_reads_named_tensor() {
    let data = encode(&[("head.bias", vec![3], vec![1.0, 2.0, 3.0])]);
    let mut ckpt = Checkpoint::from_bytes(&data).unwrap();
    let bias = ckpt.array1("head.bias", 3).unwrap();
    assert_eq!(bias.to_vec(), vec![1.0, 2.0, 3.0]);
    assert!(ckpt.unused().is_empty());
  }

  #[test]
  fn checkpoint_rejects_wrong_shape() {
    let data = encode(&[("w", vec![2, 2], vec![0.0; 4])]);
    let mut ckpt = Checkpoint::from_bytes(&data).unwrap();
    let err = ckpt.tensor("w", &[4]).unwrap_err();
    assert!(matches!(err, WeightError::ShapeMismatch { .. }));
  }

  #[test]
  fn checkpoint_reports_missing_and_unused() {
    let data = encode(&[("a", vec![1], vec![0.0]), ("b", vec![1], vec![0.0])]);
    let mut ckpt = Checkpoint::from_bytes(&data).unwrap();
    assert!(matches!(
      ckpt.tensor("c", &[1]),
      Err(WeightError::Missing(name)) if name == "c"
    ));
    ckpt.tensor("a", &[1]).unwrap();
    assert_eq!(ckpt.unused(), vec!["b"]);
  }

  #[test]
  fn random_init_is_reproducible_and_keeps_variance_positive() {
    let a = RandomInit::seeded(7).tensor("x.running_var", &[16]).unwrap();
    let b = RandomInit::seeded(7).tensor("x.running_var", &[16]).unwrap();
    assert_eq!(a, b);
    assert!(a.iter().all(|&v| v > 0.0));
  }
}
