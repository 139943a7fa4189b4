// 该文件是 Shiye （视野） 项目的一部分。
// src/model/decode.rs - 推理结果解码
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

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3, Axis, Ix2, Ix3};
use thiserror::Error;
use tracing::{debug, trace};

use super::{InferenceResult, label_for};

const BOX_FIELDS: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
  #[error("输出张量形状无效: {0:?}")]
  InvalidOutputShape(Vec<usize>),
  #[error("掩码原型形状无效: {0:?}")]
  InvalidProtoShape(Vec<usize>),
  #[error("输出宽度 {width} 不足以容纳 {mask_dim} 个掩码系数")]
  NoClassColumns { width: usize, mask_dim: usize },
}

/// 掩码原型分辨率下的实例掩码，框外为 0
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
  pub probabilities: Array2<f32>,
}

impl Mask {
  /// 概率超过 0.5 的像素占比
  pub fn coverage(&self) -> f32 {
    let total = self.probabilities.len();
    if total == 0 {
      return 0.0;
    }
    let hits = self.probabilities.iter().filter(|&&p| p > 0.5).count();
    hits as f32 / total as f32
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  /// 归一化坐标 [x_min, y_min, x_max, y_max]
  pub bbox: [f32; 4],
  pub class_id: usize,
  pub label: String,
  pub confidence: f32,
  pub mask: Option<Mask>,
}

fn rows_of(result: &InferenceResult) -> Result<ArrayView2<'_, f32>, DecodeError> {
  let shape = result.primary.shape().to_vec();
  let view = result.primary.view();
  match shape.len() {
    2 => view
      .into_dimensionality::<Ix2>()
      .map_err(|_| DecodeError::InvalidOutputShape(shape)),
    // 去掉大小为 1 的批次维
    3 if shape[0] == 1 => view
      .index_axis_move(Axis(0), 0)
      .into_dimensionality::<Ix2>()
      .map_err(|_| DecodeError::InvalidOutputShape(shape)),
    _ => Err(DecodeError::InvalidOutputShape(shape)),
  }
}

fn proto_of(result: &InferenceResult) -> Result<Option<ArrayView3<'_, f32>>, DecodeError> {
  let Some(proto) = &result.auxiliary else {
    return Ok(None);
  };
  let shape = proto.shape().to_vec();
  let view = proto.view();
  let view = match shape.len() {
    3 => view.into_dimensionality::<Ix3>(),
    4 if shape[0] == 1 => view.index_axis_move(Axis(0), 0).into_dimensionality::<Ix3>(),
    _ => return Err(DecodeError::InvalidProtoShape(shape)),
  };
  view
    .map(Some)
    .map_err(|_| DecodeError::InvalidProtoShape(shape))
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

fn assemble_mask(coefficients: ArrayView1<'_, f32>, proto: &ArrayView3<'_, f32>, bbox: &[f32; 4]) -> Mask {
  let (_, height, width) = proto.dim();
  let x_min = bbox[0] * width as f32;
  let y_min = bbox[1] * height as f32;
  let x_max = bbox[2] * width as f32;
  let y_max = bbox[3] * height as f32;

  let probabilities = Array2::from_shape_fn((height, width), |(y, x)| {
    let (cx, cy) = (x as f32 + 0.5, y as f32 + 0.5);
    if cx < x_min || cx > x_max || cy < y_min || cy > y_max {
      return 0.0;
    }
    let logit: f32 = coefficients
      .iter()
      .zip(proto.slice(ndarray::s![.., y, x]).iter())
      .map(|(c, p)| c * p)
      .sum();
    sigmoid(logit)
  });

  Mask { probabilities }
}

/// 将统一形状的推理结果解码为检测列表
///
/// 每行布局为 `[x_min, y_min, x_max, y_max, 类别置信度..., 掩码系数...]`，
/// 掩码系数个数由掩码原型的第一维决定。
pub fn decode_detections(result: &InferenceResult) -> Result<Vec<Detection>, DecodeError> {
  let rows = rows_of(result)?;
  let proto = proto_of(result)?;
  let mask_dim = proto.as_ref().map(|p| p.dim().0).unwrap_or(0);

  let width = rows.ncols();
  if width <= BOX_FIELDS + mask_dim {
    return Err(DecodeError::NoClassColumns { width, mask_dim });
  }
  let class_num = width - BOX_FIELDS - mask_dim;

  let mut detections = Vec::with_capacity(rows.nrows());
  for (index, row) in rows.outer_iter().enumerate() {
    let (x0, y0, x1, y1) = (row[0], row[1], row[2], row[3]);
    let bbox = [
      x0.min(x1).clamp(0.0, 1.0),
      y0.min(y1).clamp(0.0, 1.0),
      x0.max(x1).clamp(0.0, 1.0),
      y0.max(y1).clamp(0.0, 1.0),
    ];
    if bbox[2] <= bbox[0] || bbox[3] <= bbox[1] {
      trace!("跳过第 {} 行的退化框", index);
      continue;
    }

    let scores = row.slice(ndarray::s![BOX_FIELDS..BOX_FIELDS + class_num]);
    let (class_id, score) = scores
      .iter()
      .enumerate()
      .fold((0usize, f32::MIN), |best, (c, &s)| if s > best.1 { (c, s) } else { best });
    if score.is_nan() || score <= 0.0 {
      continue;
    }

    let mask = proto.as_ref().map(|proto| {
      let coefficients = row.slice(ndarray::s![BOX_FIELDS + class_num..]);
      assemble_mask(coefficients, proto, &bbox)
    });

    detections.push(Detection {
      bbox,
      class_id,
      label: label_for(class_id),
      confidence: score.clamp(0.0, 1.0),
      mask,
    });
  }

  debug!("解码得到 {} 个目标", detections.len());
  Ok(detections)
}
