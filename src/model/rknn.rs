// 该文件是 Shiye （视野） 项目的一部分。
// src/model/rknn.rs - RKNN 推理后端
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

use ndarray::{Array2, ArrayD};
use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info};
use url::Url;

use super::{
  BackendError, BackendLoader, DetectionBackend, SegmentationBackend, SupportedVariant,
  Thresholds,
};
use crate::frame::PixelBuffer;
use crate::{FromUrl, FromUrlWithScheme};

const YOLO_NUM_INPUTS: u32 = 1;
const YOLO_NUM_OUTPUTS: u32 = 6;
const YOLO_CLASS_NUM: usize = 80;
const YOLO_INPUT_W: u32 = 640;
const YOLO_INPUT_H: u32 = 640;
const YOLO_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];

fn rknn_error(e: impl std::fmt::Display) -> BackendError {
  BackendError::InferenceError(e.to_string())
}

/// 从目录加载 `<模型名>.rknn`
///
/// `rknn:///opt/models` 会在检测小模型时读取 `/opt/models/yolov8n.rknn`。
pub struct RknnLoader {
  model_dir: PathBuf,
}

impl FromUrlWithScheme for RknnLoader {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for RknnLoader {
  type Error = BackendError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(BackendError::SchemeMismatch);
    }
    Ok(RknnLoader {
      model_dir: PathBuf::from(url.path()),
    })
  }
}

impl BackendLoader for RknnLoader {
  fn load_detection(
    &self,
    variant: SupportedVariant,
  ) -> Result<Box<dyn DetectionBackend>, BackendError> {
    let path = self
      .model_dir
      .join(format!("{}.rknn", variant.model_name()));
    Ok(Box::new(RknnDetection::load(path)?))
  }

  fn load_segmentation(
    &self,
    variant: SupportedVariant,
  ) -> Result<Box<dyn SegmentationBackend>, BackendError> {
    error!("RKNN 后端没有分割模型: {}", variant.model_name());
    Err(BackendError::LoadError(format!(
      "RKNN 后端不提供分割模型 {}",
      variant.model_name()
    )))
  }
}

pub struct RknnDetection {
  context: Context,
}

impl RknnDetection {
  pub fn load(path: PathBuf) -> Result<Self, BackendError> {
    info!("加载模型文件: {}", path.display());
    let model_data = std::fs::read(&path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let context = Context::new(&model_data, InitFlags::default())
      .map_err(|e| BackendError::LoadError(e.to_string()))?;

    let num_inputs = context
      .num_inputs()
      .map_err(|e| BackendError::LoadError(format!("无法获取输入数量: {}", e)))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| BackendError::LoadError(format!("无法获取输出数量: {}", e)))?;

    if num_inputs != YOLO_NUM_INPUTS || num_outputs != YOLO_NUM_OUTPUTS {
      error!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO_NUM_INPUTS, YOLO_NUM_OUTPUTS, num_inputs, num_outputs
      );
      return Err(BackendError::LoadError(format!(
        "模型输入/输出数量不匹配: {}/{}",
        num_inputs, num_outputs
      )));
    }

    Ok(Self { context })
  }
}

impl DetectionBackend for RknnDetection {
  fn predict(
    &self,
    image: &PixelBuffer,
    thresholds: Thresholds,
  ) -> Result<ArrayD<f32>, BackendError> {
    let input = image
      .to_rgb_nhwc(YOLO_INPUT_W, YOLO_INPUT_H)
      .map_err(|e| BackendError::UnsupportedInput(e.to_string()))?;

    self
      .context
      .set_input(0, input.as_slice(), TensorFormat::NHWC, TensorType::UInt8)
      .map_err(rknn_error)?;
    self.context.run().map_err(rknn_error)?;
    let output = self.context.get_outputs().map_err(rknn_error)?;

    let mut heads = Vec::with_capacity(YOLO_HEAD_SIZES.len());
    for head_idx in 0..YOLO_HEAD_SIZES.len() {
      let first = output.get_f32(head_idx * 2).map_err(rknn_error)?;
      let second = output.get_f32(head_idx * 2 + 1).map_err(rknn_error)?;
      heads.push((first, second));
    }

    let candidates = decode_heads(&heads, thresholds.confidence);
    let kept = non_max_suppression(candidates, thresholds.iou);
    Ok(to_rows(&kept).into_dyn())
  }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
  bbox: [f32; 4],
  class_id: usize,
  score: f32,
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 根据张量大小区分回归和分类输出
fn split_reg_cls<'a>(
  a: &'a [f32],
  b: &'a [f32],
  spatial: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  let (reg, cls) = (4 * spatial, YOLO_CLASS_NUM * spatial);
  if a.len() == reg && b.len() == cls {
    Some((a, b))
  } else if a.len() == cls && b.len() == reg {
    Some((b, a))
  } else {
    None
  }
}

fn decode_heads(heads: &[(&[f32], &[f32])], confidence: f32) -> Vec<Candidate> {
  let (input_w, input_h) = (YOLO_INPUT_W as f32, YOLO_INPUT_H as f32);
  let mut candidates = Vec::new();

  for (head_idx, (&(map_h, map_w), stride)) in
    YOLO_HEAD_SIZES.iter().zip(YOLO_STRIDES).enumerate()
  {
    let Some(&(first, second)) = heads.get(head_idx) else {
      break;
    };
    let spatial = map_h * map_w;
    let Some((reg, cls)) = split_reg_cls(first, second, spatial) else {
      error!(
        "检测头 {}: 输出大小不匹配 {} / {}",
        head_idx,
        first.len(),
        second.len()
      );
      continue;
    };

    for h in 0..map_h {
      for w in 0..map_w {
        let idx = h * map_w + w;
        let (class_id, logit) = (0..YOLO_CLASS_NUM)
          .map(|c| (c, cls[c * spatial + idx]))
          .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        let score = sigmoid(logit);
        if score <= confidence {
          continue;
        }

        let grid_x = w as f32 + 0.5;
        let grid_y = h as f32 + 0.5;
        let x_min = ((grid_x - reg[idx]) * stride).clamp(0.0, input_w);
        let y_min = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, input_h);
        let x_max = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, input_w);
        let y_max = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, input_h);

        candidates.push(Candidate {
          bbox: [
            x_min / input_w,
            y_min / input_h,
            x_max / input_w,
            y_max / input_h,
          ],
          class_id,
          score,
        });
      }
    }
  }

  candidates
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  let inter = ix * iy;
  if inter == 0.0 {
    return 0.0;
  }
  let area = |r: &[f32; 4]| (r[2] - r[0]) * (r[3] - r[1]);
  inter / (area(a) + area(b) - inter)
}

/// 按类别做非极大值抑制
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
  let mut kept: Vec<Candidate> = Vec::new();
  for candidate in candidates {
    let suppressed = kept.iter().any(|k| {
      k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
    });
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}

fn to_rows(candidates: &[Candidate]) -> Array2<f32> {
  let mut rows = Array2::zeros((candidates.len(), 4 + YOLO_CLASS_NUM));
  for (mut row, candidate) in rows.outer_iter_mut().zip(candidates) {
    for (i, v) in candidate.bbox.iter().enumerate() {
      row[i] = *v;
    }
    row[4 + candidate.class_id] = candidate.score;
  }
  rows
}

#[cfg(test)]
mod tests {
  use super::*;

  fn candidate(bbox: [f32; 4], class_id: usize, score: f32) -> Candidate {
    Candidate {
      bbox,
      class_id,
      score,
    }
  }

  #[test]
  fn overlapping_boxes_of_same_class_are_suppressed() {
    let kept = non_max_suppression(
      vec![
        candidate([0.1, 0.1, 0.5, 0.5], 0, 0.6),
        candidate([0.1, 0.1, 0.52, 0.5], 0, 0.9),
        candidate([0.1, 0.1, 0.5, 0.5], 3, 0.5),
      ],
      0.45,
    );
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].score, 0.9);
    assert_eq!(kept[1].class_id, 3);
  }

  #[test]
  fn rows_place_score_at_class_column() {
    let rows = to_rows(&[candidate([0.1, 0.2, 0.3, 0.4], 7, 0.8)]);
    assert_eq!(rows.dim(), (1, 84));
    assert_eq!(rows[[0, 11]], 0.8);
    assert_eq!(rows[[0, 0]], 0.1);
    assert_eq!(rows[[0, 3]], 0.4);
    assert_eq!(rows.row(0).iter().filter(|&&v| v != 0.0).count(), 5);
  }
}
