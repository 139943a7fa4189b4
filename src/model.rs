// 该文件是 Shiye （视野） 项目的一部分。
// src/model.rs - 模型变体与推理后端契约
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

use std::fmt;
use std::str::FromStr;

use ndarray::ArrayD;
use thiserror::Error;

use crate::FromUrl;
use crate::frame::PixelBuffer;

mod decode;
mod dispatcher;
mod labels;

pub use self::decode::{DecodeError, Detection, Mask, decode_detections};
pub use self::dispatcher::{DispatchError, ModelDispatcher};
pub use self::labels::{COCO_LABELS, label_for};

#[cfg(feature = "rknpu")]
mod rknn;
#[cfg(feature = "rknpu")]
pub use self::rknn::{RknnDetection, RknnLoader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
  Detection,
  Segmentation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Weight {
  Nano,
  Small,
  Medium,
  Large,
  XLarge,
}

impl FromStr for Task {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "detect" | "detection" => Ok(Task::Detection),
      "segment" | "segmentation" => Ok(Task::Segmentation),
      _ => Err(format!("未知任务: {}", s)),
    }
  }
}

impl FromStr for Weight {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "n" | "nano" => Ok(Weight::Nano),
      "s" | "small" => Ok(Weight::Small),
      "m" | "medium" => Ok(Weight::Medium),
      "l" | "large" => Ok(Weight::Large),
      "x" | "xlarge" => Ok(Weight::XLarge),
      _ => Err(format!("未知权重规模: {}", s)),
    }
  }
}

/// 任务与权重规模的组合，作为分发键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelVariant {
  pub task: Task,
  pub weight: Weight,
}

impl ModelVariant {
  pub fn new(task: Task, weight: Weight) -> Self {
    Self { task, weight }
  }
}

impl fmt::Display for ModelVariant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}/{:?}", self.task, self.weight)
  }
}

/// 有实现的模型变体，其余组合不可表示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupportedVariant {
  DetectionNano,
  DetectionSmall,
  SegmentationNano,
  SegmentationSmall,
}

impl SupportedVariant {
  pub const ALL: [SupportedVariant; 4] = [
    SupportedVariant::DetectionNano,
    SupportedVariant::DetectionSmall,
    SupportedVariant::SegmentationNano,
    SupportedVariant::SegmentationSmall,
  ];

  pub fn resolve(variant: ModelVariant) -> Option<Self> {
    match (variant.task, variant.weight) {
      (Task::Detection, Weight::Nano) => Some(SupportedVariant::DetectionNano),
      (Task::Detection, Weight::Small) => Some(SupportedVariant::DetectionSmall),
      (Task::Segmentation, Weight::Nano) => Some(SupportedVariant::SegmentationNano),
      (Task::Segmentation, Weight::Small) => Some(SupportedVariant::SegmentationSmall),
      _ => None,
    }
  }

  pub fn variant(&self) -> ModelVariant {
    match self {
      SupportedVariant::DetectionNano => ModelVariant::new(Task::Detection, Weight::Nano),
      SupportedVariant::DetectionSmall => ModelVariant::new(Task::Detection, Weight::Small),
      SupportedVariant::SegmentationNano => ModelVariant::new(Task::Segmentation, Weight::Nano),
      SupportedVariant::SegmentationSmall => ModelVariant::new(Task::Segmentation, Weight::Small),
    }
  }

  /// 模型文件的基础名
  pub fn model_name(&self) -> &'static str {
    match self {
      SupportedVariant::DetectionNano => "yolov8n",
      SupportedVariant::DetectionSmall => "yolov8s",
      SupportedVariant::SegmentationNano => "yolov8n-seg",
      SupportedVariant::SegmentationSmall => "yolov8s-seg",
    }
  }
}

/// 后端固有的阈值，不可在运行时调整
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
  pub iou: f32,
  pub confidence: f32,
}

pub const BACKEND_THRESHOLDS: Thresholds = Thresholds {
  iou: 0.45,
  confidence: 0.25,
};

/// 运行平台的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
  pub segmentation: bool,
}

impl Default for PlatformCapabilities {
  fn default() -> Self {
    Self { segmentation: true }
  }
}

/// 每个被接受的帧产生一次的推理结果
///
/// 只有分割任务会携带 `auxiliary`（掩码原型）。
#[derive(Debug, Clone)]
pub struct InferenceResult {
  pub primary: ArrayD<f32>,
  pub auxiliary: Option<ArrayD<f32>>,
}

#[derive(Error, Debug)]
pub enum BackendError {
  #[error("模型加载错误: {0}")]
  LoadError(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("推理错误: {0}")]
  InferenceError(String),
  #[error("不支持的输入: {0}")]
  UnsupportedInput(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 检测模型，输出 `[N, 4 + 类别数]`
pub trait DetectionBackend: Send {
  fn predict(
    &self,
    image: &PixelBuffer,
    thresholds: Thresholds,
  ) -> Result<ArrayD<f32>, BackendError>;
}

/// 分割模型，输出 `([N, 4 + 类别数 + 掩码系数], [掩码系数, H, W])`
pub trait SegmentationBackend: Send {
  fn predict(&self, image: &PixelBuffer) -> Result<(ArrayD<f32>, ArrayD<f32>), BackendError>;
}

/// 按变体实例化推理后端
pub trait BackendLoader: Send {
  fn load_detection(
    &self,
    variant: SupportedVariant,
  ) -> Result<Box<dyn DetectionBackend>, BackendError>;

  fn load_segmentation(
    &self,
    variant: SupportedVariant,
  ) -> Result<Box<dyn SegmentationBackend>, BackendError>;
}

/// 根据 URL 方案创建后端加载器
pub enum LoaderWrapper {
  #[cfg(feature = "rknpu")]
  Rknn(RknnLoader),
}

impl FromUrl for LoaderWrapper {
  type Error = BackendError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "rknpu")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == RknnLoader::SCHEME {
        return Ok(LoaderWrapper::Rknn(RknnLoader::from_url(url)?));
      }
    }
    tracing::error!("不支持的模型方案: {}", url.scheme());
    Err(BackendError::SchemeMismatch)
  }
}

impl LoaderWrapper {
  pub fn into_loader(self) -> Box<dyn BackendLoader> {
    match self {
      #[cfg(feature = "rknpu")]
      LoaderWrapper::Rknn(loader) => Box::new(loader),
    }
  }
}
