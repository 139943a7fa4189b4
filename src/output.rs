// 该文件是 Shiye （视野） 项目的一部分。
// src/output.rs - 覆盖层渲染输出
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

use thiserror::Error;
use url::Url;

use crate::model::{Detection, Mask};
use crate::overlay::{
  DisplayTransformContext, OverlayGeometry, Rect, boxes_to_layer_space,
};
use crate::{FromUrl, FromUrlWithScheme};

mod log_output;
pub use self::log_output::LogOutput;

#[cfg(feature = "jsonl_output")]
mod json_record;
#[cfg(feature = "jsonl_output")]
pub use self::json_record::{JsonRecordOutput, JsonRecordOutputError};

/// 一个待绘制的目标
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayItem {
  /// 覆盖层容器内（传感器像素空间）的矩形
  pub layer_rect: Rect,
  /// 屏幕坐标下的矩形
  pub screen_rect: Rect,
  pub label: String,
  pub confidence: f32,
  pub mask: Option<Mask>,
}

/// 一次覆盖层更新
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayFrame {
  pub frame_index: u64,
  pub geometry: OverlayGeometry,
  pub items: Vec<OverlayItem>,
}

impl OverlayFrame {
  pub fn compose(
    frame_index: u64,
    detections: Vec<Detection>,
    context: &DisplayTransformContext,
  ) -> Self {
    let geometry = OverlayGeometry::new(context);
    let layer_rects = boxes_to_layer_space(&detections, context);
    let items = layer_rects
      .into_iter()
      .zip(detections)
      .map(|(layer, detection)| OverlayItem {
        screen_rect: geometry.project(&layer.rect),
        layer_rect: layer.rect,
        label: layer.label,
        confidence: layer.confidence,
        mask: detection.mask,
      })
      .collect();

    Self {
      frame_index,
      geometry,
      items,
    }
  }
}

/// 渲染端，只负责绘制
pub trait RenderSink: Send {
  type Error: std::error::Error + Send + Sync + 'static;
  fn render(&mut self, overlay: &OverlayFrame) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "jsonl_output")]
  #[error("JSON 记录输出错误: {0}")]
  JsonRecordOutputError(#[from] JsonRecordOutputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  Log(LogOutput),
  #[cfg(feature = "jsonl_output")]
  JsonRecord(JsonRecordOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogOutput::SCHEME => Ok(OutputWrapper::Log(LogOutput::from_url(url)?)),
      #[cfg(feature = "jsonl_output")]
      JsonRecordOutput::SCHEME => Ok(OutputWrapper::JsonRecord(JsonRecordOutput::from_url(url)?)),
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl RenderSink for OutputWrapper {
  type Error = OutputError;

  fn render(&mut self, overlay: &OverlayFrame) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Log(output) => match output.render(overlay) {
        Ok(()) => Ok(()),
        Err(never) => match never {},
      },
      #[cfg(feature = "jsonl_output")]
      OutputWrapper::JsonRecord(output) => output.render(overlay).map_err(OutputError::from),
    }
  }
}
