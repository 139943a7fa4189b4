// 该文件是 Shiye （视野） 项目的一部分。
// src/output/json_record.rs - JSON Lines 记录输出
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

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;
use url::Url;

use super::{OverlayFrame, RenderSink};
use crate::overlay::Rect;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum JsonRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 每次覆盖层更新追加一行 JSON
///
/// `jsonl:///tmp/overlay.jsonl`，带 `?always` 时没有目标的帧也会记录。
pub struct JsonRecordOutput {
  path: PathBuf,
  writer: BufWriter<File>,
  always: bool,
}

impl FromUrlWithScheme for JsonRecordOutput {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonRecordOutput {
  type Error = JsonRecordOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonRecordOutputError::SchemeMismatch);
    }

    let path = PathBuf::from(url.path());
    let always = url.query_pairs().any(|(k, _)| k == "always");
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    info!("覆盖层记录写入 {}", path.display());

    Ok(JsonRecordOutput {
      path,
      writer: BufWriter::new(file),
      always,
    })
  }
}

impl JsonRecordOutput {
  pub fn path(&self) -> &PathBuf {
    &self.path
  }
}

fn rect_json(rect: &Rect) -> Value {
  json!([rect.min_x(), rect.min_y(), rect.size.width, rect.size.height])
}

/// 一次覆盖层更新对应的 JSON 记录
pub fn overlay_record(overlay: &OverlayFrame) -> Value {
  let geometry = &overlay.geometry;
  let affine = &geometry.affine;
  let items: Vec<Value> = overlay
    .items
    .iter()
    .map(|item| {
      json!({
        "label": item.label,
        "confidence": item.confidence,
        "layer_rect": rect_json(&item.layer_rect),
        "screen_rect": rect_json(&item.screen_rect),
        "mask_coverage": item.mask.as_ref().map(|mask| mask.coverage()),
      })
    })
    .collect();

  json!({
    "timestamp": Utc::now().to_rfc3339(),
    "frame": overlay.frame_index,
    "geometry": {
      "affine": [affine.a, affine.b, affine.c, affine.d, affine.tx, affine.ty],
      "scale": geometry.scale,
      "bounds": rect_json(&geometry.bounds),
      "position": [geometry.position.x, geometry.position.y],
    },
    "items": items,
  })
}

impl RenderSink for JsonRecordOutput {
  type Error = JsonRecordOutputError;

  fn render(&mut self, overlay: &OverlayFrame) -> Result<(), Self::Error> {
    if overlay.items.is_empty() && !self.always {
      return Ok(());
    }

    serde_json::to_writer(&mut self.writer, &overlay_record(overlay))?;
    self.writer.write_all(b"\n")?;
    self.writer.flush()?;
    Ok(())
  }
}
