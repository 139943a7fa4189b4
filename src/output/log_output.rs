// 该文件是 Shiye （视野） 项目的一部分。
// src/output/log_output.rs - 日志输出
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

use std::convert::Infallible;

use tracing::{debug, info};
use url::Url;

use super::{OutputError, OverlayFrame, RenderSink};
use crate::{FromUrl, FromUrlWithScheme};

/// 将每次覆盖层更新写入 tracing 日志
#[derive(Debug, Default)]
pub struct LogOutput {
  updates: u64,
}

impl LogOutput {
  pub fn updates(&self) -> u64 {
    self.updates
  }
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    Ok(LogOutput::default())
  }
}

impl RenderSink for LogOutput {
  type Error = Infallible;

  fn render(&mut self, overlay: &OverlayFrame) -> Result<(), Self::Error> {
    self.updates += 1;
    debug!(
      "帧 {}: 容器中心 ({:.1}, {:.1}), 缩放 {:.4}",
      overlay.frame_index,
      overlay.geometry.position.x,
      overlay.geometry.position.y,
      overlay.geometry.scale
    );

    if overlay.items.is_empty() {
      return Ok(());
    }

    info!(
      "帧 {}: 检测到 {} 个对象",
      overlay.frame_index,
      overlay.items.len()
    );
    for item in &overlay.items {
      let rect = &item.screen_rect;
      info!(
        "  - {}: {:.2}% at ({:.0}, {:.0}, {:.0}x{:.0})",
        item.label,
        item.confidence * 100.0,
        rect.min_x(),
        rect.min_y(),
        rect.size.width,
        rect.size.height
      );
    }
    Ok(())
  }
}
