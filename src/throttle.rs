// 该文件是 Shiye （视野） 项目的一部分。
// src/throttle.rs - 推理帧率节流
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

use std::num::NonZeroU32;

/// 每 N 帧放行一帧的计数门
///
/// 只能由单个调用方使用，`&mut self` 保证了这一点。
#[derive(Debug, Clone)]
pub struct FrameThrottle {
  interval: NonZeroU32,
  counter: u32,
}

impl Default for FrameThrottle {
  fn default() -> Self {
    Self::new(NonZeroU32::MIN)
  }
}

impl FrameThrottle {
  pub fn new(interval: NonZeroU32) -> Self {
    Self {
      interval,
      counter: 0,
    }
  }

  pub fn interval(&self) -> NonZeroU32 {
    self.interval
  }

  /// 自上次放行以来第 N 次调用时返回 true
  pub fn should_process(&mut self) -> bool {
    self.counter += 1;
    if self.counter >= self.interval.get() {
      self.counter = 0;
      true
    } else {
      false
    }
  }
}
