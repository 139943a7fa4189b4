// 该文件是 Shiye （视野） 项目的一部分。
// src/input.rs - 摄像头采集与格式协商
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

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::FromUrl;
use crate::frame::{CaptureFormat, FrameError, PixelBuffer, PixelEncoding};

mod latest_slot;
pub use self::latest_slot::{SlotError, SlotReceiver, SlotSender, latest_slot};

#[cfg(feature = "v4l_input")]
mod v4l_input;
#[cfg(feature = "v4l_input")]
pub use self::v4l_input::{V4lDevice, V4lProvider};

#[derive(Error, Debug)]
pub enum FrameSourceError {
  #[error("未找到可用的摄像头设备")]
  DeviceNotFound,
  #[error("设备 {device} 没有 {encoding} 编码的采集格式")]
  NoMatchingFormat {
    device: String,
    encoding: PixelEncoding,
  },
  #[error("设备错误: {0}")]
  Device(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("帧错误: {0}")]
  FrameError(#[from] FrameError),
  #[error("采集线程异常退出")]
  WorkerPanicked,
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 单个物理摄像头
pub trait CaptureDevice: Send {
  fn name(&self) -> &str;

  /// 设备支持的全部采集格式
  fn formats(&self) -> Result<Vec<CaptureFormat>, FrameSourceError>;

  /// 应用选定的采集格式
  fn configure(&mut self, format: &CaptureFormat) -> Result<(), FrameSourceError>;

  /// 持续采集，直到 `on_frame` 返回 `Break` 或设备出错
  fn stream(
    &mut self,
    format: &CaptureFormat,
    on_frame: &mut dyn FnMut(PixelBuffer) -> ControlFlow<()>,
  ) -> Result<(), FrameSourceError>;
}

/// 摄像头设备发现
pub trait DeviceProvider: Send {
  fn discover(&self) -> Result<Option<Box<dyn CaptureDevice>>, FrameSourceError>;
}

/// 在 `formats` 中挑选编码匹配且宽度最大的格式，宽度相同时先出现者优先
pub fn select_capture_format(
  formats: &[CaptureFormat],
  required: PixelEncoding,
) -> Option<CaptureFormat> {
  formats
    .iter()
    .filter(|format| format.encoding == required)
    .fold(None, |best: Option<&CaptureFormat>, candidate| match best {
      Some(best) if candidate.width <= best.width => Some(best),
      _ => Some(candidate),
    })
    .copied()
}

enum SourceState {
  Idle(Option<Box<dyn CaptureDevice>>),
  Running {
    format: CaptureFormat,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Box<dyn CaptureDevice>>,
  },
}

/// 采集会话
///
/// 帧在独立的采集线程中产生，经容量为 1 的槽位按采集顺序交给消费端，
/// 消费端来不及处理的旧帧直接丢弃。
pub struct FrameSource {
  provider: Box<dyn DeviceProvider>,
  required: PixelEncoding,
  state: SourceState,
}

impl FrameSource {
  pub fn new(provider: Box<dyn DeviceProvider>) -> Self {
    Self {
      provider,
      required: PixelEncoding::Nv12,
      state: SourceState::Idle(None),
    }
  }

  pub fn with_required_encoding(mut self, encoding: PixelEncoding) -> Self {
    self.required = encoding;
    self
  }

  pub fn is_running(&self) -> bool {
    matches!(self.state, SourceState::Running { .. })
  }

  /// 当前会话选定的采集格式
  pub fn active_format(&self) -> Option<CaptureFormat> {
    match &self.state {
      SourceState::Running { format, .. } => Some(*format),
      SourceState::Idle(_) => None,
    }
  }

  /// 启动采集
  ///
  /// 设备发现与格式协商在调用方线程同步完成，失败时直接返回错误且不保留任何会话状态；
  /// 实际的采集循环交给后台线程。已在运行时返回 `Ok(None)`。
  pub fn start(
    &mut self,
  ) -> Result<Option<(CaptureFormat, SlotReceiver<PixelBuffer>)>, FrameSourceError> {
    let device = match std::mem::replace(&mut self.state, SourceState::Idle(None)) {
      running @ SourceState::Running { .. } => {
        self.state = running;
        debug!("采集已在运行，忽略重复启动");
        return Ok(None);
      }
      SourceState::Idle(device) => device,
    };

    let mut device = match device {
      Some(device) => device,
      None => self
        .provider
        .discover()?
        .ok_or(FrameSourceError::DeviceNotFound)?,
    };

    let formats = match device.formats() {
      Ok(formats) => formats,
      Err(e) => {
        self.state = SourceState::Idle(Some(device));
        return Err(e);
      }
    };
    debug!("设备 {} 支持 {} 种采集格式", device.name(), formats.len());

    let Some(format) = select_capture_format(&formats, self.required) else {
      let err = FrameSourceError::NoMatchingFormat {
        device: device.name().to_string(),
        encoding: self.required,
      };
      self.state = SourceState::Idle(Some(device));
      return Err(err);
    };

    if let Err(e) = device.configure(&format) {
      self.state = SourceState::Idle(Some(device));
      return Err(e);
    }
    info!("设备 {} 采集格式: {}", device.name(), format);

    let (tx, rx) = latest_slot();
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let handle = thread::Builder::new()
      .name("shiye-capture".to_string())
      .spawn(move || capture_loop(device, format, tx, flag))?;

    self.state = SourceState::Running {
      format,
      stop,
      handle,
    };
    Ok(Some((format, rx)))
  }

  /// 请求停止采集，不等待采集线程退出
  pub fn stop(&mut self) {
    if let SourceState::Running { stop, .. } = &self.state {
      info!("请求停止采集");
      stop.store(true, Ordering::Release);
    }
  }

  /// 回收已停止的采集线程所持有的设备
  ///
  /// 仅在 `stop` 之后调用，会等待采集线程在下一帧边界退出。
  pub fn reclaim(&mut self) -> Result<(), FrameSourceError> {
    let state = std::mem::replace(&mut self.state, SourceState::Idle(None));
    match state {
      SourceState::Running {
        stop,
        handle,
        format,
      } => {
        if !stop.load(Ordering::Acquire) && !handle.is_finished() {
          self.state = SourceState::Running {
            format,
            stop,
            handle,
          };
          return Ok(());
        }
        let device = handle.join().map_err(|_| FrameSourceError::WorkerPanicked)?;
        self.state = SourceState::Idle(Some(device));
        Ok(())
      }
      idle => {
        self.state = idle;
        Ok(())
      }
    }
  }
}

impl Drop for FrameSource {
  fn drop(&mut self) {
    self.stop();
  }
}

fn capture_loop(
  mut device: Box<dyn CaptureDevice>,
  format: CaptureFormat,
  tx: SlotSender<PixelBuffer>,
  stop: Arc<AtomicBool>,
) -> Box<dyn CaptureDevice> {
  info!("采集线程启动: {}", device.name());
  let mut frames = 0u64;

  let result = device.stream(&format, &mut |buffer| {
    if stop.load(Ordering::Acquire) {
      return ControlFlow::Break(());
    }
    frames += 1;
    match tx.publish(buffer) {
      Ok(_) => ControlFlow::Continue(()),
      Err(SlotError::Disconnected) => {
        warn!("帧消费端已关闭，停止采集");
        ControlFlow::Break(())
      }
    }
  });

  if let Err(e) = result {
    error!("采集出错: {}", e);
  }
  info!(
    "采集线程退出: 共采集 {} 帧, 丢弃过期帧 {} 帧",
    frames,
    tx.dropped()
  );
  device
}

/// 根据 URL 方案创建设备发现器
pub enum ProviderWrapper {
  #[cfg(feature = "v4l_input")]
  V4l(V4lProvider),
}

impl FromUrl for ProviderWrapper {
  type Error = FrameSourceError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "v4l_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4lProvider::SCHEME {
        return Ok(ProviderWrapper::V4l(V4lProvider::from_url(url)?));
      }
    }
    error!("不支持的输入方案: {}", url.scheme());
    Err(FrameSourceError::SchemeMismatch)
  }
}

impl ProviderWrapper {
  pub fn into_provider(self) -> Box<dyn DeviceProvider> {
    match self {
      #[cfg(feature = "v4l_input")]
      ProviderWrapper::V4l(provider) => Box::new(provider),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn nv12(width: u32, height: u32) -> CaptureFormat {
    CaptureFormat::new(PixelEncoding::Nv12, width, height)
  }

  #[test]
  fn picks_widest_matching_format() {
    let formats = [
      nv12(640, 480),
      nv12(1920, 1080),
      CaptureFormat::new(PixelEncoding::Yuyv, 3840, 2160),
    ];
    assert_eq!(
      select_capture_format(&formats, PixelEncoding::Nv12),
      Some(nv12(1920, 1080))
    );
  }

  #[test]
  fn first_seen_wins_width_ties() {
    let formats = [nv12(1280, 720), nv12(1920, 1080), nv12(1920, 1440)];
    assert_eq!(
      select_capture_format(&formats, PixelEncoding::Nv12),
      Some(nv12(1920, 1080))
    );

    let reordered = [nv12(1920, 1440), nv12(1280, 720), nv12(1920, 1080)];
    assert_eq!(
      select_capture_format(&reordered, PixelEncoding::Nv12),
      Some(nv12(1920, 1440))
    );
  }

  #[test]
  fn no_matching_encoding_selects_nothing() {
    let formats = [
      CaptureFormat::new(PixelEncoding::Yuyv, 640, 480),
      CaptureFormat::new(PixelEncoding::Mjpeg, 1920, 1080),
    ];
    assert_eq!(select_capture_format(&formats, PixelEncoding::Nv12), None);
    assert_eq!(select_capture_format(&[], PixelEncoding::Nv12), None);
  }

  #[test]
  fn zero_width_match_is_still_selected() {
    let formats = [CaptureFormat::new(PixelEncoding::Yuyv, 640, 480), nv12(0, 0)];
    assert_eq!(
      select_capture_format(&formats, PixelEncoding::Nv12),
      Some(nv12(0, 0))
    );
  }
}
