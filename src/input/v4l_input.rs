// 该文件是 Shiye （视野） 项目的一部分。
// src/input/v4l_input.rs - V4L2 摄像头输入
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

use tracing::{debug, error, warn};
use url::Url;
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

use super::{CaptureDevice, DeviceProvider, FrameSourceError};
use crate::frame::{CaptureFormat, PixelBuffer, PixelEncoding};
use crate::{FromUrl, FromUrlWithScheme};

const V4L_BUFFER_COUNT: u32 = 4;

fn v4l_error(e: std::io::Error) -> FrameSourceError {
  FrameSourceError::Device(e.to_string())
}

/// V4L2 设备发现
///
/// `v4l:///dev/video0` 指定设备节点，`v4l://` 使用第一个支持视频采集的节点。
pub struct V4lProvider {
  device_path: Option<String>,
}

impl FromUrlWithScheme for V4lProvider {
  const SCHEME: &'static str = "v4l";
}

impl FromUrl for V4lProvider {
  type Error = FrameSourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(FrameSourceError::SchemeMismatch);
    }

    let device_path = match url.path() {
      "" | "/" => None,
      path => Some(path.to_string()),
    };
    Ok(V4lProvider { device_path })
  }
}

fn is_capture_device(device: &Device) -> bool {
  device
    .query_caps()
    .map(|caps| caps.capabilities.contains(Flags::VIDEO_CAPTURE))
    .unwrap_or(false)
}

impl DeviceProvider for V4lProvider {
  fn discover(&self) -> Result<Option<Box<dyn CaptureDevice>>, FrameSourceError> {
    if let Some(path) = &self.device_path {
      return match Device::with_path(path) {
        Ok(device) if is_capture_device(&device) => {
          Ok(Some(Box::new(V4lDevice::new(path.clone(), device))))
        }
        Ok(_) => {
          warn!("{} 不是视频采集设备", path);
          Ok(None)
        }
        Err(e) => {
          warn!("无法打开设备 {}: {}", path, e);
          Ok(None)
        }
      };
    }

    for node in v4l::context::enum_devices() {
      let path = node.path().to_string_lossy().to_string();
      match Device::with_path(&path) {
        Ok(device) if is_capture_device(&device) => {
          debug!("发现采集设备: {}", path);
          return Ok(Some(Box::new(V4lDevice::new(path, device))));
        }
        Ok(_) => debug!("跳过非采集设备: {}", path),
        Err(e) => debug!("跳过无法打开的设备 {}: {}", path, e),
      }
    }
    Ok(None)
  }
}

pub struct V4lDevice {
  path: String,
  device: Device,
}

impl V4lDevice {
  fn new(path: String, device: Device) -> Self {
    Self { path, device }
  }
}

impl CaptureDevice for V4lDevice {
  fn name(&self) -> &str {
    &self.path
  }

  fn formats(&self) -> Result<Vec<CaptureFormat>, FrameSourceError> {
    let mut formats = Vec::new();
    for description in self.device.enum_formats().map_err(v4l_error)? {
      let encoding = PixelEncoding::from_fourcc(description.fourcc.repr);
      let sizes = match self.device.enum_framesizes(description.fourcc) {
        Ok(sizes) => sizes,
        Err(e) => {
          debug!("无法枚举 {} 的帧尺寸: {}", encoding, e);
          continue;
        }
      };
      for size in sizes {
        match size.size {
          FrameSizeEnum::Discrete(discrete) => {
            formats.push(CaptureFormat::new(encoding, discrete.width, discrete.height));
          }
          FrameSizeEnum::Stepwise(stepwise) => {
            formats.push(CaptureFormat::new(
              encoding,
              stepwise.max_width,
              stepwise.max_height,
            ));
          }
        }
      }
    }
    Ok(formats)
  }

  fn configure(&mut self, format: &CaptureFormat) -> Result<(), FrameSourceError> {
    let requested = Format::new(
      format.width,
      format.height,
      FourCC::new(&format.encoding.fourcc()),
    );
    let applied = self.device.set_format(&requested).map_err(v4l_error)?;
    if applied.width != format.width
      || applied.height != format.height
      || applied.fourcc.repr != format.encoding.fourcc()
    {
      return Err(FrameSourceError::Device(format!(
        "设备拒绝采集格式 {}, 实际为 {}x{} {}",
        format, applied.width, applied.height, applied.fourcc
      )));
    }
    Ok(())
  }

  fn stream(
    &mut self,
    format: &CaptureFormat,
    on_frame: &mut dyn FnMut(PixelBuffer) -> ControlFlow<()>,
  ) -> Result<(), FrameSourceError> {
    let mut stream = Stream::with_buffers(&self.device, Type::VideoCapture, V4L_BUFFER_COUNT)
      .map_err(v4l_error)?;
    let expected = format.encoding.frame_len(format.width, format.height);

    let mut index = 0u64;
    loop {
      let (buffer, meta) = stream.next().map_err(v4l_error)?;
      let used = (meta.bytesused as usize).min(buffer.len());
      let data = match expected {
        Some(expected) if used < expected => {
          warn!("第 {} 帧数据不完整: {} / {} 字节", index, used, expected);
          index += 1;
          continue;
        }
        Some(expected) => &buffer[..expected],
        None => &buffer[..used],
      };

      let frame = PixelBuffer::new(*format, data.to_vec(), index)?;
      index += 1;
      if on_frame(frame).is_break() {
        return Ok(());
      }
    }
  }
}
