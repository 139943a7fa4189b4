// 该文件是 Shiye （视野） 项目的一部分。
// src/frame.rs - 采集格式与像素缓冲区定义
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
use std::time::Instant;

use thiserror::Error;

const RGB_CHANNELS: usize = 3;

/// 像素编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
  /// 双平面 4:2:0 全范围（Y 平面 + 交错 UV 平面）
  Nv12,
  Yuyv,
  Mjpeg,
  Rgb24,
  Other([u8; 4]),
}

impl PixelEncoding {
  pub fn from_fourcc(code: [u8; 4]) -> Self {
    match &code {
      b"NV12" => PixelEncoding::Nv12,
      b"YUYV" => PixelEncoding::Yuyv,
      b"MJPG" => PixelEncoding::Mjpeg,
      b"RGB3" => PixelEncoding::Rgb24,
      _ => PixelEncoding::Other(code),
    }
  }

  pub fn fourcc(&self) -> [u8; 4] {
    match self {
      PixelEncoding::Nv12 => *b"NV12",
      PixelEncoding::Yuyv => *b"YUYV",
      PixelEncoding::Mjpeg => *b"MJPG",
      PixelEncoding::Rgb24 => *b"RGB3",
      PixelEncoding::Other(code) => *code,
    }
  }

  /// 一帧的期望字节数，压缩格式返回 None
  pub fn frame_len(&self, width: u32, height: u32) -> Option<usize> {
    let pixels = width as usize * height as usize;
    match self {
      PixelEncoding::Nv12 => Some(pixels + 2 * (width as usize).div_ceil(2) * (height as usize).div_ceil(2)),
      PixelEncoding::Yuyv => Some(pixels * 2),
      PixelEncoding::Rgb24 => Some(pixels * RGB_CHANNELS),
      PixelEncoding::Mjpeg | PixelEncoding::Other(_) => None,
    }
  }
}

impl fmt::Display for PixelEncoding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let code = self.fourcc();
    write!(f, "{}", String::from_utf8_lossy(&code))
  }
}

/// 摄像头的一种采集模式，会话启动时选定，之后不再改变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureFormat {
  pub encoding: PixelEncoding,
  pub width: u32,
  pub height: u32,
}

impl CaptureFormat {
  pub fn new(encoding: PixelEncoding, width: u32, height: u32) -> Self {
    Self {
      encoding,
      width,
      height,
    }
  }
}

impl fmt::Display for CaptureFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}x{}", self.encoding, self.width, self.height)
  }
}

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("不支持的像素编码: {0}")]
  UnsupportedEncoding(PixelEncoding),
}

/// 单帧像素缓冲区
///
/// 所有权按帧从采集端移交给流水线，处理完一帧后即被丢弃。
#[derive(Debug)]
pub struct PixelBuffer {
  format: CaptureFormat,
  data: Box<[u8]>,
  index: u64,
  captured_at: Instant,
}

impl PixelBuffer {
  pub fn new(format: CaptureFormat, data: Vec<u8>, index: u64) -> Result<Self, FrameError> {
    if let Some(expected) = format.encoding.frame_len(format.width, format.height) {
      if data.len() != expected {
        return Err(FrameError::LengthMismatch {
          expected,
          actual: data.len(),
        });
      }
    }

    Ok(Self {
      format,
      data: data.into_boxed_slice(),
      index,
      captured_at: Instant::now(),
    })
  }

  pub fn format(&self) -> &CaptureFormat {
    &self.format
  }

  pub fn width(&self) -> u32 {
    self.format.width
  }

  pub fn height(&self) -> u32 {
    self.format.height
  }

  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn captured_at(&self) -> Instant {
    self.captured_at
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 将 NV12 帧最近邻缩放并转换为 RGB NHWC 排布
  pub fn to_rgb_nhwc(&self, dst_w: u32, dst_h: u32) -> Result<Vec<u8>, FrameError> {
    if self.format.encoding != PixelEncoding::Nv12 {
      return Err(FrameError::UnsupportedEncoding(self.format.encoding));
    }

    let (src_w, src_h) = (self.format.width as usize, self.format.height as usize);
    let (dst_w, dst_h) = (dst_w as usize, dst_h as usize);
    let mut rgb = Vec::with_capacity(dst_w * dst_h * RGB_CHANNELS);
    if src_w == 0 || src_h == 0 {
      rgb.resize(dst_w * dst_h * RGB_CHANNELS, 0);
      return Ok(rgb);
    }

    let (luma, chroma) = self.data.split_at(src_w * src_h);
    let chroma_stride = 2 * src_w.div_ceil(2);

    for dy in 0..dst_h {
      let sy = dy * src_h / dst_h;
      for dx in 0..dst_w {
        let sx = dx * src_w / dst_w;
        let y = luma[sy * src_w + sx] as f32;
        let uv = (sy / 2) * chroma_stride + (sx / 2) * 2;
        let u = chroma[uv] as f32 - 128.0;
        let v = chroma[uv + 1] as f32 - 128.0;

        // 全范围 BT.601
        let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
        let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
        let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
        rgb.extend_from_slice(&[r, g, b]);
      }
    }

    Ok(rgb)
  }
}
