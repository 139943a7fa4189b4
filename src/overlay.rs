// 该文件是 Shiye （视野） 项目的一部分。
// src/overlay.rs - 检测框到屏幕图层的坐标变换
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

//! # 覆盖层几何
//!
//! 传感器的自然朝向是横屏，而界面锁定为竖屏。覆盖层容器的边界等于传感器分辨率，
//! 容器中心放在预览区域中心，再施加“旋转 90° 后按 `(scale, -scale)` 缩放”的仿射变换：
//!
//! ```text
//! screen = position + affine · (p - bounds.center)
//! ```
//!
//! 其中 `scale = max(preview.w / capture.h, preview.h / capture.w)`，即 aspect-fill。
//! 该变换只针对竖屏锁定的界面，其它设备朝向沿用同一变换。

use std::str::FromStr;

use tracing::trace;

use crate::model::Detection;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
  pub x: f64,
  pub y: f64,
}

impl Point {
  pub fn new(x: f64, y: f64) -> Self {
    Self { x, y }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
  pub width: f64,
  pub height: f64,
}

impl Size {
  pub fn new(width: f64, height: f64) -> Self {
    Self { width, height }
  }

  fn is_degenerate(&self) -> bool {
    !(self.width > 0.0 && self.height > 0.0)
  }
}

impl FromStr for Size {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (w, h) = s
      .split_once(['x', 'X'])
      .ok_or_else(|| format!("尺寸格式应为 <宽>x<高>: {}", s))?;
    let width = w.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let height = h.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Ok(Size::new(width, height))
  }
}

/// 以原点和尺寸表示的矩形
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
  pub origin: Point,
  pub size: Size,
}

impl Rect {
  pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
    Self {
      origin: Point::new(x, y),
      size: Size::new(width, height),
    }
  }

  pub fn from_corners(a: Point, b: Point) -> Self {
    let (x0, x1) = (a.x.min(b.x), a.x.max(b.x));
    let (y0, y1) = (a.y.min(b.y), a.y.max(b.y));
    Rect::new(x0, y0, x1 - x0, y1 - y0)
  }

  pub fn min_x(&self) -> f64 {
    self.origin.x
  }

  pub fn min_y(&self) -> f64 {
    self.origin.y
  }

  pub fn max_x(&self) -> f64 {
    self.origin.x + self.size.width
  }

  pub fn max_y(&self) -> f64 {
    self.origin.y + self.size.height
  }

  pub fn center(&self) -> Point {
    Point::new(
      self.origin.x + self.size.width / 2.0,
      self.origin.y + self.size.height / 2.0,
    )
  }
}

/// 二维仿射变换
///
/// `x' = a·x + c·y + tx`，`y' = b·x + d·y + ty`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
  pub a: f64,
  pub b: f64,
  pub c: f64,
  pub d: f64,
  pub tx: f64,
  pub ty: f64,
}

impl Affine {
  pub const IDENTITY: Affine = Affine {
    a: 1.0,
    b: 0.0,
    c: 0.0,
    d: 1.0,
    tx: 0.0,
    ty: 0.0,
  };

  /// 逆时针旋转 90°，取精确的 0 与 ±1
  pub fn quarter_turn() -> Self {
    Affine {
      a: 0.0,
      b: 1.0,
      c: -1.0,
      d: 0.0,
      tx: 0.0,
      ty: 0.0,
    }
  }

  /// 先缩放再施加 `self`
  pub fn scaled(&self, sx: f64, sy: f64) -> Self {
    Affine {
      a: self.a * sx,
      b: self.b * sx,
      c: self.c * sy,
      d: self.d * sy,
      tx: self.tx,
      ty: self.ty,
    }
  }

  pub fn apply(&self, p: Point) -> Point {
    Point::new(
      self.a * p.x + self.c * p.y + self.tx,
      self.b * p.x + self.d * p.y + self.ty,
    )
  }

  /// 变换后矩形的外接矩形
  pub fn apply_rect(&self, rect: &Rect) -> Rect {
    let corners = [
      self.apply(Point::new(rect.min_x(), rect.min_y())),
      self.apply(Point::new(rect.max_x(), rect.min_y())),
      self.apply(Point::new(rect.min_x(), rect.max_y())),
      self.apply(Point::new(rect.max_x(), rect.max_y())),
    ];
    let (mut x0, mut y0) = (f64::INFINITY, f64::INFINITY);
    let (mut x1, mut y1) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in corners {
      x0 = x0.min(p.x);
      y0 = y0.min(p.y);
      x1 = x1.max(p.x);
      y1 = y1.max(p.y);
    }
    Rect::from_corners(Point::new(x0, y0), Point::new(x1, y1))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceOrientation {
  #[default]
  Portrait,
  PortraitUpsideDown,
  LandscapeLeft,
  LandscapeRight,
}

impl FromStr for DeviceOrientation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "portrait" => Ok(DeviceOrientation::Portrait),
      "portrait-upside-down" => Ok(DeviceOrientation::PortraitUpsideDown),
      "landscape-left" => Ok(DeviceOrientation::LandscapeLeft),
      "landscape-right" => Ok(DeviceOrientation::LandscapeRight),
      _ => Err(format!("未知设备朝向: {}", s)),
    }
  }
}

/// 界面侧可变的布局信息
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DisplayLayout {
  pub orientation: DeviceOrientation,
  pub preview: Size,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayTransformContext {
  pub orientation: DeviceOrientation,
  pub capture_resolution: Size,
  pub preview: Size,
}

impl DisplayTransformContext {
  pub fn new(layout: DisplayLayout, capture_resolution: Size) -> Self {
    Self {
      orientation: layout.orientation,
      capture_resolution,
      preview: layout.preview,
    }
  }
}

/// aspect-fill 缩放系数
///
/// 预览或采集尺寸的任一边为零、负数或 NaN 时都视为布局退化，直接取 1.0，
/// 即使另一条边仍能算出有限的比值。比值非有限时同样取 1.0。
pub fn layer_scale(context: &DisplayTransformContext) -> f64 {
  let capture = context.capture_resolution;
  let preview = context.preview;
  if capture.is_degenerate() || preview.is_degenerate() {
    trace!("布局尺寸退化, 缩放系数取 1.0");
    return 1.0;
  }

  // 传感器为横向，宽高互换
  let scale_x = preview.width / capture.height;
  let scale_y = preview.height / capture.width;
  let scale = scale_x.max(scale_y);
  if scale.is_finite() { scale } else { 1.0 }
}

/// 覆盖层容器的仿射变换，只依赖于 `context`
pub fn layer_affine(context: &DisplayTransformContext) -> Affine {
  let scale = layer_scale(context);
  Affine::quarter_turn().scaled(scale, -scale)
}

/// 传感器像素空间中的检测框
#[derive(Debug, Clone, PartialEq)]
pub struct LayerRect {
  pub rect: Rect,
  pub label: String,
  pub confidence: f32,
}

/// 按传感器分辨率反归一化检测框
pub fn boxes_to_layer_space(
  detections: &[Detection],
  context: &DisplayTransformContext,
) -> Vec<LayerRect> {
  let Size { width, height } = context.capture_resolution;
  detections
    .iter()
    .map(|detection| {
      let [x0, y0, x1, y1] = detection.bbox.map(f64::from);
      LayerRect {
        rect: Rect::from_corners(
          Point::new(x0 * width, y0 * height),
          Point::new(x1 * width, y1 * height),
        ),
        label: detection.label.clone(),
        confidence: detection.confidence,
      }
    })
    .collect()
}

/// 覆盖层容器的几何描述，交给渲染端直接使用
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayGeometry {
  pub affine: Affine,
  /// 构成 `affine` 的 aspect-fill 缩放系数
  pub scale: f64,
  /// 容器边界，即传感器像素空间
  pub bounds: Rect,
  /// 容器中心在屏幕上的位置，始终是预览区域中心
  pub position: Point,
}

impl OverlayGeometry {
  pub fn new(context: &DisplayTransformContext) -> Self {
    let capture = context.capture_resolution;
    Self {
      affine: layer_affine(context),
      scale: layer_scale(context),
      bounds: Rect::new(0.0, 0.0, capture.width, capture.height),
      position: Point::new(context.preview.width / 2.0, context.preview.height / 2.0),
    }
  }

  /// 将容器内的矩形映射到屏幕坐标
  pub fn project(&self, rect: &Rect) -> Rect {
    let center = self.bounds.center();
    let local = Rect::new(
      rect.min_x() - center.x,
      rect.min_y() - center.y,
      rect.size.width,
      rect.size.height,
    );
    let mapped = self.affine.apply_rect(&local);
    Rect::new(
      mapped.min_x() + self.position.x,
      mapped.min_y() + self.position.y,
      mapped.size.width,
      mapped.size.height,
    )
  }
}
