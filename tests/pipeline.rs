// 该文件是 Shiye （视野） 项目的一部分。
// tests/pipeline.rs - 流水线集成测试
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
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use ndarray::{ArrayD, IxDyn};

use shiye::frame::{CaptureFormat, PixelBuffer, PixelEncoding};
use shiye::input::{CaptureDevice, DeviceProvider, FrameSource, FrameSourceError};
use shiye::model::{
  BackendError, BackendLoader, DetectionBackend, DispatchError, ModelDispatcher, ModelVariant,
  PlatformCapabilities, SegmentationBackend, SupportedVariant, Task, Thresholds, Weight,
};
use shiye::output::{OverlayFrame, RenderSink};
use shiye::overlay::{DeviceOrientation, DisplayLayout, Size};
use shiye::pipeline::{DetectionPipeline, PipelineConfig, PipelineError, PipelineState};

struct FakeCamera {
  formats: Vec<CaptureFormat>,
  /// `None` 表示一直采集直到被停止
  frames: Option<u64>,
  delay: Duration,
  configured: Arc<Mutex<Option<CaptureFormat>>>,
  next_index: u64,
}

impl CaptureDevice for FakeCamera {
  fn name(&self) -> &str {
    "fake-camera"
  }

  fn formats(&self) -> Result<Vec<CaptureFormat>, FrameSourceError> {
    Ok(self.formats.clone())
  }

  fn configure(&mut self, format: &CaptureFormat) -> Result<(), FrameSourceError> {
    *self.configured.lock().unwrap() = Some(*format);
    Ok(())
  }

  fn stream(
    &mut self,
    format: &CaptureFormat,
    on_frame: &mut dyn FnMut(PixelBuffer) -> ControlFlow<()>,
  ) -> Result<(), FrameSourceError> {
    let len = format
      .encoding
      .frame_len(format.width, format.height)
      .ok_or(FrameSourceError::Device("compressed".to_string()))?;
    let mut emitted = 0;
    while self.frames.is_none_or(|frames| emitted < frames) {
      let buffer = PixelBuffer::new(*format, vec![0; len], self.next_index)?;
      self.next_index += 1;
      emitted += 1;
      if on_frame(buffer).is_break() {
        break;
      }
      thread::sleep(self.delay);
    }
    Ok(())
  }
}

#[derive(Default, Clone)]
struct ProviderTally {
  discoveries: Arc<AtomicUsize>,
  configured: Arc<Mutex<Option<CaptureFormat>>>,
}

struct FakeProvider {
  camera: Mutex<Option<FakeCamera>>,
  tally: ProviderTally,
}

impl DeviceProvider for FakeProvider {
  fn discover(&self) -> Result<Option<Box<dyn CaptureDevice>>, FrameSourceError> {
    self.tally.discoveries.fetch_add(1, Ordering::SeqCst);
    let camera = self.camera.lock().unwrap().take();
    Ok(camera.map(|camera| Box::new(camera) as Box<dyn CaptureDevice>))
  }
}

fn nv12(width: u32, height: u32) -> CaptureFormat {
  CaptureFormat::new(PixelEncoding::Nv12, width, height)
}

fn source(
  formats: Vec<CaptureFormat>,
  frames: Option<u64>,
  delay: Duration,
) -> (FrameSource, ProviderTally) {
  let tally = ProviderTally::default();
  let camera = FakeCamera {
    formats,
    frames,
    delay,
    configured: tally.configured.clone(),
    next_index: 0,
  };
  let provider = FakeProvider {
    camera: Mutex::new(Some(camera)),
    tally: tally.clone(),
  };
  (FrameSource::new(Box::new(provider)), tally)
}

fn empty_source() -> (FrameSource, ProviderTally) {
  let tally = ProviderTally::default();
  let provider = FakeProvider {
    camera: Mutex::new(None),
    tally: tally.clone(),
  };
  (FrameSource::new(Box::new(provider)), tally)
}

/// 单个置信度 0.9 的 person，位于画面中央
fn person_tensor() -> ArrayD<f32> {
  let mut row = vec![0.0; 84];
  row[..4].copy_from_slice(&[0.25, 0.25, 0.75, 0.75]);
  row[4] = 0.9;
  ArrayD::from_shape_vec(IxDyn(&[1, 84]), row).unwrap()
}

#[derive(Default, Clone)]
struct BackendTally {
  loads: Arc<AtomicUsize>,
  predictions: Arc<AtomicUsize>,
}

struct FakeDetection {
  tally: BackendTally,
  fail_even_frames: bool,
  latency: Duration,
  gate: Option<Receiver<()>>,
}

impl DetectionBackend for FakeDetection {
  fn predict(
    &self,
    image: &PixelBuffer,
    _thresholds: Thresholds,
  ) -> Result<ArrayD<f32>, BackendError> {
    self.tally.predictions.fetch_add(1, Ordering::SeqCst);
    // 发送端关闭后不再阻塞
    if let Some(gate) = &self.gate {
      let _ = gate.recv();
    }
    thread::sleep(self.latency);
    if self.fail_even_frames && image.index() % 2 == 0 {
      return Err(BackendError::InferenceError(format!("帧 {}", image.index())));
    }
    Ok(person_tensor())
  }
}

struct FakeLoader {
  tally: BackendTally,
  fail_even_frames: bool,
  latency: Duration,
  gate: Option<Receiver<()>>,
}

impl BackendLoader for FakeLoader {
  fn load_detection(
    &self,
    _variant: SupportedVariant,
  ) -> Result<Box<dyn DetectionBackend>, BackendError> {
    self.tally.loads.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(FakeDetection {
      tally: self.tally.clone(),
      fail_even_frames: self.fail_even_frames,
      latency: self.latency,
      gate: self.gate.clone(),
    }))
  }

  fn load_segmentation(
    &self,
    _variant: SupportedVariant,
  ) -> Result<Box<dyn SegmentationBackend>, BackendError> {
    self.tally.loads.fetch_add(1, Ordering::SeqCst);
    Err(BackendError::LoadError("未提供分割模型".to_string()))
  }
}

fn dispatcher(fail_even_frames: bool, latency: Duration) -> (ModelDispatcher, BackendTally) {
  let tally = BackendTally::default();
  let loader = FakeLoader {
    tally: tally.clone(),
    fail_even_frames,
    latency,
    gate: None,
  };
  (ModelDispatcher::new(Box::new(loader)), tally)
}

/// 推理在 `Sender` 被丢弃前一直阻塞
fn gated_dispatcher() -> (ModelDispatcher, BackendTally, Sender<()>) {
  let tally = BackendTally::default();
  let (release, gate) = unbounded();
  let loader = FakeLoader {
    tally: tally.clone(),
    fail_even_frames: false,
    latency: Duration::ZERO,
    gate: Some(gate),
  };
  (ModelDispatcher::new(Box::new(loader)), tally, release)
}

#[derive(Default, Clone)]
struct RecordingSink {
  frames: Arc<Mutex<Vec<OverlayFrame>>>,
  latency: Duration,
}

impl RecordingSink {
  fn len(&self) -> usize {
    self.frames.lock().unwrap().len()
  }
}

impl RenderSink for RecordingSink {
  type Error = Infallible;

  fn render(&mut self, overlay: &OverlayFrame) -> Result<(), Self::Error> {
    thread::sleep(self.latency);
    self.frames.lock().unwrap().push(overlay.clone());
    Ok(())
  }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if done() {
      return true;
    }
    thread::sleep(Duration::from_millis(5));
  }
  done()
}

fn detect_nano() -> ModelVariant {
  ModelVariant::new(Task::Detection, Weight::Nano)
}

fn portrait_layout() -> DisplayLayout {
  DisplayLayout {
    orientation: DeviceOrientation::Portrait,
    preview: Size::new(390.0, 844.0),
  }
}

#[test]
fn centred_person_is_rendered_in_preview_centre() {
  let formats = vec![
    nv12(640, 480),
    nv12(1080, 1920),
    CaptureFormat::new(PixelEncoding::Yuyv, 3840, 2160),
  ];
  let (source, camera) = source(formats, Some(3), Duration::from_millis(5));
  let (dispatcher, backend) = dispatcher(false, Duration::ZERO);
  let sink = RecordingSink::default();
  let config = PipelineConfig::new(detect_nano()).with_layout(portrait_layout());
  let mut pipeline = DetectionPipeline::new(config, source, dispatcher, sink.clone());

  pipeline.start().unwrap();
  assert_eq!(*camera.configured.lock().unwrap(), Some(nv12(1080, 1920)));
  assert!(wait_until(Duration::from_secs(5), || pipeline.state()
    == PipelineState::Stopped));

  assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
  let frames = sink.frames.lock().unwrap();
  assert!(!frames.is_empty());
  for frame in frames.iter() {
    assert_eq!(frame.items.len(), 1);
    let item = &frame.items[0];
    assert_eq!(item.label, "person");
    assert_eq!(item.confidence, 0.9);
    let centre = item.screen_rect.center();
    assert!((130.0..=260.0).contains(&centre.x), "x = {}", centre.x);
    assert!((844.0 / 3.0..=844.0 * 2.0 / 3.0).contains(&centre.y), "y = {}", centre.y);
  }
}

#[test]
fn throttle_limits_inference_to_every_nth_received_frame() {
  let (source, _) = source(vec![nv12(64, 48)], Some(20), Duration::from_millis(2));
  let (dispatcher, backend) = dispatcher(false, Duration::ZERO);
  let sink = RecordingSink::default();
  let config = PipelineConfig::new(detect_nano()).with_interval(NonZeroU32::new(3).unwrap());
  let mut pipeline = DetectionPipeline::new(config, source, dispatcher, sink.clone());

  pipeline.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || pipeline.state()
    == PipelineState::Stopped));

  let stats = pipeline.stats();
  assert!(stats.received > 0);
  assert_eq!(stats.received, stats.throttled + stats.inferred + stats.failed);
  assert_eq!(stats.inferred, stats.received / 3);
  assert_eq!(
    backend.predictions.load(Ordering::SeqCst) as u64,
    stats.received / 3
  );
  assert_eq!(sink.len() as u64, stats.rendered);
  assert_eq!(stats.rendered, stats.inferred);
}

#[test]
fn inference_failures_skip_the_frame_and_keep_streaming() {
  let (source, _) = source(vec![nv12(64, 48)], Some(10), Duration::from_millis(5));
  let (dispatcher, _) = dispatcher(true, Duration::ZERO);
  let sink = RecordingSink::default();
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(detect_nano()),
    source,
    dispatcher,
    sink.clone(),
  );

  pipeline.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || pipeline.state()
    == PipelineState::Stopped));

  let stats = pipeline.stats();
  assert!(stats.rendered > 0);
  assert_eq!(stats.received, stats.inferred + stats.failed);
  let frames = sink.frames.lock().unwrap();
  assert!(frames.iter().all(|frame| frame.frame_index % 2 == 1));
}

#[test]
fn missing_camera_leaves_pipeline_idle() {
  let (source, camera) = empty_source();
  let (dispatcher, _) = dispatcher(false, Duration::ZERO);
  let sink = RecordingSink::default();
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(detect_nano()),
    source,
    dispatcher,
    sink.clone(),
  );

  let err = pipeline.start().unwrap_err();
  assert!(matches!(
    err,
    PipelineError::SourceError(FrameSourceError::DeviceNotFound)
  ));
  assert_eq!(pipeline.state(), PipelineState::Idle);
  assert_eq!(camera.discoveries.load(Ordering::SeqCst), 1);
  assert_eq!(sink.len(), 0);
}

#[test]
fn missing_format_leaves_pipeline_idle() {
  let formats = vec![CaptureFormat::new(PixelEncoding::Yuyv, 1920, 1080)];
  let (source, _) = source(formats, Some(1), Duration::ZERO);
  let (dispatcher, _) = dispatcher(false, Duration::ZERO);
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(detect_nano()),
    source,
    dispatcher,
    RecordingSink::default(),
  );

  let err = pipeline.start().unwrap_err();
  assert!(matches!(
    err,
    PipelineError::SourceError(FrameSourceError::NoMatchingFormat { .. })
  ));
  assert_eq!(pipeline.state(), PipelineState::Idle);
}

#[test]
fn unsupported_variant_fails_before_touching_device_or_backend() {
  let (source, camera) = source(vec![nv12(64, 48)], Some(1), Duration::ZERO);
  let (dispatcher, backend) = dispatcher(false, Duration::ZERO);
  let variant = ModelVariant::new(Task::Detection, Weight::Medium);
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(variant),
    source,
    dispatcher,
    RecordingSink::default(),
  );

  let err = pipeline.start().unwrap_err();
  assert!(matches!(
    err,
    PipelineError::DispatchError(DispatchError::UnsupportedConfiguration { .. })
  ));
  assert_eq!(pipeline.state(), PipelineState::Idle);
  assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
  assert_eq!(camera.discoveries.load(Ordering::SeqCst), 0);
}

#[test]
fn segmentation_is_rejected_without_platform_support() {
  let (source, _) = source(vec![nv12(64, 48)], Some(1), Duration::ZERO);
  let (dispatcher, backend) = dispatcher(false, Duration::ZERO);
  let dispatcher = dispatcher.with_capabilities(PlatformCapabilities {
    segmentation: false,
  });
  let variant = ModelVariant::new(Task::Segmentation, Weight::Nano);
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(variant),
    source,
    dispatcher,
    RecordingSink::default(),
  );

  assert!(matches!(
    pipeline.start(),
    Err(PipelineError::DispatchError(
      DispatchError::UnsupportedConfiguration { .. }
    ))
  ));
  assert_eq!(pipeline.state(), PipelineState::Idle);
  assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
}

#[test]
fn no_overlay_updates_after_stop() {
  let (source, _) = source(vec![nv12(64, 48)], None, Duration::from_millis(2));
  let (dispatcher, _) = dispatcher(false, Duration::from_millis(20));
  let sink = RecordingSink::default();
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(detect_nano()),
    source,
    dispatcher,
    sink.clone(),
  );

  pipeline.start().unwrap();
  assert_eq!(pipeline.state(), PipelineState::Running);
  assert!(wait_until(Duration::from_secs(5), || sink.len() >= 2));

  pipeline.stop();
  assert_eq!(pipeline.state(), PipelineState::Stopped);
  // 至多还有一次 stop 前已开始的渲染
  let rendered = sink.len();
  thread::sleep(Duration::from_millis(200));
  let settled = sink.len();
  assert!(settled <= rendered + 1);
  thread::sleep(Duration::from_millis(200));
  assert_eq!(sink.len(), settled);
  assert_eq!(pipeline.stats().rendered as usize, settled);
}

#[test]
fn restart_reuses_device_and_loaded_backend() {
  let (source, camera) = source(vec![nv12(64, 48)], None, Duration::from_millis(2));
  let (dispatcher, backend) = dispatcher(false, Duration::ZERO);
  let sink = RecordingSink::default();
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(detect_nano()),
    source,
    dispatcher,
    sink.clone(),
  );

  pipeline.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || sink.len() >= 1));
  pipeline.stop();
  let first_run = sink.len();

  pipeline.start().unwrap();
  assert_eq!(pipeline.state(), PipelineState::Running);
  assert!(wait_until(Duration::from_secs(5), || sink.len() > first_run));

  assert_eq!(camera.discoveries.load(Ordering::SeqCst), 1);
  assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
  pipeline.shutdown().unwrap();
}

#[test]
fn start_and_stop_are_idempotent() {
  let (source, camera) = source(vec![nv12(64, 48)], None, Duration::from_millis(2));
  let (dispatcher, backend) = dispatcher(false, Duration::ZERO);
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(detect_nano()),
    source,
    dispatcher,
    RecordingSink::default(),
  );

  pipeline.start().unwrap();
  pipeline.start().unwrap();
  assert_eq!(pipeline.state(), PipelineState::Running);
  assert_eq!(camera.discoveries.load(Ordering::SeqCst), 1);
  assert_eq!(backend.loads.load(Ordering::SeqCst), 1);

  pipeline.stop();
  pipeline.stop();
  assert_eq!(pipeline.state(), PipelineState::Stopped);
  pipeline.shutdown().unwrap();
}

#[test]
fn result_in_flight_at_stop_is_discarded() {
  let (source, _) = source(vec![nv12(64, 48)], None, Duration::from_millis(2));
  let (dispatcher, backend, release) = gated_dispatcher();
  let sink = RecordingSink::default();
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(detect_nano()),
    source,
    dispatcher,
    sink.clone(),
  );

  pipeline.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || backend
    .predictions
    .load(Ordering::SeqCst)
    >= 1));
  pipeline.stop();
  drop(release);

  assert!(wait_until(Duration::from_secs(5), || pipeline.stats().discarded >= 1));
  let stats = pipeline.stats();
  assert_eq!(stats.inferred, 1);
  assert_eq!(stats.rendered, 0);
  assert_eq!(sink.len(), 0);
  pipeline.shutdown().unwrap();
  assert_eq!(sink.len(), 0);
}

#[test]
fn stop_does_not_wait_for_a_slow_render() {
  let (source, _) = source(vec![nv12(64, 48)], None, Duration::from_millis(2));
  let (dispatcher, _) = dispatcher(false, Duration::ZERO);
  let sink = RecordingSink {
    latency: Duration::from_millis(500),
    ..RecordingSink::default()
  };
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(detect_nano()),
    source,
    dispatcher,
    sink.clone(),
  );

  pipeline.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || pipeline.stats().inferred >= 1));
  let started = Instant::now();
  pipeline.stop();
  assert!(started.elapsed() < Duration::from_millis(100));
  assert_eq!(pipeline.state(), PipelineState::Stopped);

  pipeline.shutdown().unwrap();
  assert!(sink.len() <= 1);
}

#[test]
fn restart_does_not_wait_for_previous_inference() {
  let (source, _) = source(vec![nv12(64, 48)], None, Duration::from_millis(2));
  let (dispatcher, backend, release) = gated_dispatcher();
  let sink = RecordingSink::default();
  let mut pipeline = DetectionPipeline::new(
    PipelineConfig::new(detect_nano()),
    source,
    dispatcher,
    sink.clone(),
  );

  pipeline.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || backend
    .predictions
    .load(Ordering::SeqCst)
    >= 1));
  pipeline.stop();

  let started = Instant::now();
  pipeline.start().unwrap();
  assert!(started.elapsed() < Duration::from_millis(500));
  assert_eq!(pipeline.state(), PipelineState::Running);
  assert_eq!(sink.len(), 0);

  drop(release);
  assert!(wait_until(Duration::from_secs(5), || sink.len() >= 1));
  assert!(pipeline.stats().discarded >= 1);
  assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
  pipeline.shutdown().unwrap();
}

#[test]
fn layout_updates_apply_to_later_frames() {
  let (source, _) = source(vec![nv12(1080, 1920)], None, Duration::from_millis(5));
  let (dispatcher, _) = dispatcher(false, Duration::ZERO);
  let sink = RecordingSink::default();
  let config = PipelineConfig::new(detect_nano()).with_layout(portrait_layout());
  let mut pipeline = DetectionPipeline::new(config, source, dispatcher, sink.clone());

  pipeline.start().unwrap();
  assert!(wait_until(Duration::from_secs(5), || sink.len() >= 1));

  pipeline.update_layout(DisplayLayout {
    orientation: DeviceOrientation::Portrait,
    preview: Size::new(780.0, 1688.0),
  });
  let before = sink.len();
  assert!(wait_until(Duration::from_secs(5), || sink.len() > before + 1));
  pipeline.stop();

  let frames = sink.frames.lock().unwrap();
  let last = frames.last().unwrap();
  assert_eq!(last.geometry.position.x, 390.0);
  assert_eq!(last.geometry.position.y, 844.0);
}
