// 该文件是 Shiye （视野） 项目的一部分。
// src/pipeline.rs - 实时检测流水线
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
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::frame::{CaptureFormat, PixelBuffer, PixelEncoding};
use crate::input::{FrameSource, FrameSourceError, SlotReceiver};
use crate::model::{DispatchError, ModelDispatcher, ModelVariant, decode_detections};
use crate::output::{OverlayFrame, RenderSink};
use crate::overlay::{DisplayLayout, DisplayTransformContext, Size};
use crate::throttle::FrameThrottle;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("采集错误: {0}")]
  SourceError(#[from] FrameSourceError),
  #[error("模型错误: {0}")]
  DispatchError(#[from] DispatchError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("处理线程异常退出")]
  WorkerPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
  Idle,
  Configuring,
  Running,
  Stopped,
}

impl PipelineState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => PipelineState::Idle,
      1 => PipelineState::Configuring,
      2 => PipelineState::Running,
      _ => PipelineState::Stopped,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
  pub variant: ModelVariant,
  pub interval: NonZeroU32,
  pub required_encoding: PixelEncoding,
  pub layout: DisplayLayout,
}

impl PipelineConfig {
  pub fn new(variant: ModelVariant) -> Self {
    Self {
      variant,
      interval: NonZeroU32::MIN,
      required_encoding: PixelEncoding::Nv12,
      layout: DisplayLayout::default(),
    }
  }

  pub fn with_interval(mut self, interval: NonZeroU32) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_required_encoding(mut self, encoding: PixelEncoding) -> Self {
    self.required_encoding = encoding;
    self
  }

  pub fn with_layout(mut self, layout: DisplayLayout) -> Self {
    self.layout = layout;
    self
  }
}

/// 流水线计数快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
  /// 处理线程收到的帧
  pub received: u64,
  /// 被节流丢弃的帧
  pub throttled: u64,
  /// 推理成功的帧
  pub inferred: u64,
  /// 推理或解码失败的帧
  pub failed: u64,
  /// 交给渲染端的覆盖层更新
  pub rendered: u64,
  /// 停止后被丢弃的结果
  pub discarded: u64,
}

#[derive(Default)]
struct Counters {
  received: AtomicU64,
  throttled: AtomicU64,
  inferred: AtomicU64,
  failed: AtomicU64,
  rendered: AtomicU64,
  discarded: AtomicU64,
}

impl Counters {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn snapshot(&self) -> PipelineStats {
    PipelineStats {
      received: self.received.load(Ordering::Relaxed),
      throttled: self.throttled.load(Ordering::Relaxed),
      inferred: self.inferred.load(Ordering::Relaxed),
      failed: self.failed.load(Ordering::Relaxed),
      rendered: self.rendered.load(Ordering::Relaxed),
      discarded: self.discarded.load(Ordering::Relaxed),
    }
  }
}

struct Shared {
  state: AtomicU8,
  layout: Mutex<DisplayLayout>,
  counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
  fn state(&self) -> PipelineState {
    PipelineState::from_u8(self.state.load(Ordering::Acquire))
  }

  fn set_state(&self, state: PipelineState) {
    let previous = PipelineState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
    if previous != state {
      debug!("流水线状态: {:?} -> {:?}", previous, state);
    }
  }

  /// 仅当当前状态为 `from` 时切换，返回是否切换成功
  fn transition(&self, from: PipelineState, to: PipelineState) -> bool {
    let switched = self
      .state
      .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
      .is_ok();
    if switched {
      debug!("流水线状态: {:?} -> {:?}", from, to);
    }
    switched
  }
}

/// 跨会话复用的组件，同一时刻只被一个处理线程使用
struct Components<S> {
  dispatcher: ModelDispatcher,
  sink: S,
}

/// 一次会话的处理线程
struct Run<S> {
  active: Arc<AtomicBool>,
  components: Arc<Mutex<Components<S>>>,
  shared: Arc<Shared>,
  throttle: FrameThrottle,
  variant: ModelVariant,
  capture_resolution: Size,
}

impl<S> Run<S> {
  fn is_active(&self) -> bool {
    self.active.load(Ordering::Acquire)
  }
}

/// 实时检测流水线
///
/// 持有采集、节流、模型分发与渲染端。采集线程只负责产帧，
/// 节流、推理、坐标变换和渲染调用都在处理线程上顺序执行，
/// 任何时刻最多只有一帧在处理。
pub struct DetectionPipeline<S: RenderSink + 'static> {
  config: PipelineConfig,
  source: FrameSource,
  shared: Arc<Shared>,
  components: Arc<Mutex<Components<S>>>,
  /// 当前会话的运行标志
  active: Option<Arc<AtomicBool>>,
  workers: Vec<JoinHandle<()>>,
  model_ready: bool,
}

impl<S: RenderSink + 'static> DetectionPipeline<S> {
  pub fn new(
    config: PipelineConfig,
    source: FrameSource,
    dispatcher: ModelDispatcher,
    sink: S,
  ) -> Self {
    let shared = Arc::new(Shared {
      state: AtomicU8::new(PipelineState::Idle as u8),
      layout: Mutex::new(config.layout),
      counters: Counters::default(),
    });

    Self {
      source: source.with_required_encoding(config.required_encoding),
      components: Arc::new(Mutex::new(Components { dispatcher, sink })),
      config,
      shared,
      active: None,
      workers: Vec::new(),
      model_ready: false,
    }
  }

  pub fn state(&self) -> PipelineState {
    self.shared.state()
  }

  pub fn stats(&self) -> PipelineStats {
    self.shared.counters.snapshot()
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// 当前会话的采集格式
  pub fn capture_format(&self) -> Option<CaptureFormat> {
    self.source.active_format()
  }

  /// 布局或设备朝向变化时由界面侧调用，下一个被接受的帧生效
  pub fn update_layout(&self, layout: DisplayLayout) {
    *lock(&self.shared.layout) = layout;
  }

  /// 启动流水线
  ///
  /// 模型加载、设备发现与格式协商同步完成，失败时返回错误并回到 `Idle`；
  /// 采集与处理在后台线程中运行。已在运行时直接返回。
  /// 不会等待上一次会话中仍在进行的推理。
  pub fn start(&mut self) -> Result<(), PipelineError> {
    if self.state() == PipelineState::Running {
      debug!("流水线已在运行，忽略重复启动");
      return Ok(());
    }

    self.shared.set_state(PipelineState::Configuring);
    match self.configure() {
      Ok(()) => {
        info!("流水线已启动: {}", self.config.variant);
        Ok(())
      }
      Err(e) => {
        error!("流水线启动失败: {}", e);
        self.shared.set_state(PipelineState::Idle);
        Err(e)
      }
    }
  }

  fn configure(&mut self) -> Result<(), PipelineError> {
    // 变体固定，首次加载成功后后端常驻，之后无需再次获取组件锁
    if !self.model_ready {
      lock(&self.components).dispatcher.load(self.config.variant)?;
      self.model_ready = true;
    }

    // 采集线程在下一帧边界退出，不涉及推理
    self.source.reclaim()?;
    let (format, frames) = self.source.start()?.ok_or_else(|| {
      FrameSourceError::Device("采集会话仍在运行".to_string())
    })?;

    let active = Arc::new(AtomicBool::new(true));
    let run = Run {
      active: active.clone(),
      components: self.components.clone(),
      shared: self.shared.clone(),
      throttle: FrameThrottle::new(self.config.interval),
      variant: self.config.variant,
      capture_resolution: Size::new(format.width as f64, format.height as f64),
    };

    // 处理线程可能在 spawn 返回前就收到帧
    self.shared.set_state(PipelineState::Running);
    let spawned = thread::Builder::new()
      .name("shiye-worker".to_string())
      .spawn(move || process_frames(run, frames));

    match spawned {
      Ok(handle) => {
        self.workers.retain(|worker| !worker.is_finished());
        self.workers.push(handle);
        self.active = Some(active);
        Ok(())
      }
      Err(e) => {
        self.source.stop();
        Err(e.into())
      }
    }
  }

  /// 停止流水线，不等待后台线程
  ///
  /// 调用后不再开始新的渲染，正在进行的推理结果会被丢弃。
  pub fn stop(&mut self) {
    if !self
      .shared
      .transition(PipelineState::Running, PipelineState::Stopped)
    {
      return;
    }
    if let Some(active) = &self.active {
      active.store(false, Ordering::Release);
    }
    self.source.stop();
    info!("流水线已停止");
  }

  /// 停止并等待所有后台线程退出
  pub fn shutdown(mut self) -> Result<(), PipelineError> {
    self.stop();
    for worker in self.workers.drain(..) {
      worker.join().map_err(|_| PipelineError::WorkerPanicked)?;
    }
    self.source.reclaim()?;
    Ok(())
  }
}

impl<S: RenderSink + 'static> Drop for DetectionPipeline<S> {
  fn drop(&mut self) {
    self.stop();
  }
}

fn process_frames<S: RenderSink>(mut run: Run<S>, frames: SlotReceiver<PixelBuffer>) {
  info!("处理线程启动");
  let shared = run.shared.clone();
  let counters = &shared.counters;

  while let Some(buffer) = frames.recv() {
    Counters::bump(&counters.received);
    if !run.is_active() {
      Counters::bump(&counters.discarded);
      continue;
    }

    if !run.throttle.should_process() {
      trace!("第 {} 帧被节流", buffer.index());
      Counters::bump(&counters.throttled);
      continue;
    }

    let frame_index = buffer.index();
    let mut components = lock(&run.components);
    let result = match components.dispatcher.predict(run.variant, &buffer) {
      Ok(result) => result,
      Err(e) => {
        warn!("第 {} 帧推理失败，跳过: {}", frame_index, e);
        Counters::bump(&counters.failed);
        continue;
      }
    };
    drop(buffer);

    let detections = match decode_detections(&result) {
      Ok(detections) => detections,
      Err(e) => {
        warn!("第 {} 帧结果解码失败，跳过: {}", frame_index, e);
        Counters::bump(&counters.failed);
        continue;
      }
    };
    Counters::bump(&counters.inferred);

    let layout = *lock(&shared.layout);
    let context = DisplayTransformContext::new(layout, run.capture_resolution);
    let overlay = OverlayFrame::compose(frame_index, detections, &context);

    if !run.is_active() {
      debug!("流水线已停止，丢弃第 {} 帧结果", frame_index);
      Counters::bump(&counters.discarded);
      continue;
    }
    match components.sink.render(&overlay) {
      Ok(()) => Counters::bump(&counters.rendered),
      Err(e) => warn!("第 {} 帧渲染失败: {}", frame_index, e),
    }
  }

  if run.active.swap(false, Ordering::AcqRel)
    && shared.transition(PipelineState::Running, PipelineState::Stopped)
  {
    warn!("采集已结束，流水线停止");
  }
  info!("处理线程退出, 丢弃过期帧 {} 帧", frames.dropped());
}
