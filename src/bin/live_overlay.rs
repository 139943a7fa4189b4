// 该文件是 Shiye （视野） 项目的一部分。
// src/bin/live_overlay.rs - 实时检测覆盖层示例
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
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use shiye::{
  FromUrl,
  input::{FrameSource, ProviderWrapper},
  model::{LoaderWrapper, ModelDispatcher, ModelVariant, Task, Weight},
  output::OutputWrapper,
  overlay::{DeviceOrientation, DisplayLayout, Size},
  pipeline::{DetectionPipeline, PipelineConfig, PipelineState},
};

/// Shiye 实时覆盖层参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型目录，例如 rknn:///opt/models
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入设备，例如 v4l:///dev/video0
  #[arg(long, value_name = "SOURCE", default_value = "v4l://")]
  pub input: Url,
  /// 输出，例如 log:// 或 jsonl:///tmp/overlay.jsonl
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 任务: detect / segment
  #[arg(long, value_name = "TASK", default_value = "detect")]
  pub task: Task,
  /// 权重规模: n / s / m / l / x
  #[arg(long, value_name = "WEIGHT", default_value = "n")]
  pub weight: Weight,
  /// 每 N 帧推理一次
  #[arg(long, value_name = "N", default_value = "1")]
  pub interval: NonZeroU32,
  /// 预览区域尺寸（点）
  #[arg(long, value_name = "WxH", default_value = "390x844")]
  pub preview: Size,
  /// 设备朝向
  #[arg(long, value_name = "ORIENTATION", default_value = "portrait")]
  pub orientation: DeviceOrientation,
  /// 渲染指定次数后退出，0 表示不限制
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出: {}", args.output);

  let variant = ModelVariant::new(args.task, args.weight);
  let config = PipelineConfig::new(variant)
    .with_interval(args.interval)
    .with_layout(DisplayLayout {
      orientation: args.orientation,
      preview: args.preview,
    });

  let source = FrameSource::new(ProviderWrapper::from_url(&args.input)?.into_provider());
  let dispatcher = ModelDispatcher::new(LoaderWrapper::from_url(&args.model)?.into_loader());
  let output = OutputWrapper::from_url(&args.output)?;

  let mut pipeline = DetectionPipeline::new(config, source, dispatcher, output);

  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;

  pipeline.start()?;
  info!("开始处理图像流...");

  loop {
    if rx.recv_timeout(Duration::from_millis(100)).is_ok() {
      warn!("中断信号接收，退出任务循环");
      break;
    }
    if pipeline.state() != PipelineState::Running {
      warn!("流水线已不在运行，退出任务循环");
      break;
    }
    let stats = pipeline.stats();
    if args.frame_number > 0 && stats.rendered >= args.frame_number {
      info!("达到指定帧数 {}, 退出任务循环", stats.rendered);
      break;
    }
  }

  let stats = pipeline.stats();
  pipeline.shutdown()?;
  info!(
    "任务完成: 收到 {} 帧, 节流 {} 帧, 推理 {} 帧, 失败 {} 帧, 渲染 {} 次, 丢弃 {} 次",
    stats.received,
    stats.throttled,
    stats.inferred,
    stats.failed,
    stats.rendered,
    stats.discarded
  );
  Ok(())
}
