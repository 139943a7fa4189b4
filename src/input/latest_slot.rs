// 该文件是 Shiye （视野） 项目的一部分。
// src/input/latest_slot.rs - 容量为 1 的丢旧帧通道
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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SlotError {
  #[error("接收端已关闭")]
  Disconnected,
}

/// 创建一对容量为 1 的收发端
///
/// 发送端在槽位已满时丢弃尚未被取走的旧值，只保留最新值。
pub fn latest_slot<T>() -> (SlotSender<T>, SlotReceiver<T>) {
  let (tx, rx) = bounded(1);
  let dropped = Arc::new(AtomicU64::new(0));
  let closed = Arc::new(AtomicBool::new(false));
  (
    SlotSender {
      tx,
      drain: rx.clone(),
      dropped: dropped.clone(),
      closed: closed.clone(),
    },
    SlotReceiver {
      rx,
      dropped,
      closed,
    },
  )
}

pub struct SlotSender<T> {
  tx: Sender<T>,
  drain: Receiver<T>,
  dropped: Arc<AtomicU64>,
  closed: Arc<AtomicBool>,
}

impl<T> SlotSender<T> {
  /// 放入新值，返回是否顶替了一个旧值
  pub fn publish(&self, value: T) -> Result<bool, SlotError> {
    // `drain` 让通道始终有接收端，关闭只能靠标志判断
    if self.closed.load(Ordering::Acquire) {
      return Err(SlotError::Disconnected);
    }
    match self.tx.try_send(value) {
      Ok(()) => Ok(false),
      Err(TrySendError::Disconnected(_)) => Err(SlotError::Disconnected),
      Err(TrySendError::Full(value)) => {
        let replaced = match self.drain.try_recv() {
          Ok(_stale) => {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("槽位已满，丢弃旧帧");
            true
          }
          // 消费端恰好取走了旧值
          Err(TryRecvError::Empty) => false,
          Err(TryRecvError::Disconnected) => return Err(SlotError::Disconnected),
        };
        // 只有一个生产者，腾出位置后必然能放入
        match self.tx.try_send(value) {
          Ok(()) => Ok(replaced),
          Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
            Err(SlotError::Disconnected)
          }
        }
      }
    }
  }

  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }
}

pub struct SlotReceiver<T> {
  rx: Receiver<T>,
  dropped: Arc<AtomicU64>,
  closed: Arc<AtomicBool>,
}

impl<T> Drop for SlotReceiver<T> {
  fn drop(&mut self) {
    self.closed.store(true, Ordering::Release);
  }
}

impl<T> SlotReceiver<T> {
  /// 阻塞等待下一个值，发送端全部关闭后返回 None
  pub fn recv(&self) -> Option<T> {
    self.rx.recv().ok()
  }

  pub fn try_recv(&self) -> Option<T> {
    self.rx.try_recv().ok()
  }

  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }
}

impl<T> Iterator for SlotReceiver<T> {
  type Item = T;

  fn next(&mut self) -> Option<Self::Item> {
    self.recv()
  }
}
