// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/frame.rs - 分析帧与背压槽位
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

use std::sync::{Arc, Condvar, Mutex, Weak};

use image::RgbImage;
use tracing::trace;

/// 帧的顺时针旋转角度。转正该角度后画面即为直立。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  /// 从角度数值构造，非 90 倍数返回 None
  pub fn from_degrees(degrees: u32) -> Option<Rotation> {
    match degrees % 360 {
      0 => Some(Rotation::Deg0),
      90 => Some(Rotation::Deg90),
      180 => Some(Rotation::Deg180),
      270 => Some(Rotation::Deg270),
      _ => None,
    }
  }

  pub fn degrees(self) -> u32 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 90,
      Rotation::Deg180 => 180,
      Rotation::Deg270 => 270,
    }
  }
}

/// 分析帧
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 帧索引
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
  /// 旋转元数据
  pub rotation: Rotation,
}

struct SlotState {
  latest: Option<Frame>,
  in_flight: bool,
  closed: bool,
  offered: u64,
  dropped: u64,
}

/// 最新帧槽位。
///
/// 容量固定为 1：分析器落后时，新帧直接顶替未消费的旧帧，绝不排队。
/// 同一时刻至多有一个租约在外（上一帧未释放前不派发下一帧），
/// 由此保证分析回调严格串行。
pub struct LatestSlot {
  state: Mutex<SlotState>,
  cond: Condvar,
  this: Weak<LatestSlot>,
}

impl LatestSlot {
  pub fn new() -> Arc<LatestSlot> {
    Arc::new_cyclic(|this| LatestSlot {
      state: Mutex::new(SlotState {
        latest: None,
        in_flight: false,
        closed: false,
        offered: 0,
        dropped: 0,
      }),
      cond: Condvar::new(),
      this: this.clone(),
    })
  }

  /// 相机线程投递一帧。槽位已关闭时帧被直接丢弃。
  pub fn offer(&self, frame: Frame) {
    let mut state = self.state.lock().expect("槽位锁中毒");
    if state.closed {
      return;
    }
    state.offered += 1;
    if let Some(stale) = state.latest.replace(frame) {
      state.dropped += 1;
      trace!("丢弃过期帧 {}", stale.index);
    }
    drop(state);
    self.cond.notify_all();
  }

  /// 取出最新帧的租约。
  ///
  /// 上一份租约尚未释放、或暂无新帧时阻塞等待；槽位关闭后返回 None。
  pub fn next_lease(&self) -> Option<FrameLease> {
    let mut state = self.state.lock().expect("槽位锁中毒");
    loop {
      if state.closed {
        return None;
      }
      if !state.in_flight {
        if let Some(frame) = state.latest.take() {
          state.in_flight = true;
          return Some(FrameLease {
            frame,
            slot: self.this.upgrade().expect("槽位只会以 Arc 形式构造"),
            released: false,
          });
        }
      }
      state = self.cond.wait(state).expect("槽位锁中毒");
    }
  }

  /// 关闭槽位：唤醒等待方，丢弃未消费帧，此后的投递均被忽略。
  pub fn close(&self) {
    let mut state = self.state.lock().expect("槽位锁中毒");
    state.closed = true;
    state.latest = None;
    drop(state);
    self.cond.notify_all();
  }

  /// 因背压被丢弃的帧数
  pub fn dropped(&self) -> u64 {
    self.state.lock().expect("槽位锁中毒").dropped
  }

  /// 已投递的帧数
  pub fn offered(&self) -> u64 {
    self.state.lock().expect("槽位锁中毒").offered
  }

  fn finish_lease(&self) {
    let mut state = self.state.lock().expect("槽位锁中毒");
    state.in_flight = false;
    drop(state);
    self.cond.notify_all();
  }
}

/// 帧租约。
///
/// 持有期间槽位不会派发下一帧。释放恰好一次：显式调用 [`FrameLease::release`]，
/// 或随 Drop 自动释放，二者不会叠加。
pub struct FrameLease {
  frame: Frame,
  slot: Arc<LatestSlot>,
  released: bool,
}

impl FrameLease {
  pub fn frame(&self) -> &Frame {
    &self.frame
  }

  /// 释放租约，允许槽位派发下一帧
  pub fn release(mut self) {
    self.release_once();
  }

  fn release_once(&mut self) {
    if !self.released {
      self.released = true;
      self.slot.finish_lease();
    }
  }
}

impl Drop for FrameLease {
  fn drop(&mut self) {
    self.release_once();
  }
}
