// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/state.rs - 可观察状态单元
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

use std::sync::{Arc, Mutex};

struct Versioned<T> {
  value: T,
  version: u64,
}

/// 单写者状态单元。
///
/// 写端由检测回调线程持有，读端在 UI 循环里按帧轮询；
/// 每个单元只应有一个逻辑写者。
pub fn state_cell<T: Clone + Send>(initial: T) -> (StateWriter<T>, StateReader<T>) {
  let inner = Arc::new(Mutex::new(Versioned {
    value: initial,
    version: 0,
  }));
  (
    StateWriter {
      inner: Arc::clone(&inner),
    },
    StateReader { inner },
  )
}

pub struct StateWriter<T> {
  inner: Arc<Mutex<Versioned<T>>>,
}

// 写端随每帧的终止回调闭包移动，需要可克隆；逻辑写者仍只有一个。
impl<T> Clone for StateWriter<T> {
  fn clone(&self) -> Self {
    StateWriter {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Clone + Send> StateWriter<T> {
  pub fn set(&self, value: T) {
    let mut guard = self.inner.lock().expect("状态锁中毒");
    guard.value = value;
    guard.version += 1;
  }
}

pub struct StateReader<T> {
  inner: Arc<Mutex<Versioned<T>>>,
}

impl<T> Clone for StateReader<T> {
  fn clone(&self) -> Self {
    StateReader {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Clone + Send> StateReader<T> {
  pub fn get(&self) -> T {
    self.inner.lock().expect("状态锁中毒").value.clone()
  }

  pub fn version(&self) -> u64 {
    self.inner.lock().expect("状态锁中毒").version
  }

  /// 自上次观察以来有新写入时返回最新值，并推进观察位置
  pub fn get_if_newer(&self, seen: &mut u64) -> Option<T> {
    let guard = self.inner.lock().expect("状态锁中毒");
    if guard.version > *seen {
      *seen = guard.version;
      Some(guard.value.clone())
    } else {
      None
    }
  }
}
