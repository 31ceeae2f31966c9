// 该文件是 Mingjing （明镜止水） 项目的一部分。
// src/permission.rs - 摄像头访问权限门
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

use std::io::{BufRead, IsTerminal};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum PermissionError {
  #[error("摄像头访问不可用: {0}")]
  Unavailable(String),
}

/// 设备访问探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessProbe {
  /// 设备可打开
  Granted,
  /// 设备存在但当前用户无权打开
  Denied,
  /// 没有可用设备
  Missing,
}

/// 访问后端。桌面环境没有系统权限对话框，
/// `request` 承担一次等价的授权交互并返回交互后的状态。
pub trait CameraAccess {
  fn probe(&self) -> AccessProbe;
  fn request(&mut self) -> AccessProbe;
}

/// 权限门呈现的视图，三者互斥，恰出现其一
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateView {
  /// 已授权，呈现受保护内容
  Content,
  /// 尚未授权，呈现说明文案与授权入口
  Rationale(String),
  /// 授权后仍被拒绝或设备缺失，指引用户到系统设置
  SettingsFallback(String),
}

/// 权限门。
///
/// 每个会话最多发起一次授权交互；交互后仍被拒绝即进入终态，
/// 直到用户在系统层面改变配置。
pub struct PermissionGate<A> {
  access: A,
  rationale: String,
  requested: bool,
}

impl<A: CameraAccess> PermissionGate<A> {
  pub fn new(access: A, rationale: impl Into<String>) -> Self {
    PermissionGate {
      access,
      rationale: rationale.into(),
      requested: false,
    }
  }

  /// 计算当前应呈现的视图
  pub fn view(&self) -> GateView {
    match self.access.probe() {
      AccessProbe::Granted => GateView::Content,
      AccessProbe::Missing => GateView::SettingsFallback(
        "未检测到摄像头设备。请确认设备已接入，或检查内核驱动。".to_string(),
      ),
      AccessProbe::Denied if !self.requested => GateView::Rationale(self.rationale.clone()),
      AccessProbe::Denied => GateView::SettingsFallback(
        "摄像头访问仍被拒绝。请将当前用户加入 video 组（usermod -aG video $USER）后重新登录。"
          .to_string(),
      ),
    }
  }

  /// 触发一次授权交互，返回交互后的视图
  pub fn request(&mut self) -> GateView {
    self.requested = true;
    match self.access.request() {
      AccessProbe::Granted => {
        info!("摄像头访问已授权");
        GateView::Content
      }
      _ => self.view(),
    }
  }

  /// 控制台驱动的权限流程：授权成功返回 Ok，终态拒绝返回 Err
  pub fn run_console(&mut self) -> Result<(), PermissionError> {
    loop {
      match self.view() {
        GateView::Content => return Ok(()),
        GateView::Rationale(message) => {
          println!("{}", message);
          self.request();
        }
        GateView::SettingsFallback(message) => {
          warn!("摄像头访问进入终态拒绝");
          return Err(PermissionError::Unavailable(message));
        }
      }
    }
  }
}

/// 基于 V4L2 设备节点的访问后端。
///
/// `device` 为空时探测枚举到的全部节点，任一可打开即视为已授权。
pub struct DeviceAccess {
  device: Option<String>,
}

impl DeviceAccess {
  pub fn new(device: Option<String>) -> Self {
    DeviceAccess { device }
  }

  fn probe_path(path: &str) -> AccessProbe {
    match v4l::Device::with_path(path) {
      Ok(_) => AccessProbe::Granted,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => AccessProbe::Missing,
      Err(_) => AccessProbe::Denied,
    }
  }
}

impl CameraAccess for DeviceAccess {
  fn probe(&self) -> AccessProbe {
    if let Some(path) = &self.device {
      return Self::probe_path(path);
    }

    let nodes = v4l::context::enum_devices();
    if nodes.is_empty() {
      return AccessProbe::Missing;
    }
    for node in &nodes {
      if let AccessProbe::Granted = Self::probe_path(&node.path().to_string_lossy()) {
        return AccessProbe::Granted;
      }
    }
    AccessProbe::Denied
  }

  fn request(&mut self) -> AccessProbe {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
      println!("请授予摄像头访问权限（通常为将用户加入 video 组），完成后按回车重试。");
      let mut line = String::new();
      let _ = stdin.lock().read_line(&mut line);
    }
    self.probe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct MockAccess {
    state: AccessProbe,
    grant_on_request: bool,
    requests: u32,
  }

  impl MockAccess {
    fn denied(grant_on_request: bool) -> Self {
      MockAccess {
        state: AccessProbe::Denied,
        grant_on_request,
        requests: 0,
      }
    }
  }

  impl CameraAccess for MockAccess {
    fn probe(&self) -> AccessProbe {
      self.state
    }

    fn request(&mut self) -> AccessProbe {
      self.requests += 1;
      if self.grant_on_request {
        self.state = AccessProbe::Granted;
      }
      self.state
    }
  }

  #[test]
  fn granted_renders_content() {
    let gate = PermissionGate::new(
      MockAccess {
        state: AccessProbe::Granted,
        grant_on_request: false,
        requests: 0,
      },
      "说明",
    );
    assert_eq!(gate.view(), GateView::Content);
  }

  #[test]
  fn not_granted_renders_rationale_first() {
    let gate = PermissionGate::new(MockAccess::denied(true), "需要摄像头权限");
    assert_eq!(
      gate.view(),
      GateView::Rationale("需要摄像头权限".to_string())
    );
  }

  #[test]
  fn missing_device_renders_settings_fallback() {
    let gate = PermissionGate::new(
      MockAccess {
        state: AccessProbe::Missing,
        grant_on_request: false,
        requests: 0,
      },
      "说明",
    );
    assert!(matches!(gate.view(), GateView::SettingsFallback(_)));
  }

  #[test]
  fn denied_then_granted_shows_content_immediately() {
    // 拒绝 → 说明 → 用户授权 → 下一次呈现即为内容
    let mut gate = PermissionGate::new(MockAccess::denied(true), "说明");
    assert!(matches!(gate.view(), GateView::Rationale(_)));
    assert_eq!(gate.request(), GateView::Content);
    assert_eq!(gate.view(), GateView::Content);
  }

  #[test]
  fn denial_after_request_is_terminal() {
    let mut gate = PermissionGate::new(MockAccess::denied(false), "说明");
    assert!(matches!(gate.view(), GateView::Rationale(_)));
    assert!(matches!(gate.request(), GateView::SettingsFallback(_)));
    // 终态：不再回到说明视图
    assert!(matches!(gate.view(), GateView::SettingsFallback(_)));
  }

  #[test]
  fn console_flow_grants_once() {
    let mut gate = PermissionGate::new(MockAccess::denied(true), "说明");
    gate.run_console().expect("授权后应通过");
    assert_eq!(gate.access.requests, 1);
  }

  #[test]
  fn console_flow_terminal_denial_errors() {
    let mut gate = PermissionGate::new(MockAccess::denied(false), "说明");
    let err = gate.run_console().expect_err("终态拒绝应报错");
    assert!(matches!(err, PermissionError::Unavailable(_)));
  }
}
