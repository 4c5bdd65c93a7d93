//! 公共类型（对外暴露）
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// 事件来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Fanotify,
    Inotify,
    /// 手动提交（如 CLI 目录遍历）
    Manual,
}

/// 一次待扫描的文件访问事件
#[derive(Debug, Clone)]
pub struct ScanEvent {
    pub path: PathBuf,
    pub source: EventSource,
    /// 触发访问的进程（fanotify 才有）
    pub pid: Option<u32>,
    pub observed_at: Instant,
}

impl ScanEvent {
    pub fn new(path: impl Into<PathBuf>, source: EventSource) -> Self {
        Self { path: path.into(), source, pid: None, observed_at: Instant::now() }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// 停机原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownKind {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 程序内主动请求
    Requested,
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownKind::Interrupt => "interrupt",
            ShutdownKind::Terminate => "terminate",
            ShutdownKind::Requested => "requested",
        };
        f.write_str(s)
    }
}

impl ShutdownKind {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ShutdownKind::Interrupt => 1,
            ShutdownKind::Terminate => 2,
            ShutdownKind::Requested => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ShutdownKind::Interrupt),
            2 => Some(ShutdownKind::Terminate),
            3 => Some(ShutdownKind::Requested),
            _ => None,
        }
    }
}

/// 调度线程状态机：Starting → Running → Stopping → Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl DispatchState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            DispatchState::Starting => 0,
            DispatchState::Running => 1,
            DispatchState::Stopping => 2,
            DispatchState::Stopped => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => DispatchState::Starting,
            1 => DispatchState::Running,
            2 => DispatchState::Stopping,
            _ => DispatchState::Stopped,
        }
    }
}
