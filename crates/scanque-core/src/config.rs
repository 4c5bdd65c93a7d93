//! 配置文件加载（TOML）
//!
//! ```toml
//! [dispatch]
//! max_threads = 4
//! idle_backoff_ms = 1
//! wake_mode = "notify"      # 或 "poll"
//! capacity = 65536          # 省略则不设上限
//! overflow = "drop-newest"  # "block" | "drop-oldest" | "drop-newest"
//! shutdown_grace_ms = 5000
//! ```
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::options::{DispatchOptions, OverflowPolicy, WakeMode};

/// `[dispatch]` 段；缺省字段沿用 `DispatchOptions::default()`
#[derive(Debug, Clone, Default, Deserialize)]
struct DispatchSection {
    #[serde(default)]
    max_threads: Option<usize>,
    #[serde(default)]
    idle_backoff_ms: Option<u64>,
    #[serde(default)]
    wake_mode: Option<WakeMode>,
    #[serde(default)]
    capacity: Option<usize>,
    #[serde(default)]
    overflow: Option<OverflowPolicy>,
    #[serde(default)]
    shutdown_grace_ms: Option<u64>,
}

/// 顶层配置文件结构
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    dispatch: DispatchSection,
}

/// 从 TOML 文件加载调度选项
pub fn load_options(path: &Path) -> Result<DispatchOptions> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    parse_options(&txt).with_context(|| format!("parse config file {}", path.display()))
}

/// 解析 TOML 文本
pub fn parse_options(txt: &str) -> Result<DispatchOptions> {
    let parsed: ConfigFile = toml::from_str(txt)?;
    let d = parsed.dispatch;
    let mut opts = DispatchOptions::default();

    if d.max_threads.is_some() {
        opts.max_threads = d.max_threads;
    }
    if let Some(ms) = d.idle_backoff_ms {
        opts.idle_backoff = Duration::from_millis(ms);
    }
    if let Some(mode) = d.wake_mode {
        opts.wake_mode = mode;
    }
    if d.capacity.is_some() {
        opts.capacity = d.capacity;
    }
    if let Some(policy) = d.overflow {
        opts.overflow = policy;
    }
    if let Some(ms) = d.shutdown_grace_ms {
        opts.shutdown_grace = Duration::from_millis(ms);
    }

    opts.validate().map_err(anyhow::Error::msg)?;
    Ok(opts)
}
