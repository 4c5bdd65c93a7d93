use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{select, tick, Receiver, Sender};
use scanque_core::{
    load_options, DispatchOptions, DispatchSubsystem, EnqueueError, EventProducer, EventSource, OverflowPolicy,
    ScanEvent, ShutdownKind, WakeMode,
};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "scanque", version, about = "按需扫描事件队列与调度")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 遍历目录，把每个文件当作一次访问事件提交扫描；Ctrl+C / SIGTERM 停机。
    /// 停机过程中再收到一次信号则立即退出（130 / 143），不再等待在途扫描。
    Scan {
        /// 输入目录
        #[arg(long)]
        input: PathBuf,

        /// 配置文件路径（TOML，[dispatch] 段）；命令行参数优先
        #[arg(long)]
        config: Option<PathBuf>,

        /// 工作线程数（"auto"=CPU 核心数）
        #[arg(long, default_value = "auto")]
        threads: String,

        /// 队列容量；不指定则不设上限
        #[arg(long)]
        capacity: Option<usize>,

        /// 队列写满时的策略
        #[arg(long, value_parser = ["block", "drop-oldest", "drop-newest"])]
        overflow: Option<String>,

        /// 空闲等待方式：poll（定时轮询）或 notify（入队唤醒）
        #[arg(long, value_parser = ["poll", "notify"])]
        wake: Option<String>,

        /// 轮询模式下的空闲退避（毫秒）
        #[arg(long)]
        idle_backoff_ms: Option<u64>,

        /// 目录遍历最大深度
        #[arg(long)]
        max_depth: Option<usize>,
    },
}

/// 扫描例程的累计结果（演示用：只读文件并统计字节数）
#[derive(Debug, Default)]
struct ScanTotals {
    files: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { input, config, threads, capacity, overflow, wake, idle_backoff_ms, max_depth } => {
            info!(?input, "starting on-access scan queue");

            // 配置文件为基础，命令行参数覆盖
            let mut opts = match config {
                Some(path) => load_options(&path)?,
                None => DispatchOptions::default(),
            };
            if let Some(n) = parse_threads(&threads) {
                opts.max_threads = Some(n);
            }
            if capacity.is_some() {
                opts.capacity = capacity;
            }
            if let Some(policy) = overflow.as_deref().and_then(parse_overflow) {
                opts.overflow = policy;
            }
            if let Some(mode) = wake.as_deref().and_then(parse_wake) {
                opts.wake_mode = mode;
            }
            if let Some(ms) = idle_backoff_ms {
                opts.idle_backoff = Duration::from_millis(ms);
            }

            let totals = Arc::new(ScanTotals::default());
            let sub = {
                let totals = Arc::clone(&totals);
                DispatchSubsystem::new(move |ev: ScanEvent| scan_event(&ev, &totals))
            };
            sub.start(&opts).context("start dispatch subsystem")?;

            let (sig_tx, sig_rx) = crossbeam_channel::bounded(1);
            spawn_signal_listener(sig_tx)?;

            let producer = sub.producer().context("dispatch subsystem not running")?;
            let walker = thread::Builder::new()
                .name("event-source".into())
                .spawn(move || walk_and_enqueue(input, max_depth, &producer))
                .context("spawn event source thread")?;

            let kind = wait_until_done(&sub, &walker, &sig_rx);
            sub.request_shutdown(kind);
            let (enqueued, rejected) = match walker.join() {
                Ok(counts) => counts,
                Err(_) => {
                    error!("event source thread panicked");
                    (0, 0)
                }
            };
            let stats = sub.wait().unwrap_or_default();

            info!(
                files_scanned = totals.files.load(Ordering::Relaxed),
                dispatched = stats.dispatched,
                discarded = stats.discarded_on_shutdown,
                "scan queue finished"
            );
            let summary = serde_json::json!({
                "shutdown": kind,
                "enqueued": enqueued,
                "rejected": rejected,
                "files_scanned": totals.files.load(Ordering::Relaxed),
                "bytes_scanned": totals.bytes.load(Ordering::Relaxed),
                "read_errors": totals.errors.load(Ordering::Relaxed),
                "dispatch": stats,
            });
            serde_json::to_writer_pretty(io::stdout().lock(), &summary).context("write summary")?;
            println!();
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 支持通过环境变量 RUST_LOG 控制日志等级，如：RUST_LOG=debug
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 演示用扫描例程：读完整个文件
fn scan_event(ev: &ScanEvent, totals: &ScanTotals) {
    let res = File::open(&ev.path).and_then(|mut f| io::copy(&mut f, &mut io::sink()));
    match res {
        Ok(n) => {
            totals.files.fetch_add(1, Ordering::Relaxed);
            totals.bytes.fetch_add(n, Ordering::Relaxed);
            debug!(
                path = %ev.path.display(),
                source = ?ev.source,
                pid = ?ev.pid,
                bytes = n,
                waited = ?ev.observed_at.elapsed(),
                "scanned"
            );
        }
        Err(e) => {
            totals.errors.fetch_add(1, Ordering::Relaxed);
            warn!(path = %ev.path.display(), source = ?ev.source, pid = ?ev.pid, error = %e, "scan failed");
        }
    }
}

/// 事件源：遍历目录，每个普通文件入队一次；返回 (入队数, 被拒绝数)
fn walk_and_enqueue(input: PathBuf, max_depth: Option<usize>, producer: &EventProducer<ScanEvent>) -> (u64, u64) {
    let mut walker = WalkDir::new(&input).min_depth(1);
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }
    let (mut enqueued, mut rejected) = (0u64, 0u64);
    for entry in walker {
        let entry = match entry { Ok(e) => e, Err(_) => continue };
        if !entry.file_type().is_file() { continue; }
        match producer.enqueue(ScanEvent::new(entry.into_path(), EventSource::Manual)) {
            Ok(()) => enqueued += 1,
            Err(EnqueueError::Closed(_)) => {
                debug!("event queue closed, event source stopping");
                break;
            }
            // 队列满或内存不足：事件丢弃，不重试
            Err(e) => {
                rejected += 1;
                let reason = e.to_string();
                let ev = e.into_inner();
                debug!(error = %reason, path = %ev.path.display(), "event dropped");
            }
        }
    }
    (enqueued, rejected)
}

/// 等待停机信号，或事件源结束且调度空闲
fn wait_until_done(
    sub: &DispatchSubsystem<ScanEvent>,
    walker: &thread::JoinHandle<(u64, u64)>,
    signals: &Receiver<ShutdownKind>,
) -> ShutdownKind {
    let ticker = tick(Duration::from_millis(50));
    loop {
        select! {
            recv(signals) -> msg => {
                let kind = msg.unwrap_or(ShutdownKind::Interrupt);
                info!(%kind, "received shutdown signal");
                return kind;
            }
            recv(ticker) -> _ => {
                let idle = sub.progress().map_or(true, |p| p.is_idle());
                if walker.is_finished() && idle {
                    return ShutdownKind::Requested;
                }
            }
        }
    }
}

/// 信号监听线程：只负责把信号转成消息，停机动作由主线程发起。
/// 第一次信号之后继续监听；第二次信号直接结束进程，避免卡在宽限期内。
fn spawn_signal_listener(tx: Sender<ShutdownKind>) -> Result<()> {
    thread::Builder::new()
        .name("signal-listener".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "failed to build signal runtime");
                    return;
                }
            };
            let kind = rt.block_on(wait_for_signal());
            let _ = tx.send(kind);
            let again = rt.block_on(wait_for_signal());
            warn!(first = %kind, second = %again, "second shutdown signal, exiting without waiting for scans");
            std::process::exit(forced_exit_code(again));
        })
        .context("spawn signal listener")?;
    Ok(())
}

async fn wait_for_signal() -> ShutdownKind {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "failed to listen for Ctrl+C");
            }
            ShutdownKind::Interrupt
        }
        _ = wait_for_sigterm() => ShutdownKind::Terminate,
    }
}

/// 强制退出码：128 + 信号编号
fn forced_exit_code(kind: ShutdownKind) -> i32 {
    match kind {
        ShutdownKind::Interrupt => 130,
        ShutdownKind::Terminate => 143,
        ShutdownKind::Requested => 1,
    }
}

/// SIGTERM（容器/守护进程场景）
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") { return None; }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}

fn parse_overflow(s: &str) -> Option<OverflowPolicy> {
    match s {
        "block" => Some(OverflowPolicy::Block),
        "drop-oldest" => Some(OverflowPolicy::DropOldest),
        "drop-newest" => Some(OverflowPolicy::DropNewest),
        _ => None,
    }
}

fn parse_wake(s: &str) -> Option<WakeMode> {
    match s {
        "poll" => Some(WakeMode::Poll),
        "notify" => Some(WakeMode::Notify),
        _ => None,
    }
}
