//! 运行时配置：`run` 循环的轮询节奏与工作线程池规模。
//!
//! 教师仓库的配置层（`spark-core/src/configuration/`）是一整套分层构建器
//! （文件 + 环境变量 + 默认值合并）。单进程的并发运行时核心不需要那么多——
//! 这里只保留"默认值 + 环境变量覆盖"两层，字段也只剩下调度循环真正用得到的
//! 几个旋钮。
use std::time::Duration;

/// 派发循环和工作线程池的可调参数。
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `run`/`run_with_cancellation` 在每一轮排空调用队列之后，等待新工作
    /// 到来的最长时间（spec §4.7："waiting up to 500 ms on an event"）。
    pub poll_interval: Duration,
    /// 工作线程池的线程数；`None` 时退回 `std::thread::available_parallelism()`。
    pub worker_threads: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(500), worker_threads: None }
    }
}

impl RuntimeConfig {
    /// 从环境变量覆盖默认值：
    /// - `SKEIN_POLL_INTERVAL_MS`：轮询间隔（毫秒）。
    /// - `SKEIN_WORKER_THREADS`：工作线程数。
    ///
    /// 解析失败的条目记一条 `tracing::warn!` 并回退到默认值，不让配置错误
    /// 中断整个进程启动。
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("SKEIN_POLL_INTERVAL_MS") {
            match raw.parse::<u64>() {
                Ok(millis) => config.poll_interval = Duration::from_millis(millis),
                Err(error) => {
                    tracing::warn!(value = %raw, %error, "invalid SKEIN_POLL_INTERVAL_MS, using default");
                }
            }
        }
        if let Ok(raw) = std::env::var("SKEIN_WORKER_THREADS") {
            match raw.parse::<usize>() {
                Ok(threads) => config.worker_threads = Some(threads),
                Err(error) => {
                    tracing::warn!(value = %raw, %error, "invalid SKEIN_WORKER_THREADS, using default");
                }
            }
        }
        config
    }

    pub(crate) fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        })
    }
}
