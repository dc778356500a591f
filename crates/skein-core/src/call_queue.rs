//! 调用队列：单线程派发循环的唯一入口。
//!
//! # Why
//! 整个核心只有一条规则是跨线程共享状态真正需要同步原语的地方：工作线程池
//! 把"阻塞调用已完成"这件事报告回来的通道。除此之外的一切——Stream 状态翻转、
//! 回调触发、协程 step——都只发生在派发线程上（spec §5 "Shared-resource
//! policy"）。把这唯一的多生产者入口收敛成一个队列，其余代码就可以假设自己
//! 独占式地运行，不需要到处加锁。
//!
//! # How
//! `parking_lot::Mutex<VecDeque<Thunk>>` 装 thunk；配一个 `parking_lot::Condvar`
//! 在 `add`/`asap` 之后 `notify_all`，`run` 循环在 `exclusive` 区间里排空队列，
//! 排空后用 `Condvar::wait_for` 等待新工作或超时（spec §4.7 的 500ms 轮询）。
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{SkeinError, SkeinErrorKind};

/// 队列里存放的延迟调用：一个无参、无返回值的闭包。
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    queue: Mutex<VecDeque<Thunk>>,
    condvar: Condvar,
}

/// 进程内可共享、可克隆句柄的调用队列。
#[derive(Clone)]
pub struct CallQueue {
    inner: Arc<Inner>,
}

impl Default for CallQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallQueue {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { queue: Mutex::new(VecDeque::new()), condvar: Condvar::new() }) }
    }

    /// 从任意线程（调度线程或工作线程）追加一个待执行的 thunk。
    pub fn add(&self, thunk: impl FnOnce() + Send + 'static) {
        self.inner.queue.lock().push_back(Box::new(thunk));
        self.inner.condvar.notify_all();
    }

    /// `asap` 和 `add` 语义完全一致；单独保留这个名字是为了让调用点读起来
    /// 和 spec §4.1 描述的"从工作线程上下文调用的 add"对齐。
    pub fn asap(&self, thunk: impl FnOnce() + Send + 'static) {
        self.add(thunk);
    }

    /// 把当前积压的 thunk 整体取出并按 FIFO 顺序逐一执行，返回执行个数。
    ///
    /// 每个 thunk 都在 `catch_unwind` 里执行；一旦捕获到 panic，转换为一个
    /// dispatcher-fatal 的 [`SkeinError`] 并提前返回，绝不静默吞掉
    /// （spec §4.1 "A thunk that raises must terminate the dispatcher with
    /// that failure"）。
    pub fn drain_once(&self) -> Result<usize, SkeinError> {
        let batch: Vec<Thunk> = {
            let mut queue = self.inner.queue.lock();
            queue.drain(..).collect()
        };
        let count = batch.len();
        if count > 0 {
            tracing::trace!(count, "dispatcher draining call queue");
        }
        for thunk in batch {
            let result = panic::catch_unwind(AssertUnwindSafe(thunk));
            if let Err(payload) = result {
                let message = panic_message(&payload);
                tracing::error!(%message, "call queue thunk panicked, terminating dispatcher");
                return Err(SkeinError::new(SkeinErrorKind::User)
                    .with_message(format!("call queue thunk panicked: {message}")));
            }
        }
        Ok(count)
    }

    /// 阻塞等待至多 `timeout` 时长，直到队列非空或超时；返回时不保证队列非空
    /// （调用方应当在循环里重新检查退出条件，而不是依赖这次唤醒一定有活干）。
    pub fn wait_for_work(&self, timeout: Duration) {
        let mut queue = self.inner.queue.lock();
        if queue.is_empty() {
            let _ = self.inner.condvar.wait_for(&mut queue, timeout);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
