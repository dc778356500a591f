//! Runtime：把调用队列、工作线程池和"运行中任务"根集合捆成一个可以独立
//! 实例化的句柄。
//!
//! # Why
//! spec §9 把调用队列和运行中任务根集合描述成"进程范围的单例"。照搬成真正的
//! 进程级 `static` 在库代码里是一个反模式——它会让同一个进程里跑的多个独立
//! `run` 调用（最典型的场景就是测试：`cargo test` 默认在同一进程里并发跑很多
//! `#[test]`）互相串线，一个测试派发的 Task 可能被另一个测试的 `run` 循环排
//! 空掉。这里选择偏离单例设计：[`Runtime`] 是一个显式构造、可以被多个独立
//! `run`/`run_with_cancellation` 调用各自持有一份的句柄，调用队列、线程池和
//! 根集合都挂在它上面而不是挂在进程上。这个偏离记录在 DESIGN.md。
//!
//! # How
//! `Runtime` 内部全是 `Arc`/`Clone` 句柄，克隆成本是几个指针拷贝；`spawn_task`
//! 接收 `&Runtime` 并把它克隆一份存进新建的 `Task`，之后这个 Task 发出的所有
//! 调度动作（`step` 重新入队、`inner.thread` 的结果回传）都通过这同一份
//! `CallQueue`/`WorkerPool` 进行。
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::call_queue::CallQueue;
use crate::config::RuntimeConfig;
use crate::ids::TaskId;
use crate::worker_pool::WorkerPool;

type RootedTask = Arc<dyn Any + Send + Sync>;

struct Inner {
    call_queue: CallQueue,
    worker_pool: Arc<WorkerPool>,
    running_tasks: Mutex<HashMap<TaskId, RootedTask>>,
    poll_interval: Duration,
}

/// 一次独立的运行时实例：一个调用队列 + 一个工作线程池 + 一个运行中任务根集合。
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// 按给定配置构造一个全新的运行时实例。
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                call_queue: CallQueue::new(),
                worker_pool: Arc::new(WorkerPool::new(config.resolved_worker_threads())),
                running_tasks: Mutex::new(HashMap::new()),
                poll_interval: config.poll_interval,
            }),
        }
    }

    /// 用 [`RuntimeConfig::default`] 构造；大多数调用点（尤其是测试）不需要
    /// 关心轮询间隔或线程数，这个入口省去显式传配置的样板。
    pub fn with_defaults() -> Self {
        Self::new(&RuntimeConfig::default())
    }

    pub(crate) fn call_queue(&self) -> &CallQueue {
        &self.inner.call_queue
    }

    pub(crate) fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.inner.worker_pool
    }

    /// `run`/`run_with_cancellation`'s wait-for-more-work timeout (spec §4.7:
    /// "waiting up to 500 ms on an event the call queue sets when new work
    /// arrives").
    pub(crate) fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    /// 把一个刚启动的 Task 根在这个运行时的"运行中任务"集合里，防止它在没有
    /// 外部持有者的情况下被提前释放（spec §3 Lifecycles："rooted in a
    /// process-wide running tasks set until finalized"）。
    pub(crate) fn root(&self, id: TaskId, task: RootedTask) {
        self.inner.running_tasks.lock().insert(id, task);
    }

    /// Task 终结时调用，把自己从根集合里摘掉。
    pub(crate) fn unroot(&self, id: TaskId) {
        self.inner.running_tasks.lock().remove(&id);
    }

    /// 当前仍被根住（尚未终结）的任务数；主要用于测试断言和可观测性。
    pub fn rooted_task_count(&self) -> usize {
        self.inner.running_tasks.lock().len()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::with_defaults()
    }
}
