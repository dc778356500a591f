//! 进程内唯一标识：Stream 身份与 Task 身份。
//!
//! Pipe-set 的 fan-in 需要对"同一个上游是否已经在待处理队列中"去重；Stream 的
//! 具体实现是 trait object（`dyn SkeinStream<V>`），对胖指针做 `Hash`/`Eq`
//! 既不稳定也不必要——改为在每个 Stream 构造时分配一个单调递增的 [`StreamId`]，
//! 随 Stream 本体一起存活，用作去重键。[`TaskId`] 同理用于运行中任务根集合。
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

fn next_u64(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

static STREAM_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// 某个具体 Stream 实例的进程内唯一身份。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub(crate) fn fresh() -> Self {
        Self(next_u64(&STREAM_ID_COUNTER))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// 某个具体 Task 实例的进程内唯一身份，用作运行中任务根集合的键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn fresh() -> Self {
        Self(next_u64(&TASK_ID_COUNTER))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}
