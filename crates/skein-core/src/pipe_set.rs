//! Pipe-set：一个任务的"输入窗口"，对一组会变化的上游做 fan-in。
//!
//! # Why
//! spec §4.4 描述的 Pipe-set 有一个和普通 Stream 不一样的地方："上游的终止项
//! 被改写成一个携带 Finished 标记的非终止项"——下游（拥有这个 Pipe-set 的
//! Task）看到的是"某个上游结束了"这一条数据事件，而不是自己也被终结。普通
//! `Item<V>` 的二态和（值 / 终止）装不下这件事，因为它需要同时携带"是哪个
//! 上游"和"它是怎么结束的（成功值 / 失败）"，却又不能让 Pipe-set 自己终止。
//! 这正是 `Item<V>` 被刻意折叠成二态、而 Pipe-set 刻意不通过 `SkeinStream<V>`
//! 对外暴露的原因：它只在 crate 内部（`Task` 的输入窗口、`Inner::sub` 的级联）
//! 被使用，用一个自己的 [`PipeSetEvent`] 类型表达"值 / 某上游完成"两件事。
//!
//! # How
//! 只有一个读者（拥有它的 Task 的协程）会调用 [`PipeSet::recv`]，所以不需要
//! 像 [`crate::stream::Signals`] 那样维护一整个回调 slab——一个 `Option<Callback>`
//! 就够了。`self_weak` 是 Pipe-set 为了能把"某个上游又有活动了"的通知重新排回
//! 自己的 pending 队列而持有的自引用，通过 `Arc::new_cyclic` 构造。
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;

use crate::callback::CallbackHandle;
use crate::error::SkeinError;
use crate::ids::StreamId;
use crate::item::{Item, Terminal};
use crate::stream::{Callback, StreamHandle};

/// 一次 `recv()` 得到的事件：要么是一批值，要么是某个上游完成的消息。
pub(crate) enum PipeSetEvent<V> {
    Values(Vec<V>),
    UpstreamFinished { stream: StreamId, outcome: UpstreamOutcome<V> },
}

/// 上游是如何完成的。
pub(crate) enum UpstreamOutcome<V> {
    Done(Vec<V>),
    Failed(SkeinError),
}

struct State<V> {
    pending: VecDeque<StreamId>,
    upstreams: HashMap<StreamId, StreamHandle<V>>,
    upstream_wake_handles: HashMap<StreamId, (StreamHandle<V>, CallbackHandle)>,
    finalized: bool,
    waiting: Option<Callback>,
}

pub(crate) struct PipeSet<V> {
    state: Mutex<State<V>>,
    self_weak: Weak<PipeSet<V>>,
}

impl<V: Clone + Send + Sync + 'static> PipeSet<V> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| PipeSet {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                upstreams: HashMap::new(),
                upstream_wake_handles: HashMap::new(),
                finalized: false,
                waiting: None,
            }),
            self_weak: weak.clone(),
        })
    }

    /// 把 `other` 接入这个窗口的上游集合；已经接入过或者窗口已经关闭时是 no-op
    /// （spec §4.4 "`_pipe`: no-op if present or if already finalized"）。
    pub(crate) fn pipe_in(&self, other: StreamHandle<V>) {
        let waking = {
            let mut state = self.state.lock();
            if state.finalized {
                return;
            }
            let id = other.id();
            if state.upstreams.contains_key(&id) {
                return;
            }
            state.upstreams.insert(id, other);
            state.pending.push_back(id);
            state.waiting.take()
        };
        if let Some(callback) = waking {
            callback();
        }
    }

    /// 拥有这个窗口的 Task 终结时调用：清空所有状态并丢弃每一个还挂着的、对
    /// 上游的消息回调（spec §4.4 "clear mapping, then discard each
    /// snapshotted callback"）。
    pub(crate) fn close(&self) {
        let handles: Vec<(StreamHandle<V>, CallbackHandle)> = {
            let mut state = self.state.lock();
            state.finalized = true;
            state.pending.clear();
            state.upstreams.clear();
            state.upstream_wake_handles.drain().map(|(_, pair)| pair).collect()
        };
        for (stream, handle) in handles {
            stream.discard_message_callback(handle);
        }
    }

    pub(crate) fn recv(self: &Arc<Self>) -> Recv<V> {
        Recv { set: self.clone() }
    }

    /// 核心算法（spec §4.4 `_next_raw`）：挑队头上游读一个 Item；非终止就把它
    /// 重新排到队尾并把值返回；终止就摘掉这个上游，把终止结果改写成
    /// [`PipeSetEvent::UpstreamFinished`] 返回；暂时没有数据就给它挂一个
    /// wakeup 回调，继续看队列里其他条目。队列彻底看完还是没有数据时，在同一
    /// 把锁下登记 `waiting`，保证不会错过随后任何一次重新入队。
    fn try_recv(&self, on_wake: Callback) -> Option<PipeSetEvent<V>> {
        let mut state = self.state.lock();
        loop {
            let Some(id) = state.pending.pop_front() else {
                state.waiting = Some(on_wake);
                return None;
            };
            let Some(stream) = state.upstreams.get(&id).cloned() else {
                // 队列里的过期条目：这个上游已经因为终止被摘除了。
                continue;
            };
            match stream.next_raw() {
                None => {
                    drop(state);
                    self.register_upstream_wakeup(id, stream);
                    state = self.state.lock();
                }
                Some(Item::Value(values)) => {
                    state.pending.push_back(id);
                    return Some(PipeSetEvent::Values(values));
                }
                Some(Item::Terminal(terminal)) => {
                    state.upstreams.remove(&id);
                    let outcome = match terminal {
                        Terminal::Done(values) => UpstreamOutcome::Done(values),
                        Terminal::Failed(error) => UpstreamOutcome::Failed(error),
                    };
                    return Some(PipeSetEvent::UpstreamFinished { stream: id, outcome });
                }
            }
        }
    }

    /// 在 `stream` 上挂一个一次性消息回调，触发时把 `id` 重新排回 pending 队列
    /// 并唤醒正在等待的读者。注意：调用这个函数之前调用方必须已经释放自己的
    /// `state` 锁——`add_message_callback` 可能同步触发回调，而回调里会重新
    /// 获取同一把锁，持锁重入会死锁。
    fn register_upstream_wakeup(&self, id: StreamId, stream: StreamHandle<V>) {
        let weak = self.self_weak.clone();
        let handle = stream.add_message_callback(Box::new(move || {
            if let Some(this) = weak.upgrade() {
                this.requeue_and_wake(id);
            }
        }));
        if handle != CallbackHandle::already_fired() {
            let mut state = self.state.lock();
            state.upstream_wake_handles.insert(id, (stream, handle));
        }
    }

    fn requeue_and_wake(&self, id: StreamId) {
        let waking = {
            let mut state = self.state.lock();
            if !state.upstreams.contains_key(&id) {
                return;
            }
            state.upstream_wake_handles.remove(&id);
            state.pending.push_back(id);
            state.waiting.take()
        };
        if let Some(callback) = waking {
            callback();
        }
    }
}

/// [`PipeSet::recv`] 返回的 future。
pub(crate) struct Recv<V> {
    set: Arc<PipeSet<V>>,
}

impl<V: Clone + Send + Sync + 'static> Future for Recv<V> {
    type Output = PipeSetEvent<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let waker = cx.waker().clone();
        match self.set.try_recv(Box::new(move || waker.wake())) {
            Some(event) => Poll::Ready(event),
            None => Poll::Pending,
        }
    }
}
