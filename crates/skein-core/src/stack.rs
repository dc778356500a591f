//! Stack：顺序交接的聚合器，是一个任务对外暴露的输出流。
//!
//! # Why
//! spec §4.5 把 Stack 描述成"只读栈顶，栈顶终止就弹出换下一个"的顺序交接
//! 结构——这正是 `inner.sub(other)` 想要的效果：当任务临时把输出让给一个子
//! 任务 `other`，外部读者应该先看到 `other` 的全部输出，`other` 结束后再无缝
//! 切回任务自己的输出，一个 Item 不漏、一个 Item 不重。和 Pipe-set 不同，
//! Stack 是这个 crate 里**唯一真正会终止的内部聚合器**——它的终止结果不是从
//! 栈里任何一段的终止 Item 读出来的，而是任务在协程真正跑完时通过
//! [`Stack::finish`] 显式注入的"哨兵"结果；栈里每一段自身的终止（无论成功
//! 失败）都只表示"这一段完了，看下一段"，并不会被转发给 Stack 的读者。
//!
//! # How
//! 消息回调完全**转发**给当前栈顶：`add_message_callback` 直接把消费者的回调
//! 原样注册到栈顶段上。栈顶段的任何活动信号（新值，或它自身终止）都会触发这
//! 个转发回调，消费者借此知道"该重新调用 `next_raw` 了"；不需要在 Stack 这一
//! 层维护一个独立的 watcher。这比照搬 Pipe-set 的自引用 wakeup 机制简单，因为
//! Stack 任一时刻只有一个活跃段，没有 fan-in 去重的需要。终止回调则完全独立：
//! 只在 Stack 自己的哨兵终止结果被揭示时触发一次。
//!
//! 前提（在 `Task` 的构造路径里保证）：Stack 在被任何外部消费者看到之前，已经
//! 至少 push 过一段（任务的初始输出 channel）——否则在"空栈 + 尚无终止"期间
//! 注册的消息回调会找不到可转发的目标；这个初始不变量由 `task.rs` 负责维护。
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::callback::{CallbackHandle, CallbackSlab};
use crate::error::SkeinError;
use crate::ids::StreamId;
use crate::item::{Item, Terminal};
use crate::stream::{fire_all, Callback, SkeinStream, StreamHandle};

struct State<V> {
    deque: VecDeque<StreamHandle<V>>,
    terminal: Option<Terminal<V>>,
    finish_callbacks: CallbackSlab<Callback>,
    /// `Some((front, real_handle))` 记录一次转发注册，好让 `discard_message_callback`
    /// 知道该去哪个底层 Stream 撤销；`None` 代表注册时栈是空的、注定不会被触发
    /// 的占位（见模块文档"前提"一节）。
    message_registrations: CallbackSlab<Option<(StreamHandle<V>, CallbackHandle)>>,
}

/// 顺序交接聚合器：任一时刻只暴露栈顶那一段的数据，栈顶终止就换下一段。
pub(crate) struct Stack<V> {
    id: StreamId,
    state: Mutex<State<V>>,
}

impl<V: Clone + Send + Sync + 'static> Stack<V> {
    pub(crate) fn new() -> Self {
        Self {
            id: StreamId::fresh(),
            state: Mutex::new(State {
                deque: VecDeque::new(),
                terminal: None,
                finish_callbacks: CallbackSlab::new(),
                message_registrations: CallbackSlab::new(),
            }),
        }
    }

    /// 把 `other` 追加为新的栈顶候选（排在所有已有段之后）。
    pub(crate) fn push(&self, other: StreamHandle<V>) {
        self.state.lock().deque.push_back(other);
    }

    /// 注入 Stack 自己的终止哨兵；幂等——第二次调用静默忽略。
    pub(crate) fn finish(&self, terminal: Terminal<V>) {
        let finish_callbacks = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(terminal);
            drain_finished_fronts(&mut state.deque);
            if state.deque.is_empty() {
                state.finish_callbacks.drain()
            } else {
                Vec::new()
            }
        };
        fire_all(finish_callbacks);
    }
}

/// 弹出所有已经终止的栈顶段；不消费它们的终止 Item（`has_result` 是非消费性
/// 查询），只是把已经走完的段从栈里摘掉。
fn drain_finished_fronts<V>(deque: &mut VecDeque<StreamHandle<V>>) {
    while matches!(deque.front(), Some(front) if front.has_result()) {
        deque.pop_front();
    }
}

/// 如果栈已经空了并且自己的终止哨兵已经注入，取走所有挂着的 finish 回调
/// 交给调用方在锁外触发；否则返回空集。
///
/// `finish()` 本身只在调用那一刻栈恰好已经排空时才会触发这些回调——如果
/// 栈在那一刻还压着一段未完成的子流（比如 `sub(other)` 的 `other` 还没读
/// 完），`finish()` 的哨兵仍然被闩锁，但回调会一直挂着。每个读路径
/// （`next_raw`/`has_result`/`result_raw`/`add_message_callback`）在把栈顶
/// 清空到底之后都必须重新检查一次这个条件，否则终止信号就被永久漏掉了——
/// 调用方（比如 `PipePair` 的 `add_finish_callback`）会一直等不到通知。
fn take_ready_finish_callbacks<V>(state: &mut State<V>) -> Vec<Callback> {
    if state.deque.is_empty() && state.terminal.is_some() {
        state.finish_callbacks.drain()
    } else {
        Vec::new()
    }
}

impl<V: Clone + Send + Sync + 'static> SkeinStream<V> for Stack<V> {
    fn id(&self) -> StreamId {
        self.id
    }

    fn next_raw(&self) -> Option<Item<V>> {
        let mut state = self.state.lock();
        loop {
            match state.deque.front().cloned() {
                Some(front) => {
                    if front.has_result() {
                        state.deque.pop_front();
                        continue;
                    }
                    drop(state);
                    return front.next_raw();
                }
                None => {
                    let finish_callbacks = take_ready_finish_callbacks(&mut state);
                    let terminal = state.terminal.clone();
                    drop(state);
                    fire_all(finish_callbacks);
                    return terminal.map(Item::Terminal);
                }
            }
        }
    }

    fn has_result(&self) -> bool {
        let mut state = self.state.lock();
        drain_finished_fronts(&mut state.deque);
        let finish_callbacks = take_ready_finish_callbacks(&mut state);
        let ready = state.deque.is_empty() && state.terminal.is_some();
        drop(state);
        fire_all(finish_callbacks);
        ready
    }

    fn result_raw(&self) -> Result<Terminal<V>, SkeinError> {
        let mut state = self.state.lock();
        drain_finished_fronts(&mut state.deque);
        let finish_callbacks = take_ready_finish_callbacks(&mut state);
        let result = if state.deque.is_empty() {
            state.terminal.clone().ok_or_else(SkeinError::not_finished)
        } else {
            Err(SkeinError::not_finished())
        };
        drop(state);
        fire_all(finish_callbacks);
        result
    }

    fn add_message_callback(&self, callback: Callback) -> CallbackHandle {
        let mut state = self.state.lock();
        loop {
            match state.deque.front().cloned() {
                Some(front) => {
                    if front.has_result() {
                        state.deque.pop_front();
                        continue;
                    }
                    drop(state);
                    let real_handle = front.add_message_callback(callback);
                    if real_handle == CallbackHandle::already_fired() {
                        return CallbackHandle::already_fired();
                    }
                    let mut state = self.state.lock();
                    return state.message_registrations.insert(Some((front, real_handle)));
                }
                None => {
                    let finish_callbacks = take_ready_finish_callbacks(&mut state);
                    if state.terminal.is_some() {
                        drop(state);
                        fire_all(finish_callbacks);
                        callback();
                        return CallbackHandle::already_fired();
                    }
                    return state.message_registrations.insert(None);
                }
            }
        }
    }

    fn add_finish_callback(&self, callback: Callback) -> CallbackHandle {
        let mut state = self.state.lock();
        drain_finished_fronts(&mut state.deque);
        if state.deque.is_empty() && state.terminal.is_some() {
            drop(state);
            callback();
            return CallbackHandle::already_fired();
        }
        state.finish_callbacks.insert(callback)
    }

    fn discard_message_callback(&self, handle: CallbackHandle) {
        let removed = self.state.lock().message_registrations.remove(handle);
        if let Some(Some((front, real_handle))) = removed {
            front.discard_message_callback(real_handle);
        }
    }

    fn discard_finish_callback(&self, handle: CallbackHandle) {
        self.state.lock().finish_callbacks.remove(handle);
    }
}
