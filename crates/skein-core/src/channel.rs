//! Channel：FIFO 支撑的具体 Stream，是任务之间的"线"。
//!
//! spec §4.3 给出的是一个五步 push 算法；这里原样照搬成 `push_item`：尾部已经
//! 是终止项时静默丢弃、否则追加，追加的是终止项就闩锁并发两种回调、追加之后
//! 队列从空变非空就只发消息回调、其余情况什么都不做。`next_raw` 弹出队头，如果
//! 弹出的恰好是终止项就原样放回去（粘性终止）。
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::callback::CallbackHandle;
use crate::error::SkeinError;
use crate::ids::StreamId;
use crate::item::{Item, Terminal};
use crate::stream::{fire_all, Callback, Signals, SkeinStream};

struct State<V> {
    queue: VecDeque<Item<V>>,
    signals: Signals<V>,
}

/// 无界的、队列支撑的 Stream，是任务间传值的具体介质。
pub struct Channel<V> {
    id: StreamId,
    state: Mutex<State<V>>,
}

impl<V: Clone + Send + 'static> Channel<V> {
    pub fn new() -> Self {
        Self {
            id: StreamId::fresh(),
            state: Mutex::new(State { queue: VecDeque::new(), signals: Signals::new() }),
        }
    }

    /// push 一个非终止值组；已经终止的 Channel 静默忽略。
    pub fn send(&self, values: Vec<V>) {
        self.push_item(Item::Value(values));
    }

    /// push 一个成功的终止值组。
    pub fn finish(&self, values: Vec<V>) {
        self.push_item(Item::Terminal(Terminal::Done(values)));
    }

    /// push 一个失败的终止结果。
    pub fn throw(&self, error: SkeinError) {
        self.push_item(Item::Terminal(Terminal::Failed(error)));
    }

    fn push_item(&self, item: Item<V>) {
        let (message_callbacks, finish_callbacks) = {
            let mut state = self.state.lock();
            if matches!(state.queue.back(), Some(tail) if tail.is_terminal()) {
                // 队尾已经是终止项：新的 push 静默丢弃（幂等关闭）。
                tracing::trace!(channel = %self.id, "push dropped, channel already terminal");
                return;
            }
            let is_terminal = item.is_terminal();
            let was_empty = state.queue.is_empty();
            state.queue.push_back(item);

            if is_terminal {
                let terminal = match state.queue.back().expect("just pushed") {
                    Item::Terminal(terminal) => terminal.clone(),
                    Item::Value(_) => unreachable!("is_terminal checked above"),
                };
                state.signals.latch(terminal);
                tracing::trace!(channel = %self.id, "channel latched terminal item");
                (state.signals.drain_message(), state.signals.drain_finish())
            } else if was_empty {
                (state.signals.drain_message(), Vec::new())
            } else {
                (Vec::new(), Vec::new())
            }
        };
        fire_all(message_callbacks);
        fire_all(finish_callbacks);
    }
}

impl<V: Clone + Send + 'static> Default for Channel<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> SkeinStream<V> for Channel<V> {
    fn id(&self) -> StreamId {
        self.id
    }

    fn next_raw(&self) -> Option<Item<V>> {
        let mut state = self.state.lock();
        let item = state.queue.pop_front()?;
        if item.is_terminal() {
            state.queue.push_front(item.clone());
        }
        Some(item)
    }

    fn has_result(&self) -> bool {
        self.state.lock().signals.has_result()
    }

    fn result_raw(&self) -> Result<Terminal<V>, SkeinError> {
        self.state
            .lock()
            .signals
            .terminal()
            .cloned()
            .ok_or_else(SkeinError::not_finished)
    }

    fn add_message_callback(&self, callback: Callback) -> CallbackHandle {
        let mut state = self.state.lock();
        if !state.queue.is_empty() {
            drop(state);
            callback();
            return CallbackHandle::already_fired();
        }
        state.signals.register_message(callback)
    }

    fn add_finish_callback(&self, callback: Callback) -> CallbackHandle {
        let mut state = self.state.lock();
        if state.signals.has_result() {
            drop(state);
            callback();
            return CallbackHandle::already_fired();
        }
        state.signals.register_finish(callback)
    }

    fn discard_message_callback(&self, handle: CallbackHandle) {
        self.state.lock().signals.discard_message(handle);
    }

    fn discard_finish_callback(&self, handle: CallbackHandle) {
        self.state.lock().signals.discard_finish(handle);
    }

    fn send(&self, values: Vec<V>) {
        Channel::send(self, values);
    }

    fn throw(&self, error: SkeinError) {
        Channel::throw(self, error);
    }
}
