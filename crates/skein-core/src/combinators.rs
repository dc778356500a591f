//! 组合子：`pipe`/`any`/`run`，把若干 Stream 拼成一个更大的 Stream，或把一个
//! 顶层 Stream 驱动到完成。
//!
//! # Why
//! spec §4.7 把这三者都描述成"接一组 Stream、产出一个新 Stream（或驱动到
//! 终止）"的纯组合操作,不持有除了它们各自需要跟踪的胜负/交接状态之外的任何
//! 额外状态。这个模块是唯一依赖 `Task`/`Channel`/`Runtime` 具体类型、同时也
//! 被 `stream.rs` 的 `BitOr` 反向依赖的地方——`pipe_pair` 的名字和签名是
//! `stream.rs` 里硬编码引用的,不能改。
//!
//! # How
//! `PipePair` 和 `Any` 都不维护自己独立的终止真相：`PipePair` 的
//! `has_result`/`next_raw` 直接查询 `L`/`R` 两端现状；`Any` 用内嵌的
//! [`crate::stream::Signals`] 闩锁"第一个产出项",和 `Channel`/`Stack` 是同一
//! 个记账小工具。两者都用 `Arc::new_cyclic` 拿到自引用,在被监视的上游触发时
//! 把"重新检查"转发回自己。
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::callback::{CallbackHandle, CallbackSlab};
use crate::error::{SkeinError, SkeinErrorKind};
use crate::ids::StreamId;
use crate::item::{Item, Terminal};
use crate::runtime::Runtime;
use crate::stream::{fire_all, Callback, Signals, SkeinStream, StreamHandle};

// ---------------------------------------------------------------------
// PipePair
// ---------------------------------------------------------------------

struct PairState<V> {
    l_finished: bool,
    r_finished: bool,
    broken_signalled: bool,
    finish_callbacks: CallbackSlab<Callback>,
    message_registrations: CallbackSlab<(StreamHandle<V>, CallbackHandle)>,
}

/// 耦合两个 Stream `L`、`R`：`L` 的输出接入 `R` 的输入,对外暴露 `R` 的输出,
/// 但把 `R` 的终止项扣住直到 `L` 也终止(spec §4.7 "drain guarantee"),并在
/// `R` 先终止时把 BrokenPipe 注入 `L`。
///
/// 关于 spec §4.7 原文"pipes R into L"与 §2/S2 场景("A 的输出喂给 B")之间的
/// 表述冲突,这里采用后者——行为保证和具体场景比构造步骤的单句话描述更
/// 可信,相应决策记在 DESIGN.md。
pub struct PipePair<V> {
    id: StreamId,
    input: Arc<crate::channel::Channel<V>>,
    l: StreamHandle<V>,
    r: StreamHandle<V>,
    state: Mutex<PairState<V>>,
    self_weak: Weak<PipePair<V>>,
}

impl<V: Clone + Send + Sync + 'static> PipePair<V> {
    fn maybe_drain_finish_locked(state: &mut PairState<V>) -> Vec<Callback> {
        if state.l_finished && state.r_finished {
            state.finish_callbacks.drain()
        } else {
            Vec::new()
        }
    }

    fn on_l_finished(&self) {
        let to_fire = {
            let mut state = self.state.lock();
            state.l_finished = true;
            Self::maybe_drain_finish_locked(&mut state)
        };
        fire_all(to_fire);
    }

    fn on_r_finished(&self) {
        let (to_fire, should_break) = {
            let mut state = self.state.lock();
            state.r_finished = true;
            let should_break = !state.l_finished && !state.broken_signalled;
            if should_break {
                state.broken_signalled = true;
            }
            (Self::maybe_drain_finish_locked(&mut state), should_break)
        };
        fire_all(to_fire);
        if should_break {
            tracing::debug!(pair = %self.id, "R finished first, breaking L");
            self.l.throw(SkeinError::broken_pipe());
        }
    }

    fn register_relay(&self, target: StreamHandle<V>, callback: Callback) -> CallbackHandle {
        let real_handle = target.add_message_callback(callback);
        if real_handle == CallbackHandle::already_fired() {
            return CallbackHandle::already_fired();
        }
        self.state.lock().message_registrations.insert((target, real_handle))
    }
}

impl<V: Clone + Send + Sync + 'static> SkeinStream<V> for PipePair<V> {
    fn id(&self) -> StreamId {
        self.id
    }

    /// 透传 `R` 的每一项;`R` 的终止项在 `L` 尚未终止期间被扣住(返回
    /// `None`),一旦 `L` 终止就照常放行。
    fn next_raw(&self) -> Option<Item<V>> {
        match self.r.next_raw() {
            None => None,
            Some(Item::Value(values)) => Some(Item::Value(values)),
            Some(Item::Terminal(terminal)) => {
                if self.l.has_result() {
                    Some(Item::Terminal(terminal))
                } else {
                    None
                }
            }
        }
    }

    fn has_result(&self) -> bool {
        self.l.has_result() && self.r.has_result()
    }

    fn result_raw(&self) -> Result<Terminal<V>, SkeinError> {
        if self.has_result() {
            self.r.result_raw()
        } else {
            Err(SkeinError::not_finished())
        }
    }

    /// 两种转发目标之一:`R` 还没终止(或终止已经因为 `L` 完成而解锁)时直接
    /// 转发给 `R` 本身;`R` 已经终止但被扣住时,转发给 `L` 的 finish 信号——
    /// `L` 终止正是解锁的那条边。消费者在 `None` 之后重新注册时会重新评估
    /// 这个分支,所以转发目标的选择不需要是完美预判,只需要在下一次重新注册
    /// 时自我纠正。
    fn add_message_callback(&self, callback: Callback) -> CallbackHandle {
        if self.r.has_result() && !self.l.has_result() {
            self.register_relay(self.l.clone(), callback)
        } else {
            self.register_relay(self.r.clone(), callback)
        }
    }

    fn add_finish_callback(&self, callback: Callback) -> CallbackHandle {
        let mut state = self.state.lock();
        if state.l_finished && state.r_finished {
            drop(state);
            callback();
            return CallbackHandle::already_fired();
        }
        state.finish_callbacks.insert(callback)
    }

    fn discard_message_callback(&self, handle: CallbackHandle) {
        if let Some((target, real_handle)) = self.state.lock().message_registrations.remove(handle) {
            target.discard_message_callback(real_handle);
        }
    }

    fn discard_finish_callback(&self, handle: CallbackHandle) {
        self.state.lock().finish_callbacks.remove(handle);
    }

    /// 进一步的 `pipe()` 调用转给 `L`——多级 `PipePair` 嵌套时(`pipe(a,b,c,d)`
    /// 构造的平衡二叉树),外层 pair 的"可被接入输入"的那一端就是它自己的
    /// `L` 子树。
    fn pipe(&self, other: StreamHandle<V>) -> Result<(), SkeinError> {
        self.l.pipe(other)
    }

    fn send(&self, values: Vec<V>) {
        self.input.send(values);
    }

    fn throw(&self, error: SkeinError) {
        self.input.throw(error);
    }
}

/// 构造一个 `PipePair`:新建一个输入 channel 并接入 `l`,把 `l` 接入 `r` 的
/// 输入,对外暴露 `r` 的输出。被 [`crate::stream::StreamHandle`] 的 `BitOr`
/// 实现直接引用,名字和签名不能改。
pub fn pipe_pair<V: Clone + Send + Sync + 'static>(
    l: StreamHandle<V>,
    r: StreamHandle<V>,
) -> StreamHandle<V> {
    let input = Arc::new(crate::channel::Channel::new());
    let _ = l.pipe(StreamHandle::new(input.clone()));
    let _ = r.pipe(l.clone());

    let pair = Arc::new_cyclic(|weak| PipePair {
        id: StreamId::fresh(),
        input,
        l: l.clone(),
        r: r.clone(),
        state: Mutex::new(PairState {
            l_finished: false,
            r_finished: false,
            broken_signalled: false,
            finish_callbacks: CallbackSlab::new(),
            message_registrations: CallbackSlab::new(),
        }),
        self_weak: weak.clone(),
    });

    {
        let weak = pair.self_weak.clone();
        l.add_finish_callback(Box::new(move || {
            if let Some(pair) = weak.upgrade() {
                pair.on_l_finished();
            }
        }));
    }
    {
        let weak = pair.self_weak.clone();
        r.add_finish_callback(Box::new(move || {
            if let Some(pair) = weak.upgrade() {
                pair.on_r_finished();
            }
        }));
    }

    StreamHandle::new(pair)
}

/// 变参 `pipe(a, b, c, d, ...)`:在中点切分、递归构造平衡二叉树,界定递归
/// 深度(spec §4.7 "balanced binary tree (split at midpoint) to bound
/// recursion depth")。
pub fn pipe<V: Clone + Send + Sync + 'static>(mut streams: Vec<StreamHandle<V>>) -> StreamHandle<V> {
    assert!(!streams.is_empty(), "pipe() requires at least one stream");
    if streams.len() == 1 {
        return streams.pop().expect("length checked above");
    }
    let mid = streams.len() / 2;
    let right = streams.split_off(mid);
    pipe_pair(pipe(streams), pipe(right))
}

// ---------------------------------------------------------------------
// Any
// ---------------------------------------------------------------------

/// `any_with_source` 的获胜值:携带胜出的上游身份,便于消费者区分是谁先产出
/// 的(spec §4.7 "`include_source`: the value is prefixed with a tag
/// identifying which stream won")。
#[derive(Debug, Clone)]
pub struct Tagged<V> {
    pub source: StreamId,
    pub values: Vec<V>,
}

struct AnyState<V, Out> {
    watchers: HashMap<StreamId, (StreamHandle<V>, CallbackHandle)>,
    signals: Signals<Out>,
}

/// 在一组 Stream 上竞速:第一个产出任意 Item(值或终止)的赢,它的 Item 被
/// 映射为 Any 自己的终止结果,其余所有 Stream 上挂着的监视回调被丢弃。
pub struct Any<V, Out> {
    id: StreamId,
    state: Mutex<AnyState<V, Out>>,
    self_weak: Weak<Any<V, Out>>,
    map: fn(StreamId, Item<V>) -> Terminal<Out>,
}

impl<V, Out> Any<V, Out>
where
    V: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn watch(self: &Arc<Self>, stream: StreamHandle<V>) {
        {
            if self.state.lock().signals.has_result() {
                return;
            }
        }
        let id = stream.id();
        let weak = self.self_weak.clone();
        let relay_stream = stream.clone();
        let handle = stream.add_message_callback(Box::new(move || {
            if let Some(this) = weak.upgrade() {
                this.on_activity(id, relay_stream);
            }
        }));
        if handle == CallbackHandle::already_fired() {
            return;
        }
        let mut state = self.state.lock();
        if state.signals.has_result() {
            drop(state);
            stream.discard_message_callback(handle);
            return;
        }
        state.watchers.insert(id, (stream, handle));
    }

    fn on_activity(&self, id: StreamId, stream: StreamHandle<V>) {
        let item = stream
            .next_raw()
            .expect("add_message_callback only fires when a read would succeed");
        let terminal = (self.map)(id, item);
        let (message_callbacks, finish_callbacks, losers) = {
            let mut state = self.state.lock();
            if !state.signals.latch(terminal) {
                return;
            }
            let losers: Vec<_> = state.watchers.drain().collect();
            tracing::debug!(any = %self.id, winner = %id, losers = losers.len(), "any resolved");
            (state.signals.drain_message(), state.signals.drain_finish(), losers)
        };
        for (loser_id, (loser_stream, handle)) in losers {
            if loser_id != id {
                loser_stream.discard_message_callback(handle);
            }
        }
        fire_all(message_callbacks);
        fire_all(finish_callbacks);
    }
}

impl<V, Out> SkeinStream<Out> for Any<V, Out>
where
    V: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    fn id(&self) -> StreamId {
        self.id
    }

    fn next_raw(&self) -> Option<Item<Out>> {
        self.state.lock().signals.terminal().cloned().map(Item::Terminal)
    }

    fn has_result(&self) -> bool {
        self.state.lock().signals.has_result()
    }

    fn result_raw(&self) -> Result<Terminal<Out>, SkeinError> {
        self.state.lock().signals.terminal().cloned().ok_or_else(SkeinError::not_finished)
    }

    fn add_message_callback(&self, callback: Callback) -> CallbackHandle {
        let mut state = self.state.lock();
        if state.signals.has_result() {
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
}

fn build_any<V, Out>(
    streams: Vec<StreamHandle<V>>,
    map: fn(StreamId, Item<V>) -> Terminal<Out>,
) -> StreamHandle<Out>
where
    V: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    let any = Arc::new_cyclic(|weak| Any {
        id: StreamId::fresh(),
        state: Mutex::new(AnyState { watchers: HashMap::new(), signals: Signals::new() }),
        self_weak: weak.clone(),
        map,
    });
    for stream in streams {
        any.watch(stream);
    }
    StreamHandle::new(any)
}

/// 第一个产出项的原始值原样作为 Any 的终止结果,不带来源标记。
pub fn any<V: Clone + Send + Sync + 'static>(streams: Vec<StreamHandle<V>>) -> StreamHandle<V> {
    build_any(streams, |_source, item| match item {
        Item::Value(values) => Terminal::Done(values),
        Item::Terminal(terminal) => terminal,
    })
}

/// 同 [`any`],但把胜出的值包进 [`Tagged`],标记是哪个上游产出的。
pub fn any_with_source<V: Clone + Send + Sync + 'static>(
    streams: Vec<StreamHandle<V>>,
) -> StreamHandle<Tagged<V>> {
    build_any(streams, |source, item| match item {
        Item::Value(values) => Terminal::Done(vec![Tagged { source, values }]),
        Item::Terminal(Terminal::Done(values)) => Terminal::Done(vec![Tagged { source, values }]),
        Item::Terminal(Terminal::Failed(error)) => Terminal::Failed(error),
    })
}

// ---------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------

/// 协作式取消令牌:触发一次,在下一轮派发循环里被 [`run_with_cancellation`]
/// 看到并转换为对 `main` 的一次 `throw`。不绑定任何具体的 OS 信号来源——
/// 调用方自己决定在哪里触发它(例如一个信号处理线程,或一个超时定时器)。
#[derive(Clone)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)) }
    }

    /// 请求取消;幂等,多次调用等价于一次。
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    fn take_triggered(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// 顶层驱动循环(spec §4.7 `Run`):交替排空调用队列、等待新工作,直到
/// `main` 终止;返回其成功值或原样重新抛出其失败。
pub fn run<V: Clone + Send + Sync + 'static>(
    runtime: &Runtime,
    main: &StreamHandle<V>,
) -> Result<Vec<V>, SkeinError> {
    run_with_cancellation(runtime, main, None)
}

/// 同 [`run`],但额外接受一个可选的 [`Cancellation`] 令牌:每一轮排空之后,
/// 如果令牌被触发过,就把一个 `User` 失败注入 `main` 的输入侧,让它的协程在
/// 下一次挂起点观察到并主动收尾。
pub fn run_with_cancellation<V: Clone + Send + Sync + 'static>(
    runtime: &Runtime,
    main: &StreamHandle<V>,
    cancellation: Option<&Cancellation>,
) -> Result<Vec<V>, SkeinError> {
    let call_queue = runtime.call_queue();
    let poll_interval = runtime.poll_interval();
    loop {
        call_queue.drain_once()?;
        if main.has_result() {
            let terminal = main.result_raw().expect("has_result() just confirmed a latched terminal");
            return terminal.into_result();
        }
        if let Some(cancellation) = cancellation {
            if cancellation.take_triggered() {
                tracing::info!("run cancelled, injecting failure into main");
                main.throw(
                    SkeinError::new(SkeinErrorKind::User).with_message("run cancelled"),
                );
                continue;
            }
        }
        call_queue.wait_for_work(poll_interval);
    }
}
