//! 抽象 Stream 契约：核心里几乎一切东西都是一个 Stream。
//!
//! # Why
//! spec §4.2 把 Stream 定义成"生产一串值、以至多一个终止 Item 收尾、外加回调
//! 注册"的抽象契约。这个 trait 是整个 crate 唯一的多态边界：`Channel`、
//! `Stack`、`Task`、`PipePair`、`Any` 都实现它；组合子只依赖这个 trait，从不
//! 关心具体类型。
//!
//! # How
//! Rust 没有 trait object 上的运算符重载（`Arc<dyn Trait>` 不是
//! `#[fundamental]`，孤儿规则禁止给它 `impl BitOr`），所以 [`StreamHandle`]
//! 包一层 newtype 专门用来承载 `|` 运算符，对应 spec §4.2 "`|` 运算符=构造
//! PipePair"。[`Signals`] 是每个具体类型内嵌在自己的 `Mutex` 状态里的回调记账
//! 小工具——不是一个独立加锁的通用"activity-id"令牌：spec 描述的"是否有待取
//! 数据"判断因类型而异（Channel 看队列是否非空，Stack 看栈顶是否终结……），
//! 所以把这个判断留给各个具体类型在持有自己那把锁时去做，`Signals` 只管回调
//! 槽位和终止结果的记账。
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::callback::{CallbackHandle, CallbackSlab};
use crate::error::{SkeinError, SkeinErrorKind};
use crate::ids::StreamId;
use crate::item::{Item, Terminal};

/// 一个装箱的、可以跨线程移动的零参回调。
pub type Callback = Box<dyn FnOnce() + Send>;

/// 核心里每一种"可以产生值序列 + 至多一个终止结果"的东西的抽象契约。
pub trait SkeinStream<V>: Send + Sync {
    /// 进程内唯一身份，供 Pipe-set 一类的 fan-in 结构去重。
    fn id(&self) -> StreamId;

    /// 非阻塞读。没有待取数据时返回 `None`；返回 `Some` 且是终止项时，该终止
    /// 结果已经被闩锁，后续调用必须原样重复返回它。
    fn next_raw(&self) -> Option<Item<V>>;

    /// 是否已经闩锁了终止结果。
    fn has_result(&self) -> bool;

    /// 读取终止结果；尚未终止时返回 `NotFinished`。
    fn result_raw(&self) -> Result<Terminal<V>, SkeinError>;

    /// 注册一个"下一次 activity 信号"回调。若调用时已经有待取数据，回调会被
    /// 同步触发（在调用者的线程上，`add_message_callback` 返回前），并返回一个
    /// discard 为 no-op 的哨兵句柄。
    fn add_message_callback(&self, callback: Callback) -> CallbackHandle;

    /// 同 `add_message_callback`，但只在终止信号上触发一次。
    fn add_finish_callback(&self, callback: Callback) -> CallbackHandle;

    fn discard_message_callback(&self, handle: CallbackHandle);

    fn discard_finish_callback(&self, handle: CallbackHandle);

    /// 把 `other` 接入这个 Stream 的输入侧。默认失败；只有 Task 和 PipePair
    /// 这类"可被接入输入"的类型覆写它。
    fn pipe(&self, other: StreamHandle<V>) -> Result<(), SkeinError> {
        let _ = other;
        Err(SkeinError::new(SkeinErrorKind::User)
            .with_message("this stream does not accept pipe() input"))
    }

    /// 默认 no-op；由 Channel、Task 覆写。
    fn send(&self, values: Vec<V>) {
        let _ = values;
    }

    /// 默认 no-op；由 Channel、Task 覆写。
    fn throw(&self, error: SkeinError) {
        let _ = error;
    }
}

/// 给 trait object 套的 newtype，专门用来承载 `|` 运算符（孤儿规则不允许直接
/// 给 `Arc<dyn SkeinStream<V>>` 实现 `BitOr`）。其余时候把它当成一个可以
/// `Clone`、可以 `Deref` 成 `dyn SkeinStream<V>` 的句柄来用即可。
pub struct StreamHandle<V>(pub Arc<dyn SkeinStream<V> + Send + Sync>);

impl<V> Clone for StreamHandle<V> {
    fn clone(&self) -> Self {
        StreamHandle(self.0.clone())
    }
}

impl<V> std::ops::Deref for StreamHandle<V> {
    type Target = dyn SkeinStream<V>;
    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl<V> StreamHandle<V> {
    pub fn new(stream: Arc<dyn SkeinStream<V> + Send + Sync>) -> Self {
        StreamHandle(stream)
    }

    pub fn id(&self) -> StreamId {
        self.0.id()
    }
}

impl<V: Send + Sync + 'static> std::ops::BitOr for StreamHandle<V> {
    type Output = StreamHandle<V>;

    fn bitor(self, rhs: StreamHandle<V>) -> StreamHandle<V> {
        crate::combinators::pipe_pair(self, rhs)
    }
}

/// 每个具体 Stream 类型内嵌在自己状态里的回调记账小工具。不自带锁——调用方
/// 在持有自己那把 `Mutex` 守卫期间直接操作它的字段方法，离开临界区之后再用
/// `fire_all` 在锁外触发取出来的回调快照。
pub(crate) struct Signals<V> {
    terminal: Option<Terminal<V>>,
    message_callbacks: CallbackSlab<Callback>,
    finish_callbacks: CallbackSlab<Callback>,
}

impl<V> Signals<V> {
    pub(crate) fn new() -> Self {
        Self {
            terminal: None,
            message_callbacks: CallbackSlab::new(),
            finish_callbacks: CallbackSlab::new(),
        }
    }

    pub(crate) fn has_result(&self) -> bool {
        self.terminal.is_some()
    }

    pub(crate) fn terminal(&self) -> Option<&Terminal<V>> {
        self.terminal.as_ref()
    }

    /// 闩锁终止结果；如果已经闩锁过，静默忽略（幂等收尾）并返回 `false`。
    pub(crate) fn latch(&mut self, terminal: Terminal<V>) -> bool
    where
        V: Clone,
    {
        if self.terminal.is_some() {
            return false;
        }
        self.terminal = Some(terminal);
        true
    }

    pub(crate) fn register_message(&mut self, callback: Callback) -> CallbackHandle {
        self.message_callbacks.insert(callback)
    }

    pub(crate) fn register_finish(&mut self, callback: Callback) -> CallbackHandle {
        self.finish_callbacks.insert(callback)
    }

    pub(crate) fn discard_message(&mut self, handle: CallbackHandle) {
        self.message_callbacks.remove(handle);
    }

    pub(crate) fn discard_finish(&mut self, handle: CallbackHandle) {
        self.finish_callbacks.remove(handle);
    }

    pub(crate) fn drain_message(&mut self) -> Vec<Callback> {
        self.message_callbacks.drain()
    }

    pub(crate) fn drain_finish(&mut self) -> Vec<Callback> {
        self.finish_callbacks.drain()
    }
}

/// 在锁外逐一触发一批回调；触发顺序即 vec 顺序（先注册先触发）。
pub(crate) fn fire_all(callbacks: Vec<Callback>) {
    for callback in callbacks {
        callback();
    }
}

/// 把某个 Stream 的"下一个 Item"适配成一个 `Future`，供 `async fn` 写的任务
/// 协程体里直接 `.await`。对应 spec §9 design note 的选择 (a)：
/// "a state machine produced by the language's async machinery… each `yield
/// stream` becomes an await point"。
pub struct NextItem<V> {
    stream: StreamHandle<V>,
    pending_handle: Option<CallbackHandle>,
}

impl<V> NextItem<V> {
    pub fn new(stream: StreamHandle<V>) -> Self {
        Self { stream, pending_handle: None }
    }
}

impl<V: Send + 'static> Future for NextItem<V> {
    type Output = Item<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Item<V>> {
        let this = self.get_mut();
        if let Some(handle) = this.pending_handle.take() {
            this.stream.discard_message_callback(handle);
        }
        if let Some(item) = this.stream.next_raw() {
            return Poll::Ready(item);
        }
        let waker = cx.waker().clone();
        let handle = this.stream.add_message_callback(Box::new(move || waker.wake()));
        this.pending_handle = Some(handle);
        Poll::Pending
    }
}

impl<V> Drop for NextItem<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.pending_handle.take() {
            self.stream.discard_message_callback(handle);
        }
    }
}
