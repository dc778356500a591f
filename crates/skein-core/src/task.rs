//! Task：由调度器推进的用户协程，runtime 里唯一会"计算"东西的地方。
//!
//! # Why
//! spec §4.6 把 Task 的协程建模成一台显式状态机（`step(source)`），由调度器
//! 每次喂给它"下一个 source 产生的 Item"来推进。Rust 有更贴近这个描述的原生
//! 机制——`async fn`/`Future`：协程体里的每一个 `.await` 就是 spec 里的一次
//! `yield stream`，`Future::poll` 就是 `step`。这正是 §9 design note 里挑明的
//! 选择 (a)。这个模块把"挑选一个 Future 实现"落到实处：`Task<V>` 拥有一个
//! 装箱的 `Future`，每次被调度队列唤醒时 poll 一次；`Inner<V>` 是协程体持有的
//! 唯一句柄，对应 spec §6 的 `inner.send`/`inner.sub`/`inner.thread`，外加一个
//! spec 摘要没点名、但 S2（pipe 场景）等测试场景必需的 `inner.recv`——协程要
//! 读自己的输入，总得有个方法来读。
//!
//! # How
//! `Inner<V>` 只持有 `Weak<Task<V>>`（§9 design note："inner holds a weak
//! back-reference... any call on a dropped back-reference is a no-op"）。
//! `Task<V>` 自身通过 `Arc::new_cyclic` 构造，拿到一份指向自己的 `Weak`，既用
//! 来喂给 `Inner`，也用来实现一个把"被唤醒"翻译成"把 poll_step 重新排进调用
//! 队列"的 `std::task::Wake`——这保证了协程的每一次推进，无论 waker 是从哪个
//! 线程调用的，最终都落在调度线程上执行（spec §5 的 dispatcher-thread 不变量）。
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::callback::CallbackHandle;
use crate::channel::Channel;
use crate::error::{SkeinError, SkeinErrorKind};
use crate::ids::{StreamId, TaskId};
use crate::item::{Item, Terminal};
use crate::pipe_set::{PipeSet, PipeSetEvent, UpstreamOutcome};
use crate::runtime::Runtime;
use crate::stack::Stack;
use crate::stream::{Callback, NextItem, SkeinStream, StreamHandle};

/// 协程体的签名：接收自己的 [`Inner`] 句柄，返回一个在完成时给出成功值或失败
/// 的 `Future`。这是 spec §6 `stream(fn)` 装饰器在 Rust 里的对应物——装饰器
/// 本身在这门语言里没有直接对应物，所以由 [`spawn_task`]/[`stream`] 承担。
pub trait TaskBody<V>: FnOnce(Inner<V>) -> Self::Fut + Send + 'static {
    type Fut: Future<Output = Result<Vec<V>, SkeinError>> + Send + 'static;
}

impl<V, F, Fut> TaskBody<V> for F
where
    F: FnOnce(Inner<V>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<V>, SkeinError>> + Send + 'static,
{
    type Fut = Fut;
}

type BoxedCoroutine<V> = BoxFuture<'static, Result<Vec<V>, SkeinError>>;

/// 一个被调度线程推进的用户协程，同时是一个 Stream（外部读者看到它输出栈里的
/// 内容）。
pub struct Task<V> {
    id: StreamId,
    task_id: TaskId,
    runtime: Runtime,
    pipe_set: Arc<PipeSet<V>>,
    input: Arc<Channel<V>>,
    output_stack: Stack<V>,
    current_output: Mutex<Arc<Channel<V>>>,
    coroutine: Mutex<Option<BoxedCoroutine<V>>>,
    started: AtomicBool,
    self_weak: Weak<Task<V>>,
}

impl<V: Clone + Send + Sync + 'static> Task<V> {
    /// spec §4.6 `start`：NEW → RUNNING，首次 `step` 通过调用队列排队执行，
    /// 不在调用者的线程上直接 poll（无论 `start` 本身是不是已经在调度线程上被
    /// 调用，都统一走一次排队，避免协程深度递归地互相启动对方）。
    fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(task_id = %self.task_id, "task starting");
        self.runtime.root(self.task_id, self.clone() as Arc<dyn Any + Send + Sync>);
        let this = self.clone();
        self.runtime.call_queue().add(move || this.poll_step());
    }

    fn waker(self: &Arc<Self>) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            task: self.self_weak.clone(),
            call_queue: self.runtime.call_queue().clone(),
        }))
    }

    /// `Future::poll` 一次协程体，对应 spec §4.6 `step` 的第 3-7 步（第 1-2
    /// 步——"读一个 Item、没有就挂回调再来"——在我们的翻译里内置在协程体对
    /// `inner.recv()`/其他 Stream 的 `.await` 里，不需要 `Task` 自己再单独
    /// 实现一次）。
    fn poll_step(self: &Arc<Self>) {
        let mut slot = self.coroutine.lock();
        let Some(mut coroutine) = slot.take() else {
            // 已经终结，或者正有另一次 poll 在进行（不会发生——唤醒总是通过
            // 调用队列序列化到同一条调度线程上），直接返回。
            return;
        };
        let waker = self.waker();
        let mut cx = Context::from_waker(&waker);
        tracing::trace!(task_id = %self.task_id, "dispatcher stepping task");
        match coroutine.as_mut().poll(&mut cx) {
            Poll::Pending => {
                *slot = Some(coroutine);
            }
            Poll::Ready(outcome) => {
                drop(slot);
                match outcome {
                    Ok(values) => {
                        tracing::debug!(task_id = %self.task_id, "task coroutine completed");
                        self.inner_finish(Terminal::Done(values))
                    }
                    Err(error) => {
                        tracing::debug!(task_id = %self.task_id, %error, "task coroutine failed");
                        self.inner_finish(Terminal::Failed(error))
                    }
                }
            }
        }
    }

    fn inner_send(&self, values: Vec<V>) {
        self.current_output.lock().send(values);
    }

    /// spec §4.6 `inner_finish`：闩锁 Task 自己的终止哨兵，终结当前输出
    /// channel（"success or failure identically"——channel 的收尾动作本身不
    /// 区分成败，真正的成败只体现在 Stack 的哨兵终止结果里），清理 pipe-set，
    /// 并把自己从运行中任务根集合摘除。
    fn inner_finish(&self, terminal: Terminal<V>) {
        self.current_output.lock().finish(Vec::new());
        self.output_stack.finish(terminal);
        self.pipe_set.close();
        self.runtime.unroot(self.task_id);
    }

    /// spec §4.6 `inner_sub`：把输出 channel 换成一个全新的，在旧 channel 的
    /// 完成之下把 `other` 接进输出栈，再在 `other` 之下接入新 channel——下游
    /// 读者因此先看到 `other` 的全部输出，`other` 完成后无缝切回任务自己的
    /// 输出。终结 `other` 时把它的结果转发进返回的结果 channel。
    fn inner_sub(self: &Arc<Self>, other: StreamHandle<V>) -> Arc<Channel<V>> {
        tracing::trace!(task_id = %self.task_id, sub = %other.id(), "task output redirected into sub");
        let fresh = Arc::new(Channel::new());
        let previous = std::mem::replace(&mut *self.current_output.lock(), fresh.clone());
        previous.finish(Vec::new());
        self.output_stack.push(other.clone());
        self.output_stack.push(StreamHandle::new(fresh));

        let result_channel = Arc::new(Channel::new());
        let relay_target = result_channel.clone();
        let relay_source = other.clone();
        let sub_id = other.id();
        let task_id = self.task_id;
        other.add_finish_callback(Box::new(move || match relay_source.result_raw() {
            Ok(Terminal::Done(values)) => {
                tracing::trace!(task_id = %task_id, sub = %sub_id, "sub finished, task output resuming");
                relay_target.finish(values)
            }
            Ok(Terminal::Failed(error)) => {
                tracing::trace!(task_id = %task_id, sub = %sub_id, %error, "sub failed, task output resuming");
                relay_target.throw(error)
            }
            Err(_) => {
                // `add_finish_callback` 只在终止信号上触发，理论上不会走到这里；
                // 防御性地把它当成一次失败处理，而不是静默吞掉。
                relay_target.throw(SkeinError::new(SkeinErrorKind::User).with_message(
                    "sub stream's finish callback fired without a latched terminal",
                ));
            }
        }));
        result_channel
    }

    fn recv_event(self: &Arc<Self>) -> RecvFuture<V> {
        RecvFuture { inner: self.pipe_set.recv() }
    }
}

impl<V: Clone + Send + Sync + 'static> SkeinStream<V> for Task<V> {
    fn id(&self) -> StreamId {
        self.id
    }

    fn next_raw(&self) -> Option<Item<V>> {
        self.output_stack.next_raw()
    }

    fn has_result(&self) -> bool {
        self.output_stack.has_result()
    }

    fn result_raw(&self) -> Result<Terminal<V>, SkeinError> {
        self.output_stack.result_raw()
    }

    fn add_message_callback(&self, callback: Callback) -> CallbackHandle {
        self.output_stack.add_message_callback(callback)
    }

    fn add_finish_callback(&self, callback: Callback) -> CallbackHandle {
        self.output_stack.add_finish_callback(callback)
    }

    fn discard_message_callback(&self, handle: CallbackHandle) {
        self.output_stack.discard_message_callback(handle);
    }

    fn discard_finish_callback(&self, handle: CallbackHandle) {
        self.output_stack.discard_finish_callback(handle);
    }

    /// Task 是 spec §4.2 所说的"pipeable"子类：把 `other` 接入自己的
    /// pipe-set，作为额外的上游（fan-in），而不是替换自己专属的输入 channel。
    fn pipe(&self, other: StreamHandle<V>) -> Result<(), SkeinError> {
        self.pipe_set.pipe_in(other);
        Ok(())
    }

    fn send(&self, values: Vec<V>) {
        self.input.send(values);
    }

    fn throw(&self, error: SkeinError) {
        self.input.throw(error);
    }
}

/// 把"被唤醒"翻译成"把 `poll_step` 重新排进调用队列"，保证协程推进始终发生
/// 在调度线程上，即使唤醒本身是从工作线程或另一个任务的回调里触发的。
struct TaskWaker<V> {
    task: Weak<Task<V>>,
    call_queue: crate::call_queue::CallQueue,
}

impl<V: Clone + Send + Sync + 'static> Wake for TaskWaker<V> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let Some(task) = self.task.upgrade() else { return };
        self.call_queue.add(move || task.poll_step());
    }
}

/// 用户代码看到的一次 `recv()` 事件：要么是一批发给这个任务的值，要么是某个
/// 上游（通过 `pipe()` 接入的额外上游，或任务自己的外部输入 channel）完成的
/// 通知，对应 spec §4.4 对 Pipe-set 终止改写的描述。
pub enum RecvEvent<V> {
    Value(Vec<V>),
    UpstreamDone { stream: StreamId, result: Result<Vec<V>, SkeinError> },
}

pub(crate) struct RecvFuture<V> {
    inner: crate::pipe_set::Recv<V>,
}

impl<V: Clone + Send + Sync + 'static> Future for RecvFuture<V> {
    type Output = RecvEvent<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(PipeSetEvent::Values(values)) => Poll::Ready(RecvEvent::Value(values)),
            Poll::Ready(PipeSetEvent::UpstreamFinished { stream, outcome }) => {
                let result = match outcome {
                    UpstreamOutcome::Done(values) => Ok(values),
                    UpstreamOutcome::Failed(error) => Err(error),
                };
                Poll::Ready(RecvEvent::UpstreamDone { stream, result })
            }
        }
    }
}

/// 反复拉取某个 Stream 的 `NextItem`，跳过非终止值（`sub`/`thread` 产出的
/// 结果 channel 按约定只会被 push 恰好一个终止 Item），直到拿到终止结果。
pub(crate) struct AwaitTerminal<V> {
    stream: StreamHandle<V>,
    pending: Option<NextItem<V>>,
}

impl<V> AwaitTerminal<V> {
    pub(crate) fn new(stream: StreamHandle<V>) -> Self {
        Self { stream, pending: None }
    }
}

impl<V: Send + 'static> Future for AwaitTerminal<V> {
    type Output = Result<Vec<V>, SkeinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if this.pending.is_none() {
                this.pending = Some(NextItem::new(this.stream.clone()));
            }
            let pending = this.pending.as_mut().expect("just populated above");
            match Pin::new(pending).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Item::Value(_)) => {
                    this.pending = None;
                    continue;
                }
                Poll::Ready(Item::Terminal(terminal)) => return Poll::Ready(terminal.into_result()),
            }
        }
    }
}

/// 协程体持有的唯一句柄：对任务的反向引用只做调度用途，不构成所有权（§9
/// design note）。任务被 drop 之后，这里的每个方法都安全地退化为 no-op。
pub struct Inner<V> {
    task: Weak<Task<V>>,
}

impl<V: Clone + Send + Sync + 'static> Inner<V> {
    /// 写一批值到任务当前的输出 channel（如果正处在 `sub` 接管期间，这是
    /// `sub` 换上的新 channel,而不是最初那个）。
    pub fn send(&self, values: Vec<V>) {
        if let Some(task) = self.task.upgrade() {
            task.inner_send(values);
        }
    }

    /// 读任务自己的下一个输入事件：可能是外部 `send`/`throw` 进来的值或失败，
    /// 也可能是通过 `pipe()` 接入的某个额外上游自己完成的通知。
    pub fn recv(&self) -> impl Future<Output = RecvEvent<V>> + Send + 'static
    where
        V: 'static,
    {
        let task = self.task.upgrade();
        RecvOrPending { task }
    }

    /// 把任务的输出临时让给 `other`，返回一个在 `other` 终结时才 resolve 的
    /// `Future`（spec §4.7 Sub："returns a Channel that is finished with the
    /// inner stream's final result... this lets the user's coroutine `yield`
    /// that channel to await the subtask's result"——这里直接返回可 `.await`
    /// 的 Future，而不是要求调用方再手动包一层读 Channel 的样板）。
    pub fn sub(&self, other: StreamHandle<V>) -> impl Future<Output = Result<Vec<V>, SkeinError>> {
        match self.task.upgrade() {
            Some(task) => {
                let channel = task.inner_sub(other);
                AwaitTerminal::new(StreamHandle::new(channel))
            }
            None => {
                let channel = Arc::new(Channel::new());
                channel.throw(
                    SkeinError::new(SkeinErrorKind::User)
                        .with_message("task dropped before sub() could run"),
                );
                AwaitTerminal::new(StreamHandle::new(channel))
            }
        }
    }

    /// 在工作线程池里跑一个阻塞闭包，返回在其完成时 resolve 的 `Future`。闭包
    /// 本身绝不触碰任何 Stream（spec §5）；结果通过调用队列交还给调度线程。
    pub fn thread<F>(&self, f: F) -> impl Future<Output = Result<Vec<V>, SkeinError>>
    where
        F: FnOnce() -> Result<Vec<V>, SkeinError> + Send + 'static,
    {
        let channel = Arc::new(Channel::new());
        match self.task.upgrade() {
            Some(task) => {
                let channel_for_job = channel.clone();
                let call_queue = task.runtime.call_queue().clone();
                task.runtime.worker_pool().submit(move || {
                    let outcome = f();
                    call_queue.asap(move || match outcome {
                        Ok(values) => channel_for_job.finish(values),
                        Err(error) => channel_for_job.throw(error),
                    });
                });
            }
            None => {
                channel.throw(
                    SkeinError::new(SkeinErrorKind::User)
                        .with_message("task dropped before thread() could run"),
                );
            }
        }
        AwaitTerminal::new(StreamHandle::new(channel))
    }
}

/// `Inner::recv` 返回的 Future：任务已经被 drop 时永远 `Pending`——没有任何
/// waker 会再唤醒它，协程体应当通过别的终止路径（比如它自己 `.await` 的另一
/// 个 Stream）退出，而不是指望这个分支恢复。
struct RecvOrPending<V> {
    task: Option<Arc<Task<V>>>,
}

impl<V: Clone + Send + Sync + 'static> Future for RecvOrPending<V> {
    type Output = RecvEvent<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(task) = this.task.clone() else { return Poll::Pending };
        let mut recv = task.recv_event();
        Pin::new(&mut recv).poll(cx)
    }
}

/// 构造并启动一个新 Task，返回它对外暴露的 Stream 句柄。这是 spec §6
/// `stream(fn)` 装饰器在只需要"构造一次"场景下的直接对应物；需要反复实例化
/// 同一段协程体的调用点应改用 [`stream`]。
pub fn spawn_task<V, B>(runtime: &Runtime, body: B) -> StreamHandle<V>
where
    V: Clone + Send + Sync + 'static,
    B: TaskBody<V>,
{
    let task = Arc::new_cyclic(|weak| {
        let input = Arc::new(Channel::new());
        let pipe_set = PipeSet::new();
        pipe_set.pipe_in(StreamHandle::new(input.clone()));
        let first_output = Arc::new(Channel::new());
        let output_stack = Stack::new();
        output_stack.push(StreamHandle::new(first_output.clone()));
        Task {
            id: StreamId::fresh(),
            task_id: TaskId::fresh(),
            runtime: runtime.clone(),
            pipe_set,
            input,
            output_stack,
            current_output: Mutex::new(first_output),
            coroutine: Mutex::new(None),
            started: AtomicBool::new(false),
            self_weak: weak.clone(),
        }
    });
    let inner = Inner { task: task.self_weak.clone() };
    let coroutine: BoxedCoroutine<V> = Box::pin(body(inner));
    *task.coroutine.lock() = Some(coroutine);
    task.start();
    StreamHandle::new(task)
}

/// spec §6 `stream(fn)` 装饰器：把一段可以反复实例化的协程体工厂，变成一个
/// "每调用一次就构造并启动一个新 Task"的工厂函数，镜像源语言里
/// "装饰器返回一个工厂"的用法（`worker()` 每次调用产生一个新的运行实例）。
pub fn stream<V, F, Fut>(body: F) -> impl Fn(&Runtime) -> StreamHandle<V>
where
    V: Clone + Send + Sync + 'static,
    F: Fn(Inner<V>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<Vec<V>, SkeinError>> + Send + 'static,
{
    move |runtime: &Runtime| {
        let body = body.clone();
        spawn_task(runtime, move |inner| body(inner))
    }
}
