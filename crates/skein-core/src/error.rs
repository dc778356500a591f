//! 错误域：运行时核心的统一失败类型。
//!
//! # Why
//! 调度器永远不在内部吞掉失败——每一个失败都会被编码为某个 Stream 的终止 Item，
//! 并在下一次被消费时原样重新抛出（参见 `pipe_set`、`task` 中对 [`SkeinError`] 的透传）。
//! 这要求错误类型本身足够"薄"：可以被克隆后广播给多个 `finish` 回调，同时仍然保留
//! 原始 cause 链供调用方按 `std::error::Error::source` 继续下钻。
//!
//! # How
//! 形状直接取自教师仓库 `spark-core::error::CoreError` 的构造器模式（`with_cause`
//! 等链式方法），但 cause 字段使用 `Arc` 而非 `Box`，使 [`SkeinError`] 可以
//! `#[derive(Clone)]`——终止 Item 在队列里被多个读者各自持有一份是常态。
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// 错误类别，对应 spec 第 7 节列出的五种 kind。
///
/// `#[non_exhaustive]`：未来可能需要区分更多取消原因而不破坏下游的 match。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SkeinErrorKind {
    /// 生产者正常终止的控制流标记；只有在消费者把“意外关闭”当错误处理时才会对用户可见。
    #[error("stream finished")]
    Finished,
    /// 在尚未终止的 Stream 上调用 `result_raw` 触发的编程错误。
    #[error("stream is not finished")]
    NotFinished,
    /// 同步读取路径（`next`）在没有待取项时的预期失败，轮询式消费者会用到。
    #[error("no item available")]
    Empty,
    /// `PipePair` 下游先于上游终止时，注入给上游输入通道的取消原因。
    #[error("broken pipe")]
    BrokenPipe,
    /// 协程内部抛出的、或从外部 `throw` 进任务输入通道的不透明用户失败。
    #[error("user failure")]
    User,
}

/// 运行时核心的统一失败类型。
///
/// 始终通过 [`SkeinError::new`] 或其 `From` 实现构造；`cause` 链通过
/// `std::error::Error::source` 暴露，不会在核心内部被解包或丢弃。
#[derive(Debug, Clone)]
pub struct SkeinError {
    kind: SkeinErrorKind,
    message: Option<Cow<'static, str>>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SkeinError {
    /// 构造一个只带 kind、不带消息和 cause 的失败。
    pub fn new(kind: SkeinErrorKind) -> Self {
        Self { kind, message: None, cause: None }
    }

    pub fn finished() -> Self {
        Self::new(SkeinErrorKind::Finished)
    }

    pub fn not_finished() -> Self {
        Self::new(SkeinErrorKind::NotFinished)
    }

    pub fn empty() -> Self {
        Self::new(SkeinErrorKind::Empty)
    }

    pub fn broken_pipe() -> Self {
        Self::new(SkeinErrorKind::BrokenPipe).with_message("downstream pipe closed")
    }

    /// 包装一个任意用户失败为 `User` kind，原值作为 cause 保留。
    pub fn user<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(SkeinErrorKind::User).with_cause(cause)
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> SkeinErrorKind {
        self.kind
    }

    pub fn is_broken_pipe(&self) -> bool {
        self.kind == SkeinErrorKind::BrokenPipe
    }
}

impl fmt::Display for SkeinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind, message),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for SkeinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|cause| cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// 核心内部统一使用的 `Result` 别名。
pub type Result<T, E = SkeinError> = std::result::Result<T, E>;
