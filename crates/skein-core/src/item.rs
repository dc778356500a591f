//! Item：在所有 Stream 上流转的统一载荷。
//!
//! spec 把 Item 描述为 `(final, throw, args)` 三元组。把 `throw` 折进
//! `Terminal` 的两个分支而不是独立保留两个布尔位，是因为在这个 crate 暴露给
//! 外部的每一种 Stream（`Channel`、`Stack`、`Task`、`PipePair`、`Any`）里，
//! `throw=true` 只会和 `final=true` 同时出现——非终止项携带失败这件事，只有
//! `PipeSet` 内部的"上游已完成"改写会用到，而 `PipeSet` 特意不通过
//! `SkeinStream<V>` 对外暴露（见 `pipe_set` 模块文档），所以对外的 `Item<V>`
//! 可以保持一个干净的二态和。
use crate::error::SkeinError;

/// 一次 `send` 所携带的一批值，或者一个终止结果。
#[derive(Debug, Clone)]
pub enum Item<V> {
    /// 非终止项：一次 push 对应的一组值（arity 可以是 0）。
    Value(Vec<V>),
    /// 粘性终止项：一旦产生，后续的读取必须原样重复返回它。
    Terminal(Terminal<V>),
}

/// 终止结果：成功携带最后一批值，失败携带 [`SkeinError`]。
#[derive(Debug, Clone)]
pub enum Terminal<V> {
    Done(Vec<V>),
    Failed(SkeinError),
}

impl<V> Item<V> {
    pub fn value(values: Vec<V>) -> Self {
        Item::Value(values)
    }

    pub fn done(values: Vec<V>) -> Self {
        Item::Terminal(Terminal::Done(values))
    }

    pub fn failed(error: SkeinError) -> Self {
        Item::Terminal(Terminal::Failed(error))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Item::Terminal(_))
    }

    pub fn as_terminal(&self) -> Option<&Terminal<V>> {
        match self {
            Item::Terminal(terminal) => Some(terminal),
            Item::Value(_) => None,
        }
    }

    pub fn into_terminal(self) -> Option<Terminal<V>> {
        match self {
            Item::Terminal(terminal) => Some(terminal),
            Item::Value(_) => None,
        }
    }
}

impl<V> Terminal<V> {
    /// 把终止结果转换为 `Result`，消费掉自身；`Done` 在多值情形下只取最后一个
    /// 值作为"协程返回值"的等价物（和 Python 侧 `StopIteration(*args)` 的单一
    /// 返回值语义一致），调用方需要完整序列时应改读 `Done(values)` 本身。
    pub fn into_result(self) -> Result<Vec<V>, SkeinError> {
        match self {
            Terminal::Done(values) => Ok(values),
            Terminal::Failed(error) => Err(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Terminal::Failed(_))
    }
}
