//! 回调句柄与存放回调的代际 slab。
//!
//! `add_message_callback`/`add_finish_callback` 返回的句柄必须在任意时刻、被
//! `discard_*_callback` 调用任意次都是安全的（spec §3："discard is always safe
//! after any outcome"）。朴素的 `Vec<Option<F>>` 索引在槽位被复用后会让旧句柄
//! "幽灵式"地丢弃了别人的回调；这里给每个槽位配一个单调递增的 generation，
//! 句柄里带上它注册时的 generation，discard 时只在 generation 匹配时才生效。
use std::collections::HashMap;

/// 一个回调的不透明句柄。不实现 `Copy` 之外的运算；调用方只应把它存起来以便
/// 之后传给对应 Stream 的 `discard_*_callback`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    slot: u64,
    generation: u64,
}

impl CallbackHandle {
    /// 代表"已经同步触发过、无需再丢弃"的哨兵句柄。`add_*_callback` 在注册时
    /// 发现 Stream 已经处于可立即触发的状态时，会直接调用回调并返回这个句柄
    /// 而不是真的插入 slab——discard 在它身上永远是 no-op，正好符合
    /// "discard 在任何结果之后都必须安全" 的约定。
    pub(crate) fn already_fired() -> Self {
        Self { slot: u64::MAX, generation: u64::MAX }
    }
}

/// 一组同构回调（全部是消息回调，或全部是终止回调）的存放处。
///
/// 不是线程安全的容器本身——调用方（`Signals<V>`）负责在持锁区间内操作它；
/// slab 只管生命周期记账。
pub(crate) struct CallbackSlab<F> {
    next_slot: u64,
    generation: u64,
    entries: HashMap<u64, (u64, F)>,
}

impl<F> CallbackSlab<F> {
    pub(crate) fn new() -> Self {
        Self { next_slot: 0, generation: 0, entries: HashMap::new() }
    }

    pub(crate) fn insert(&mut self, callback: F) -> CallbackHandle {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        self.entries.insert(slot, (generation, callback));
        CallbackHandle { slot, generation }
    }

    /// 幂等移除：generation 不匹配（已经被 fire 或 discard 过）时静默返回 `None`。
    pub(crate) fn remove(&mut self, handle: CallbackHandle) -> Option<F> {
        match self.entries.get(&handle.slot) {
            Some((generation, _)) if *generation == handle.generation => {
                self.entries.remove(&handle.slot).map(|(_, callback)| callback)
            }
            _ => None,
        }
    }

    /// 取走全部回调，槽位清空；用于 activity/finish 信号触发时的"先拍快照再调用"。
    pub(crate) fn drain(&mut self) -> Vec<F> {
        self.entries.drain().map(|(_, (_, callback))| callback).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
