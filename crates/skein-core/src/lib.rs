//! skein-core: 单线程协作式调度核心。
//!
//! 一组 callback/generator 风格的任务（[`Task`]）共享一个调度线程;任务之间
//! 靠 [`Stream`](SkeinStream) 契约传值,靠 `pipe`/`any`/`sub` 组合子拼成更大
//! 的图,靠 [`run`]/[`run_with_cancellation`] 驱动到底。没有任何核心状态会
//! 在调度线程之外被修改——工作线程池只用来跑用户提供的阻塞闭包,结果通过
//! [`call_queue::CallQueue`] 原路交还。
//!
//! 典型用法:
//!
//! ```no_run
//! use skein_core::{run, spawn_task, Runtime};
//!
//! let runtime = Runtime::with_defaults();
//! let echo = spawn_task(&runtime, |inner| async move {
//!     inner.send(vec![1, 2, 3]);
//!     Ok(Vec::new())
//! });
//! let result = run(&runtime, &echo);
//! assert!(result.is_ok());
//! ```

mod call_queue;
mod callback;
mod channel;
mod combinators;
mod config;
mod error;
mod ids;
mod item;
mod pipe_set;
mod runtime;
mod stack;
mod stream;
mod task;
mod worker_pool;

pub use call_queue::CallQueue;
pub use channel::Channel;
pub use combinators::{any, any_with_source, pipe, pipe_pair, run, run_with_cancellation, Any, Cancellation, PipePair, Tagged};
pub use config::RuntimeConfig;
pub use error::{Result, SkeinError, SkeinErrorKind};
pub use ids::{StreamId, TaskId};
pub use item::{Item, Terminal};
pub use runtime::Runtime;
pub use stream::{NextItem, SkeinStream, StreamHandle};
pub use task::{spawn_task, stream, Inner, RecvEvent, Task, TaskBody};

pub use callback::CallbackHandle;
