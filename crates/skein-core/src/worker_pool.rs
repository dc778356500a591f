//! 工作线程池：`inner.thread(f)` 背后的有界阻塞执行体。
//!
//! spec §1/§2 把线程池列为"叶子原语"、明确 OUT OF SCOPE 精细设计，但
//! `inner.thread` 是公开接口的一部分（§6），所以仍然需要一个具体实现。这里
//! 选最朴素的形状：固定数量的 OS 线程共享一个 `mpsc::Receiver`，谁先抢到锁谁
//! 执行下一个任务。工作线程跑的闭包本身绝不触碰任何 Stream——它算完之后把
//! 结果封装成另一个闭包，通过 [`crate::call_queue::CallQueue::asap`] 原路
//! 交还给调度线程去写入 Channel，遵守 §5 "a thread pool... its only
//! interaction with the core is via call_queue.add(...)" 的边界。
//!
//! `mpsc::Sender` 没有实现 `Sync`，而 `WorkerPool` 要以 `Arc<WorkerPool>` 的
//! 形式被多个并发提交者（可能是不同 Task 各自的调度线程回调）共享，所以发送端
//! 包一层 `parking_lot::Mutex`——临界区只是一次 `send`，不会成为争用热点。
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 有界的阻塞调用工作线程池。
pub struct WorkerPool {
    sender: Mutex<mpsc::Sender<Job>>,
    _handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// 启动 `size` 个工作线程（至少 1 个）。
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(size.max(1));
        for worker_index in 0..size.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("skein-worker-{worker_index}"))
                .spawn(move || loop {
                    let job = {
                        let queue = receiver.lock();
                        queue.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break, // 发送端全部掉线：池在关闭。
                    }
                })
                .expect("failed to spawn skein worker thread");
            handles.push(handle);
        }
        Self { sender: Mutex::new(sender), _handles: handles }
    }

    /// 提交一个阻塞闭包；池关闭后静默丢弃（没有调用方会再等待结果，因为
    /// `Inner::thread` 返回的 Channel 在这种情况下只是永远不会完成）。
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.lock().send(Box::new(job));
    }
}
