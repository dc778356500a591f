//! 并发原语测试套件。
//!
//! - **Why**:`CallQueue`、`Channel`、`Cancellation` 是少数几个真正需要跨线程
//!   可见性保证的原语——派发线程之外的工作线程、取消触发方、测试里的观察
//!   线程都可能和调度线程同时读写它们。
//! - **How**:每个测试构造一到两个额外线程重建真实的竞争路径,断言的是状态
//!   不变量,而不是具体的调度时序。
//! - **What**:覆盖调用队列的跨线程唤醒、Pipe-set 对多个上游活动的公平交叉、
//!   消息回调"边缘前/边缘后注册都恰好触发一次"的语义,以及取消令牌的跨线程
//!   可见性。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use skein_core::{
    run, spawn_task, Cancellation, Channel, Inner, Item, RecvEvent, Runtime, SkeinStream, StreamHandle,
};

/// `inner.thread(f)`:`f` 在工作线程池的某个线程上跑,结果通过调用队列
/// 交还给调度线程——验证的正是这条"跨线程入队,调度线程上排空"的路径,而不是
/// 调用 `f` 的那个工作线程自己把结果写进 Channel。
#[test]
fn worker_thread_result_is_relayed_through_the_call_queue() {
    let runtime = Runtime::with_defaults();
    let task = spawn_task(&runtime, |inner: Inner<i32>| async move {
        inner.thread(|| Ok(vec![1, 2, 3])).await
    });
    let result = run(&runtime, &task).expect("thread-relayed result should complete");
    assert_eq!(result, vec![1, 2, 3]);
}

/// Pipe-set 对多个上游的公平交叉:`A` 发 `a1`,`B` 发 `b1`,`A` 再发 `a2`,
/// 按这三次 push 的顺序被拼进 pipe-set 的读者(对应文档里列出的测试性质:
/// "reader 按顺序观察到 a1, b1, a2")。
#[test]
fn pipe_set_interleaves_upstream_activity_in_push_order() {
    let runtime = Runtime::with_defaults();
    let a = Arc::new(Channel::<i32>::new());
    let b = Arc::new(Channel::<i32>::new());

    let task = spawn_task(&runtime, |inner: Inner<i32>| async move {
        let mut seen = Vec::new();
        loop {
            match inner.recv().await {
                RecvEvent::Value(values) => {
                    seen.extend(values);
                    if seen.len() >= 3 {
                        return Ok(seen);
                    }
                }
                RecvEvent::UpstreamDone { .. } => {}
            }
        }
    });
    task.pipe(StreamHandle::new(a.clone())).expect("task accepts piped input");
    task.pipe(StreamHandle::new(b.clone())).expect("task accepts piped input");

    a.send(vec![1]); // a1
    b.send(vec![2]); // b1
    a.send(vec![3]); // a2

    let result = run(&runtime, &task).expect("task should observe all three values");
    assert_eq!(result, vec![1, 2, 3]);
}

/// 消息回调:不管注册发生在活动边缘之前还是之后,都恰好触发一次。
#[test]
fn message_callback_fires_exactly_once_regardless_of_registration_order() {
    let ch = Channel::<i32>::new();

    let before_edge = Arc::new(AtomicUsize::new(0));
    {
        let before_edge = Arc::clone(&before_edge);
        ch.add_message_callback(Box::new(move || {
            before_edge.fetch_add(1, Ordering::SeqCst);
        }));
    }
    ch.send(vec![1]);
    assert_eq!(before_edge.load(Ordering::SeqCst), 1, "registered before the edge, fires once on it");

    let _ = ch.next_raw();

    ch.send(vec![2]);
    let after_edge = Arc::new(AtomicUsize::new(0));
    {
        let after_edge = Arc::clone(&after_edge);
        ch.add_message_callback(Box::new(move || {
            after_edge.fetch_add(1, Ordering::SeqCst);
        }));
    }
    assert_eq!(
        after_edge.load(Ordering::SeqCst),
        1,
        "registered after data was already pending, fires synchronously once"
    );
}

/// 取消令牌的跨线程可见性:一个线程触发 `trigger()`,`run_with_cancellation`
/// 在调度线程的下一轮循环里必须观察到它并让 `main` 收尾。
#[test]
fn cancellation_trigger_is_visible_to_the_dispatch_loop() {
    let runtime = Runtime::with_defaults();
    let cancellation = Cancellation::new();

    let task = spawn_task(&runtime, |inner: Inner<i32>| async move {
        loop {
            match inner.recv().await {
                RecvEvent::Value(_) => {}
                RecvEvent::UpstreamDone { result, .. } => {
                    result?;
                    return Ok(Vec::new());
                }
            }
        }
    });

    let trigger = {
        let cancellation = cancellation.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancellation.trigger();
        })
    };

    let error = skein_core::run_with_cancellation(&runtime, &task, Some(&cancellation))
        .expect_err("a triggered cancellation must surface as a failure");
    trigger.join().expect("trigger thread must not panic");
    assert_eq!(error.kind(), skein_core::SkeinErrorKind::User);
}

/// 观察线程在调度线程推进任务的同时反复读取输出,验证读写两端在不同线程上
/// 并发操作同一个 Stream 时不会丢失或重复条目。
#[test]
fn concurrent_reader_observes_every_pushed_value_exactly_once() {
    let runtime = Runtime::with_defaults();
    let task = spawn_task(&runtime, |inner: Inner<i32>| async move {
        for value in 0..50 {
            inner.send(vec![value]);
        }
        Ok(Vec::new())
    });

    let observed = Arc::new(Mutex::new(Vec::new()));
    let reader = {
        let task = task.clone();
        let observed = Arc::clone(&observed);
        thread::spawn(move || loop {
            match task.next_raw() {
                Some(Item::Value(values)) => observed.lock().unwrap().extend(values),
                Some(Item::Terminal(_)) => break,
                None => thread::yield_now(),
            }
        })
    };

    run(&runtime, &task).expect("task should finish");
    reader.join().expect("reader thread must not panic");

    let expected: Vec<i32> = (0..50).collect();
    assert_eq!(&*observed.lock().unwrap(), &expected);
}
