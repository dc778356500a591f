//! 场景级集成测试:把调度核心当黑盒,只通过公开 API 驱动。
//!
//! 每个测试对应核心协议文档里编号的一个场景(Echo / Pipe ordering / Broken
//! pipe / Any / Sub / Failure propagation),断言的是外部可观察行为,不深入
//! 内部聚合器的实现细节。

use std::error::Error as _;
use std::sync::{Arc, Mutex};
use std::thread;

use skein_core::{
    any, run, spawn_task, Channel, Inner, Item, RecvEvent, Runtime, SkeinError, SkeinErrorKind,
    SkeinStream, StreamHandle, Terminal,
};

/// Echo: 依次 send/send/finish,连续 `next_raw` 按 push 顺序产出,终止项在
/// 之后的读取里原样重复。
#[test]
fn channel_echo_repeats_terminal_idempotently() {
    let ch = Channel::<i32>::new();
    ch.send(vec![1]);
    ch.send(vec![2]);
    ch.finish(Vec::new());

    match ch.next_raw() {
        Some(Item::Value(values)) => assert_eq!(values, vec![1]),
        other => panic!("expected Value([1]), got {other:?}"),
    }
    match ch.next_raw() {
        Some(Item::Value(values)) => assert_eq!(values, vec![2]),
        other => panic!("expected Value([2]), got {other:?}"),
    }
    for _ in 0..3 {
        match ch.next_raw() {
            Some(Item::Terminal(Terminal::Done(values))) => assert!(values.is_empty()),
            other => panic!("expected a repeated empty Done terminal, got {other:?}"),
        }
    }
}

/// Pipe ordering: task `A` 发出 1,2,3 后结束;task `B` 把收到的每个值乘以 10
/// 转发。`run(A|B)` 应该返回 30,外部通过 `next_raw` 轮询看到的中间输出依次是
/// 10,20,30。
#[test]
fn pipe_ordering_scales_and_returns_last_value() {
    let runtime = Runtime::with_defaults();

    let a = spawn_task(&runtime, |inner: Inner<i32>| async move {
        inner.send(vec![1]);
        inner.send(vec![2]);
        inner.send(vec![3]);
        Ok(Vec::new())
    });

    let b = spawn_task(&runtime, |inner: Inner<i32>| async move {
        let mut last = Vec::new();
        loop {
            match inner.recv().await {
                RecvEvent::Value(values) => {
                    let scaled: Vec<i32> = values.into_iter().map(|v| v * 10).collect();
                    inner.send(scaled.clone());
                    last = scaled;
                }
                RecvEvent::UpstreamDone { result, .. } => {
                    result?;
                    return Ok(last);
                }
            }
        }
    });

    let piped = a | b;

    let observed = Arc::new(Mutex::new(Vec::new()));
    let reader = {
        let piped = piped.clone();
        let observed = Arc::clone(&observed);
        thread::spawn(move || loop {
            match piped.next_raw() {
                Some(Item::Value(values)) => observed.lock().unwrap().extend(values),
                Some(Item::Terminal(_)) => break,
                None => thread::yield_now(),
            }
        })
    };

    let result = run(&runtime, &piped).expect("pipe should finish successfully");
    reader.join().expect("reader thread must not panic");

    assert_eq!(result, vec![30]);
    assert_eq!(&*observed.lock().unwrap(), &[10, 20, 30]);
}

/// Broken pipe: `A` 在每次挂起之间不断发送,`B` 发一个值就结束。`R`(`B`)先
/// 于 `L`(`A`)终止,`A` 的输入上该在下一次挂起点观察到一个 BrokenPipe 并
/// 主动收尾;`run(A|B)` 返回 `B` 的值。
#[test]
fn r_finishing_first_breaks_l_and_run_returns_r_value() {
    let runtime = Runtime::with_defaults();

    let a = spawn_task(&runtime, |inner: Inner<i32>| async move {
        loop {
            inner.send(vec![1]);
            match inner.recv().await {
                RecvEvent::Value(_) => {}
                RecvEvent::UpstreamDone { result, .. } => {
                    result?;
                    return Ok(Vec::new());
                }
            }
        }
    });
    let a_for_assertion = a.clone();

    let b = spawn_task(&runtime, |inner: Inner<i32>| async move {
        inner.send(vec![99]);
        Ok(vec![99])
    });

    let piped = a | b;
    let result = run(&runtime, &piped).expect("B's value should win");
    assert_eq!(result, vec![99]);

    match a_for_assertion.result_raw() {
        Ok(Terminal::Failed(error)) => assert!(error.is_broken_pipe(), "A must exit via BrokenPipe"),
        other => panic!("expected A to have finished with a BrokenPipe failure, got {other:?}"),
    }
}

/// Any: 第一个产出任意 Item 的 Stream 赢,输家此后的活动不再有任何可观察
/// 效果。
#[test]
fn any_latches_the_first_item_and_ignores_the_loser() {
    let s1 = Arc::new(Channel::<i32>::new());
    let s2 = Arc::new(Channel::<i32>::new());
    s2.send(vec![42]);

    let winner = any(vec![StreamHandle::new(s1.clone()), StreamHandle::new(s2.clone())]);
    assert!(winner.has_result());
    match winner.result_raw() {
        Ok(Terminal::Done(values)) => assert_eq!(values, vec![42]),
        other => panic!("expected Done([42]), got {other:?}"),
    }

    s1.send(vec![0]);
    match winner.result_raw() {
        Ok(Terminal::Done(values)) => assert_eq!(values, vec![42], "loser activity must not change the winner"),
        other => panic!("expected the winner to stay Done([42]), got {other:?}"),
    }
}

/// Sub: task `T` 把输出临时让给子任务 `Q`;`Q` 终结后 `T` 的协程拿到 `Q` 的
/// 返回值恢复执行;下游读者先看到 `Q` 的输出,再无缝切回 `T` 自己的输出。
#[test]
fn sub_inlines_substream_output_then_resumes_owner() {
    let runtime = Runtime::with_defaults();

    let q = spawn_task(&runtime, |inner: Inner<i32>| async move {
        inner.send(vec![70]);
        Ok(vec![7])
    });

    let t = spawn_task(&runtime, move |inner: Inner<i32>| async move {
        let from_q = inner.sub(q).await?;
        inner.send(vec![from_q[0] * 100]);
        Ok(vec![1])
    });

    let observed = Arc::new(Mutex::new(Vec::new()));
    let reader = {
        let t = t.clone();
        let observed = Arc::clone(&observed);
        thread::spawn(move || loop {
            match t.next_raw() {
                Some(Item::Value(values)) => observed.lock().unwrap().extend(values),
                Some(Item::Terminal(_)) => break,
                None => thread::yield_now(),
            }
        })
    };

    let result = run(&runtime, &t).expect("sub should finish successfully");
    reader.join().expect("reader thread must not panic");

    assert_eq!(result, vec![1]);
    assert_eq!(&*observed.lock().unwrap(), &[70, 700]);
}

/// Failure propagation: 协程内部抛出的失败原样(kind、cause 链)透传到
/// `run` 的返回值。
#[test]
fn coroutine_failure_propagates_with_cause_chain_intact() {
    let runtime = Runtime::with_defaults();

    let task = spawn_task(&runtime, |_inner: Inner<i32>| async move {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        Err::<Vec<i32>, SkeinError>(SkeinError::user(cause))
    });

    let error = run(&runtime, &task).expect_err("task must fail");
    assert_eq!(error.kind(), SkeinErrorKind::User);
    let source = error.source().expect("cause chain must survive propagation");
    assert_eq!(source.to_string(), "boom");
}
