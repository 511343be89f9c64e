mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::*;
use twinslot::engine::ThreadedRequest;
use twinslot::pipeline::{AsyncInferQueue, Completed, SlotId, SlotPhase, ThroughputCounter};
use twinslot::PipelineError;

fn echoed(done: &Completed<u64>) -> Option<u64> {
    let outputs = done.outputs.as_ref().ok()?;
    Some(outputs.get(OUTPUT)?.data()[0] as u64)
}

#[test]
fn callbacks_follow_completion_order() {
    let engine = engine(EchoModel::new(), 2);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut queue = AsyncInferQueue::new(&engine, 2, {
        let order = order.clone();
        move |done: Completed<u64>| {
            order.lock().unwrap().push((done.context, echoed(&done)));
        }
    })
    .unwrap();

    queue.submit(INPUT, job(1, 150), 1).unwrap();
    queue.submit(INPUT, job(2, 0), 2).unwrap();
    queue.wait_all();

    assert_eq!(*order.lock().unwrap(), vec![(2, Some(2)), (1, Some(1))]);
}

#[test]
fn wait_all_settles_every_job() {
    let engine = engine(EchoModel::new(), 3);
    let counter = Arc::new(ThroughputCounter::new(8));

    let mut queue = AsyncInferQueue::new(&engine, 4, {
        let counter = counter.clone();
        move |done: Completed<u64>| {
            if done.outputs.is_ok() {
                counter.record();
            }
        }
    })
    .unwrap();

    for id in 0..20 {
        queue.submit(INPUT, job(id, id % 4), id).unwrap();
    }
    queue.wait_all();

    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.submitted(), 20);
    assert_eq!(queue.completed(), 20);
    assert_eq!(counter.frames(), 20);
    for index in 0..queue.size() {
        assert_eq!(queue.phase(SlotId(index)), Some(SlotPhase::Idle));
    }
    assert_eq!(queue.phase(SlotId(queue.size())), None);
}

#[test]
fn slots_are_free_once_wait_all_returns() {
    let engine = engine(EchoModel::new(), 2);
    let mut queue: AsyncInferQueue<ThreadedRequest, u64> =
        AsyncInferQueue::new(&engine, 2, |_| {}).unwrap();

    for round in 0..500 {
        queue.submit(INPUT, job(round, 0), round).unwrap();
        queue.submit(INPUT, job(round, 0), round).unwrap();
        queue.wait_all();
        assert!(queue.is_ready(), "round {}", round);
        assert_eq!(queue.in_flight(), 0);
    }
    assert_eq!(queue.completed(), 1000);
}

#[test]
fn submit_blocks_while_every_slot_is_busy() {
    let (gate_tx, gate_rx) = flume::unbounded();
    let engine = engine(EchoModel::gated(gate_rx), 2);
    let mut queue: AsyncInferQueue<ThreadedRequest, u64> =
        AsyncInferQueue::new(&engine, 2, |_| {}).unwrap();

    queue.submit(INPUT, job(1, 0), 1).unwrap();
    queue.submit(INPUT, job(2, 0), 2).unwrap();
    assert!(!queue.is_ready());
    assert_eq!(queue.in_flight(), 2);

    let (done_tx, done_rx) = flume::bounded(1);
    let submitter = thread::spawn(move || {
        let slot = queue.submit(INPUT, job(3, 0), 3);
        done_tx.send(()).unwrap();
        slot.map(|_| queue)
    });

    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

    // one job finishes and frees its slot
    gate_tx.send(()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    drop(gate_tx);
    let queue = submitter.join().unwrap().unwrap();
    queue.wait_all();
    assert_eq!(queue.completed(), 3);
}

#[test]
fn panicking_callback_frees_its_slot() {
    let engine = engine(EchoModel::new(), 1);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut queue = AsyncInferQueue::new(&engine, 1, {
        let seen = seen.clone();
        move |done: Completed<u64>| {
            if done.context == 1 {
                panic!("callback failure");
            }
            seen.lock().unwrap().push(done.context);
        }
    })
    .unwrap();

    queue.submit(INPUT, job(1, 0), 1).unwrap();
    // only returns once slot 0 is idle again
    queue.submit(INPUT, job(2, 0), 2).unwrap();
    queue.wait_all();

    assert_eq!(*seen.lock().unwrap(), vec![2]);
    assert_eq!(queue.completed(), 2);
    assert!(queue.is_ready());
}

#[test]
fn engine_errors_reach_the_callback() {
    let engine = engine(EchoModel::failing_on(1), 1);
    let failures = Arc::new(Mutex::new(0));

    let mut queue = AsyncInferQueue::new(&engine, 2, {
        let failures = failures.clone();
        move |done: Completed<u64>| {
            if done.outputs.is_err() {
                *failures.lock().unwrap() += 1;
            }
        }
    })
    .unwrap();

    queue.submit(INPUT, job(1, 0), 1).unwrap();
    queue.submit(INPUT, job(2, 0), 2).unwrap();
    queue.wait_all();

    assert_eq!(*failures.lock().unwrap(), 1);
    assert_eq!(queue.completed(), 2);
}

#[test]
fn unknown_input_releases_the_slot() {
    let engine = engine(EchoModel::new(), 1);
    let mut queue: AsyncInferQueue<ThreadedRequest, u64> =
        AsyncInferQueue::new(&engine, 1, |_| {}).unwrap();

    let err = queue.submit("missing", job(1, 0), 1).unwrap_err();
    assert!(matches!(err, PipelineError::Engine(_)), "{:?}", err);
    assert!(queue.is_ready());
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.submitted(), 0);
}

#[test]
fn empty_queue_is_rejected() {
    let engine = engine(EchoModel::new(), 1);
    let result: Result<AsyncInferQueue<ThreadedRequest, u64>, _> =
        AsyncInferQueue::new(&engine, 0, |_| {});
    assert!(matches!(result, Err(PipelineError::EmptyPool)));
}
