use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tagdex_runtime::{yield_now, Promise, Queue, Scheduler, TaskError, TaskPolicy};

#[test]
fn queue_delivers_in_fifo_order_across_tasks() {
    let scheduler = Scheduler::with_workers(1);
    let queue = Queue::bounded(2);

    let producer_queue = queue.clone();
    let producer = scheduler.start(async move {
        for n in 0..10u32 {
            producer_queue.send(n).await?;
        }
        producer_queue.close();
        Ok(())
    });

    let consumer_queue = queue.clone();
    let consumer = scheduler.start(async move {
        let mut seen = Vec::new();
        while let Some(n) = consumer_queue.dequeue().await? {
            seen.push(n);
        }
        Ok(seen)
    });

    let seen = scheduler.wait(&consumer).expect("consumer");
    scheduler.wait(&producer).expect("producer");
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

#[test]
fn awaiting_tasks_resume_in_registration_order() {
    let scheduler = Scheduler::with_workers(1);
    let gate: Promise<u32> = Promise::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    let mut waiters = Vec::new();
    for id in 0..3 {
        let gate = gate.clone();
        let log = Rc::clone(&log);
        waiters.push(scheduler.start(async move {
            let value = gate.await?;
            log.borrow_mut().push((id, value));
            Ok(())
        }));
    }
    scheduler.run_until_idle();
    assert!(log.borrow().is_empty());

    gate.complete(11);
    for waiter in &waiters {
        scheduler.wait(waiter).expect("waiter");
    }
    assert_eq!(*log.borrow(), vec![(0, 11), (1, 11), (2, 11)]);
}

#[test]
fn timers_fire_in_deadline_order() {
    let scheduler = Scheduler::with_workers(1);
    let log = Rc::new(RefCell::new(Vec::new()));

    let mut tasks = Vec::new();
    for (label, delay) in [("slow", 40u64), ("fast", 5), ("medium", 20)] {
        let sleep = scheduler.sleep(Duration::from_millis(delay));
        let log = Rc::clone(&log);
        tasks.push(scheduler.start(async move {
            sleep.await?;
            log.borrow_mut().push(label);
            Ok(())
        }));
    }

    let started = Instant::now();
    for task in &tasks {
        scheduler.wait(task).expect("timer task");
    }
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(*log.borrow(), vec!["fast", "medium", "slow"]);
}

#[test]
fn waiting_on_a_promise_nobody_settles_reports_stall() {
    let scheduler = Scheduler::with_workers(1);
    let orphan: Promise<()> = Promise::new();
    assert!(matches!(
        scheduler.run_until(&orphan),
        Err(TaskError::Stalled)
    ));

    let queue: Queue<u8> = Queue::unbounded();
    let waiting = scheduler.start(async move { queue.dequeue().await });
    assert!(matches!(
        scheduler.run_until(&waiting),
        Err(TaskError::Stalled)
    ));
}

#[test]
fn blocking_jobs_rejoin_the_loop() {
    let scheduler = Scheduler::with_workers(2);
    let job = scheduler.run_blocking(|| {
        std::thread::sleep(Duration::from_millis(10));
        Ok(String::from("from worker"))
    });
    assert_eq!(scheduler.wait(&job).expect("job"), "from worker");

    let failing = scheduler.run_blocking(|| -> anyhow::Result<()> { anyhow::bail!("disk gone") });
    let err = scheduler.wait(&failing).expect_err("job should fail");
    assert!(err.to_string().contains("disk gone"));

    let panicking = scheduler.run_blocking(|| -> anyhow::Result<()> { panic!("boom") });
    assert!(matches!(
        scheduler.wait(&panicking),
        Err(TaskError::WorkerPanicked)
    ));
}

#[test]
fn disposing_cancels_the_task_and_settles_as_canceled() {
    let scheduler = Scheduler::with_workers(1);
    let reached_end = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&reached_end);
    let sleep = scheduler.sleep(Duration::from_secs(60));

    let task = scheduler.start_with(TaskPolicy::WhileFutureLives, async move {
        sleep.await?;
        *flag.borrow_mut() = true;
        Ok(())
    });
    scheduler.run_until_idle();
    task.dispose();
    task.dispose();

    assert!(task.is_canceled());
    assert_eq!(scheduler.task_count(), 0);
    assert!(matches!(scheduler.wait(&task), Err(TaskError::Canceled)));
    assert!(!*reached_end.borrow());
}

#[test]
fn unobserved_background_failure_reaches_error_handler() {
    let scheduler = Scheduler::with_workers(1);
    let reported = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&reported);
    scheduler.set_error_handler(move |err| sink.borrow_mut().push(err.to_string()));

    let _ = scheduler.start(async { Err::<(), _>(TaskError::failed(anyhow::anyhow!("lost"))) });
    scheduler.run_until_idle();
    assert_eq!(*reported.borrow(), vec!["lost".to_string()]);
}

#[test]
fn observed_failure_is_not_reported() {
    let scheduler = Scheduler::with_workers(1);
    let reported = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&reported);
    scheduler.set_error_handler(move |_| *sink.borrow_mut() += 1);

    let failing = scheduler.start(async { Err::<(), _>(TaskError::failed(anyhow::anyhow!("seen"))) });
    failing.on_complete(|_| {});
    scheduler.run_until_idle();
    assert_eq!(*reported.borrow(), 0);
    assert!(failing.is_settled());
}

#[test]
fn failure_returned_by_wait_is_not_reported() {
    let scheduler = Scheduler::with_workers(1);
    let reported = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&reported);
    scheduler.set_error_handler(move |_| *sink.borrow_mut() += 1);

    let failing = scheduler.start(async { Err::<(), _>(TaskError::Stalled) });
    assert!(matches!(scheduler.wait(&failing), Err(TaskError::Stalled)));
    assert_eq!(*reported.borrow(), 0);
}

#[test]
fn bounded_queue_never_holds_more_than_capacity() {
    let scheduler = Scheduler::with_workers(1);
    let queue: Queue<u32> = Queue::bounded(1);
    let peak = Rc::new(RefCell::new(0));

    let mut producers = Vec::new();
    for base in [0u32, 100] {
        let queue = queue.clone();
        let peak = Rc::clone(&peak);
        producers.push(scheduler.start(async move {
            for n in base..base + 5 {
                queue.send(n).await?;
                let len = queue.len();
                let mut peak = peak.borrow_mut();
                *peak = (*peak).max(len);
            }
            Ok(())
        }));
    }

    let consumer_queue = queue.clone();
    let consumer = scheduler.start(async move {
        let mut received = 0;
        while received < 10 {
            if consumer_queue.dequeue().await?.is_some() {
                received += 1;
            }
            yield_now().await;
        }
        Ok(received)
    });

    assert_eq!(scheduler.wait(&consumer).unwrap(), 10);
    for producer in &producers {
        scheduler.wait(producer).unwrap();
    }
    assert_eq!(*peak.borrow(), 1);
}

#[test]
fn yield_now_interleaves_tasks() {
    let scheduler = Scheduler::with_workers(1);
    let log = Rc::new(RefCell::new(Vec::new()));

    let mut tasks = Vec::new();
    for name in ["a", "b"] {
        let log = Rc::clone(&log);
        tasks.push(scheduler.start(async move {
            for step in 0..2 {
                log.borrow_mut().push(format!("{name}{step}"));
                yield_now().await;
            }
            Ok(())
        }));
    }
    for task in &tasks {
        scheduler.wait(task).expect("task");
    }
    assert_eq!(*log.borrow(), vec!["a0", "b0", "a1", "b1"]);
}

#[test]
fn block_on_returns_the_future_output() {
    let scheduler = Scheduler::with_workers(1);
    let inner = scheduler.clone();
    let value = scheduler
        .block_on(async move {
            inner.sleep(Duration::from_millis(1)).await?;
            let doubled = inner.run_blocking(|| Ok(21 * 2)).await?;
            Ok(doubled)
        })
        .expect("block_on");
    assert_eq!(value, 42);
}
