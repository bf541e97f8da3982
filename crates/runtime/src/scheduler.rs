use crate::error::TaskError;
use crate::promise::{Promise, WeakPromise};
use crate::worker::WorkerPool;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

type TaskId = u64;
type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;
type ErrorHandler = Rc<dyn Fn(&TaskError)>;

/// How a started task relates to the promise returned for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPolicy {
    /// Runs to completion whether or not anyone observes the promise.
    /// Failures nobody observes go to the scheduler's error handler.
    Background,
    /// Canceled as soon as its promise is disposed or every handle to it is dropped.
    WhileFutureLives,
}

struct Slot {
    future: Option<LocalFuture>,
    waker: Waker,
}

/// Ready-task queue shared with wakers on other threads.
struct ReadySignal {
    ready: Mutex<VecDeque<TaskId>>,
    available: Condvar,
}

impl ReadySignal {
    fn push(&self, id: TaskId) {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        ready.push_back(id);
        self.available.notify_one();
    }

    fn drain(&self) -> Vec<TaskId> {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        ready.drain(..).collect()
    }

    fn wait(&self, deadline: Option<Instant>) {
        let ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        if !ready.is_empty() {
            return;
        }
        match deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                let (_ready, _timeout) = self
                    .available
                    .wait_timeout(ready, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            None => {
                let _ready = self
                    .available
                    .wait(ready)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

struct TaskWaker {
    id: TaskId,
    signal: Arc<ReadySignal>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.signal.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.signal.push(self.id);
    }
}

struct Timer {
    deadline: Instant,
    seq: u64,
    promise: WeakPromise<()>,
}

impl Timer {
    fn is_live(&self) -> bool {
        self.promise
            .upgrade()
            .is_some_and(|promise| promise.is_pending())
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    tasks: RefCell<HashMap<TaskId, Slot>>,
    signal: Arc<ReadySignal>,
    timers: RefCell<BinaryHeap<Timer>>,
    next_id: Cell<u64>,
    external: Cell<usize>,
    workers: WorkerPool,
    error_handler: RefCell<ErrorHandler>,
}

impl Inner {
    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn spawn(&self, id: TaskId, future: LocalFuture) {
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            signal: Arc::clone(&self.signal),
        }));
        self.tasks.borrow_mut().insert(
            id,
            Slot {
                future: Some(future),
                waker,
            },
        );
        self.signal.push(id);
    }

    fn cancel(&self, id: TaskId) {
        let removed = self.tasks.borrow_mut().remove(&id);
        // Dropping the future may cancel further tasks, so the map borrow must be released.
        drop(removed);
    }

    fn poll_task(&self, id: TaskId) {
        let taken = {
            let mut tasks = self.tasks.borrow_mut();
            tasks
                .get_mut(&id)
                .and_then(|slot| slot.future.take().map(|future| (future, slot.waker.clone())))
        };
        let Some((mut future, waker)) = taken else {
            return;
        };

        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                let removed = self.tasks.borrow_mut().remove(&id);
                drop(removed);
                drop(future);
            }
            Poll::Pending => {
                let orphan = {
                    let mut tasks = self.tasks.borrow_mut();
                    match tasks.get_mut(&id) {
                        Some(slot) => {
                            slot.future = Some(future);
                            None
                        }
                        // Canceled while it was being polled.
                        None => Some(future),
                    }
                };
                drop(orphan);
            }
        }
    }

    fn fire_due_timers(&self) -> bool {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut timers = self.timers.borrow_mut();
            while timers.peek().is_some_and(|timer| timer.deadline <= now) {
                if let Some(timer) = timers.pop() {
                    due.push(timer);
                }
            }
        }
        let fired = !due.is_empty();
        for timer in due {
            if let Some(promise) = timer.promise.upgrade() {
                promise.complete(());
            }
        }
        fired
    }

    /// Earliest deadline of a timer somebody still waits for; dead timers are pruned.
    fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self.timers.borrow_mut();
        while let Some(timer) = timers.peek() {
            if timer.is_live() {
                return Some(timer.deadline);
            }
            timers.pop();
        }
        None
    }

    fn report(&self, err: &TaskError) {
        let handler = self.error_handler.borrow().clone();
        handler(err);
    }
}

/// Cooperative single-threaded task scheduler.
///
/// Tasks are futures polled only from this scheduler's run loop (`run_until`, `block_on`,
/// `run_until_idle`) on the thread that owns it. Blocking work runs on a small worker pool and
/// rejoins the loop through a promise. The handle is cheap to clone; every component receives
/// one at construction.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_workers(WorkerPool::default_size())
    }

    pub fn with_workers(workers: usize) -> Self {
        let default_handler: ErrorHandler =
            Rc::new(|err: &TaskError| log::error!("Unobserved task failure: {err}"));
        Self {
            inner: Rc::new(Inner {
                tasks: RefCell::new(HashMap::new()),
                signal: Arc::new(ReadySignal {
                    ready: Mutex::new(VecDeque::new()),
                    available: Condvar::new(),
                }),
                timers: RefCell::new(BinaryHeap::new()),
                next_id: Cell::new(1),
                external: Cell::new(0),
                workers: WorkerPool::new(workers),
                error_handler: RefCell::new(default_handler),
            }),
        }
    }

    /// Replace the handler that receives failures of unobserved background tasks.
    pub fn set_error_handler(&self, handler: impl Fn(&TaskError) + 'static) {
        *self.inner.error_handler.borrow_mut() = Rc::new(handler);
    }

    pub fn task_count(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Start a background task.
    pub fn start<T, F>(&self, future: F) -> Promise<T>
    where
        T: 'static,
        F: Future<Output = Result<T, TaskError>> + 'static,
    {
        self.start_with(TaskPolicy::Background, future)
    }

    pub fn start_with<T, F>(&self, policy: TaskPolicy, future: F) -> Promise<T>
    where
        T: 'static,
        F: Future<Output = Result<T, TaskError>> + 'static,
    {
        let promise = Promise::new();
        let id = self.inner.next_id();

        enum Link<P> {
            Strong(Promise<P>),
            Weak(WeakPromise<P>),
        }
        let link = match policy {
            TaskPolicy::Background => Link::Strong(promise.clone()),
            TaskPolicy::WhileFutureLives => Link::Weak(promise.downgrade()),
        };

        let scheduler = Rc::downgrade(&self.inner);
        let task = async move {
            let result = future.await;
            let promise = match link {
                Link::Strong(promise) => promise,
                Link::Weak(weak) => match weak.upgrade() {
                    Some(promise) => promise,
                    None => return,
                },
            };
            if let Err(err) = &result {
                if policy == TaskPolicy::Background
                    && !err.is_canceled()
                    && !promise.has_observers()
                {
                    if let Some(inner) = scheduler.upgrade() {
                        inner.report(err);
                    }
                }
            }
            promise.settle(result);
        };

        let scheduler: Weak<Inner> = Rc::downgrade(&self.inner);
        promise.set_release(move || {
            if let Some(inner) = scheduler.upgrade() {
                inner.cancel(id);
            }
        });
        self.inner.spawn(id, Box::pin(task));
        promise
    }

    /// Wrap a future whose wake-up comes from another OS thread.
    ///
    /// While the returned future is alive the run loop blocks waiting for that wake-up instead
    /// of reporting a stall.
    pub fn external<F: Future>(&self, future: F) -> impl Future<Output = F::Output> {
        let guard = ExternalGuard::new(&self.inner);
        async move {
            let output = future.await;
            drop(guard);
            output
        }
    }

    /// Promise completing once `duration` has elapsed.
    pub fn sleep(&self, duration: Duration) -> Promise<()> {
        let promise = Promise::new();
        let seq = self.inner.next_id();
        self.inner.timers.borrow_mut().push(Timer {
            deadline: Instant::now() + duration,
            seq,
            promise: promise.downgrade(),
        });
        promise
    }

    /// Run a blocking closure on the worker pool.
    ///
    /// Dropping or disposing the promise stops waiting but does not interrupt the job.
    pub fn run_blocking<T, F>(&self, job: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.inner.workers.execute(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job));
            let _ = tx.send(result.map_err(|_| ()));
        }));
        let completion = self.external(rx);
        self.start_with(TaskPolicy::WhileFutureLives, async move {
            match completion.await {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(err))) => Err(TaskError::from(err)),
                Ok(Err(())) | Err(_) => Err(TaskError::WorkerPanicked),
            }
        })
    }

    /// Poll every runnable task once (and fire due timers). Returns whether anything ran.
    pub fn turn(&self) -> bool {
        let fired = self.inner.fire_due_timers();
        let batch = self.inner.signal.drain();
        let polled = !batch.is_empty();
        for id in batch {
            self.inner.poll_task(id);
        }
        fired || polled
    }

    /// Run until no task is runnable, without waiting for timers or other threads.
    pub fn run_until_idle(&self) {
        while self.turn() {}
    }

    /// Drive the loop until `promise` settles.
    ///
    /// Fails with [`TaskError::Stalled`] when nothing runnable, no pending timer and no
    /// cross-thread wake-up remain, i.e. the promise can never settle.
    pub fn run_until<T>(&self, promise: &Promise<T>) -> Result<(), TaskError> {
        promise.mark_observed();
        loop {
            if promise.is_settled() {
                return Ok(());
            }
            if self.turn() {
                continue;
            }
            let deadline = self.inner.next_deadline();
            if deadline.is_none() && self.inner.external.get() == 0 {
                return Err(TaskError::Stalled);
            }
            self.inner.signal.wait(deadline);
        }
    }

    /// Drive the loop until `promise` settles and return its outcome.
    pub fn wait<T: Clone>(&self, promise: &Promise<T>) -> Result<T, TaskError> {
        self.run_until(promise)?;
        match promise.outcome() {
            Some(outcome) => outcome.into_result(),
            None => Err(TaskError::Stalled),
        }
    }

    /// Run `future` as a task tied to this call and drive the loop until it finishes.
    pub fn block_on<T, F>(&self, future: F) -> Result<T, TaskError>
    where
        T: 'static,
        F: Future<Output = Result<T, TaskError>> + 'static,
    {
        let slot = Rc::new(RefCell::new(None));
        let output = Rc::clone(&slot);
        let promise = self.start_with(TaskPolicy::WhileFutureLives, async move {
            let result = future.await;
            *output.borrow_mut() = Some(result);
            Ok(())
        });
        self.run_until(&promise)?;
        let result = slot.borrow_mut().take();
        result.unwrap_or(Err(TaskError::Canceled))
    }
}

struct ExternalGuard {
    inner: Weak<Inner>,
}

impl ExternalGuard {
    fn new(inner: &Rc<Inner>) -> Self {
        inner.external.set(inner.external.get() + 1);
        Self {
            inner: Rc::downgrade(inner),
        }
    }
}

impl Drop for ExternalGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.external.set(inner.external.get().saturating_sub(1));
        }
    }
}

/// Yield once to the other runnable tasks.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_heap_pops_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (offset, seq) in [(30, 1), (10, 2), (20, 3), (10, 4)] {
            heap.push(Timer {
                deadline: now + Duration::from_millis(offset),
                seq,
                promise: Promise::new().downgrade(),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|timer| timer.seq)).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[test]
    fn completed_task_is_removed() {
        let scheduler = Scheduler::with_workers(1);
        let promise = scheduler.start(async { Ok(5) });
        assert_eq!(scheduler.wait(&promise).unwrap(), 5);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn dropping_while_future_lives_handle_cancels_task() {
        let scheduler = Scheduler::with_workers(1);
        let gate: Promise<()> = Promise::new();
        let waiting = gate.clone();
        let promise = scheduler.start_with(TaskPolicy::WhileFutureLives, async move {
            waiting.await?;
            Ok(())
        });
        scheduler.run_until_idle();
        assert_eq!(scheduler.task_count(), 1);
        drop(promise);
        assert_eq!(scheduler.task_count(), 0);
    }
}
