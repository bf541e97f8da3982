use crate::error::TaskError;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

/// Terminal state of a [`Promise`].
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Completed(T),
    Failed(TaskError),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn into_result(self) -> Result<T, TaskError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(err) => Err(err),
            Self::Canceled => Err(TaskError::Canceled),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    fn from_result(result: Result<T, TaskError>) -> Self {
        match result {
            Ok(value) => Self::Completed(value),
            Err(TaskError::Canceled) => Self::Canceled,
            Err(err) => Self::Failed(err),
        }
    }
}

type Observer<T> = Box<dyn FnOnce(&Outcome<T>)>;
type ReleaseHook = Box<dyn FnOnce()>;

enum State<T> {
    Pending {
        observers: Vec<Observer<T>>,
        wakers: Vec<Waker>,
    },
    Settled(Outcome<T>),
}

struct Shared<T> {
    state: RefCell<State<T>>,
    release: RefCell<Option<ReleaseHook>>,
    observed: Cell<bool>,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // The last handle went away while the owner was still working: release it.
        let pending = matches!(self.state.get_mut(), State::Pending { .. });
        if let Some(release) = self.release.get_mut().take() {
            if pending {
                release();
            }
        }
    }
}

/// Single-assignment result of asynchronous work, owned by the logical scheduler thread.
///
/// A promise settles exactly once as completed, failed or canceled. Observers registered
/// before settlement run at settlement in registration order; observers registered later run
/// immediately. Awaiting a promise from a task registers the task's waker, so every task
/// awaiting the same promise resumes, in registration order, when it settles.
///
/// Disposing a pending promise cancels it and runs its release hook (which stops whatever
/// produces the value: a task, a database job, a timer). Disposal is idempotent.
pub struct Promise<T> {
    shared: Rc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.state.try_borrow() {
            Ok(state) => match &*state {
                State::Pending { .. } => "pending",
                State::Settled(Outcome::Completed(_)) => "completed",
                State::Settled(Outcome::Failed(_)) => "failed",
                State::Settled(Outcome::Canceled) => "canceled",
            },
            Err(_) => "settling",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(State::Pending {
                    observers: Vec::new(),
                    wakers: Vec::new(),
                }),
                release: RefCell::new(None),
                observed: Cell::new(false),
            }),
        }
    }

    pub fn completed(value: T) -> Self {
        Self::settled(Outcome::Completed(value))
    }

    pub fn failed(err: TaskError) -> Self {
        Self::settled(Outcome::Failed(err))
    }

    pub fn canceled() -> Self {
        Self::settled(Outcome::Canceled)
    }

    fn settled(outcome: Outcome<T>) -> Self {
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(State::Settled(outcome)),
                release: RefCell::new(None),
                observed: Cell::new(false),
            }),
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.resolve(Outcome::Completed(value))
    }

    pub fn fail(&self, err: TaskError) -> bool {
        self.resolve(Outcome::Failed(err))
    }

    /// Settle from a `Result`; `Err(TaskError::Canceled)` settles as canceled.
    pub fn settle(&self, result: Result<T, TaskError>) -> bool {
        self.resolve(Outcome::from_result(result))
    }

    /// Cancel the promise if it is still pending and release its owner.
    pub fn dispose(&self) {
        let release = self.shared.release.borrow_mut().take();
        if self.resolve(Outcome::Canceled) {
            if let Some(release) = release {
                release();
            }
        }
    }

    /// Install the hook that stops this promise's producer on disposal.
    ///
    /// Ignored when the promise has already settled.
    pub fn set_release(&self, hook: impl FnOnce() + 'static) {
        if self.is_pending() {
            *self.shared.release.borrow_mut() = Some(Box::new(hook));
        }
    }

    pub fn on_complete(&self, observer: impl FnOnce(&Outcome<T>) + 'static) {
        {
            let state = self.shared.state.borrow();
            if let State::Settled(outcome) = &*state {
                observer(outcome);
                return;
            }
        }
        if let State::Pending { observers, .. } = &mut *self.shared.state.borrow_mut() {
            observers.push(Box::new(observer));
        }
    }

    pub fn is_pending(&self) -> bool {
        match self.shared.state.try_borrow() {
            Ok(state) => matches!(&*state, State::Pending { .. }),
            Err(_) => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_canceled(&self) -> bool {
        match self.shared.state.try_borrow() {
            Ok(state) => matches!(&*state, State::Settled(Outcome::Canceled)),
            Err(_) => false,
        }
    }

    /// Record that a caller will read the outcome without registering an observer.
    pub fn mark_observed(&self) {
        self.shared.observed.set(true);
    }

    /// Whether anyone waits on this promise: an observer, an awaiting task or a run loop.
    pub fn has_observers(&self) -> bool {
        if self.shared.observed.get() {
            return true;
        }
        match &*self.shared.state.borrow() {
            State::Pending { observers, wakers } => !observers.is_empty() || !wakers.is_empty(),
            State::Settled(_) => false,
        }
    }

    pub fn downgrade(&self) -> WeakPromise<T> {
        WeakPromise {
            shared: Rc::downgrade(&self.shared),
        }
    }

    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let (observers, wakers) = {
            let Ok(mut state) = self.shared.state.try_borrow_mut() else {
                // Only possible while observers of this very promise are running.
                return false;
            };
            match &mut *state {
                State::Settled(_) => return false,
                State::Pending { observers, wakers } => {
                    let taken = (std::mem::take(observers), std::mem::take(wakers));
                    *state = State::Settled(outcome);
                    taken
                }
            }
        };
        let release = self.shared.release.borrow_mut().take();
        drop(release);

        if !observers.is_empty() {
            let state = self.shared.state.borrow();
            if let State::Settled(outcome) = &*state {
                for observer in observers {
                    observer(outcome);
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<T: Clone> Promise<T> {
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.shared.state.borrow() {
            State::Settled(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.borrow_mut();
        match &mut *state {
            State::Settled(outcome) => Poll::Ready(outcome.clone().into_result()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// Non-owning handle; does not keep a `WhileFutureLives` producer alive.
pub struct WeakPromise<T> {
    shared: Weak<Shared<T>>,
}

impl<T> Clone for WeakPromise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> WeakPromise<T> {
    pub fn upgrade(&self) -> Option<Promise<T>> {
        self.shared.upgrade().map(|shared| Promise { shared })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn observers_run_in_registration_order_at_completion() {
        let promise = Promise::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for id in 0..3 {
            let seen = Rc::clone(&seen);
            promise.on_complete(move |outcome: &Outcome<u32>| {
                if let Outcome::Completed(value) = outcome {
                    seen.borrow_mut().push((id, *value));
                }
            });
        }
        assert!(seen.borrow().is_empty());
        assert!(promise.complete(7));
        assert_eq!(*seen.borrow(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn late_observer_runs_synchronously() {
        let promise = Promise::completed("done");
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        promise.on_complete(move |outcome| flag.set(outcome.is_completed()));
        assert!(ran.get());
    }

    #[test]
    fn settles_exactly_once() {
        let promise = Promise::new();
        assert!(promise.complete(1));
        assert!(!promise.complete(2));
        assert!(!promise.fail(TaskError::Stalled));
        assert_eq!(promise.outcome().map(Outcome::into_result).unwrap().unwrap(), 1);
    }

    #[test]
    fn dispose_runs_release_once() {
        let released = Rc::new(Cell::new(0));
        let promise: Promise<()> = Promise::new();
        let counter = Rc::clone(&released);
        promise.set_release(move || counter.set(counter.get() + 1));
        promise.dispose();
        promise.dispose();
        assert_eq!(released.get(), 1);
        assert!(promise.is_canceled());
    }

    #[test]
    fn dropping_last_pending_handle_releases_owner() {
        let released = Rc::new(Cell::new(false));
        let promise: Promise<u8> = Promise::new();
        let flag = Rc::clone(&released);
        promise.set_release(move || flag.set(true));
        let weak = promise.downgrade();
        drop(promise);
        assert!(released.get());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn completed_promise_does_not_release_on_drop() {
        let released = Rc::new(Cell::new(false));
        let promise: Promise<u8> = Promise::new();
        let flag = Rc::clone(&released);
        promise.set_release(move || flag.set(true));
        promise.complete(3);
        drop(promise);
        assert!(!released.get());
    }
}
