use crate::error::TaskError;
use crate::promise::{Promise, WeakPromise};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct QueueState<T> {
    items: VecDeque<T>,
    consumers: VecDeque<WeakPromise<Option<T>>>,
    producers: VecDeque<WeakPromise<()>>,
    /// Reservations handed out whose holder has not enqueued yet.
    granted: Vec<WeakPromise<()>>,
    capacity: Option<usize>,
    closed: bool,
    terminal_delivered: bool,
}

impl<T> QueueState<T> {
    /// A granted reservation holds its slot until its promise handle is dropped.
    fn reserved(&mut self) -> usize {
        self.granted.retain(|weak| weak.upgrade().is_some());
        self.granted.len()
    }

    fn has_room(&mut self) -> bool {
        match self.capacity {
            Some(cap) => self.items.len() + self.reserved() < cap,
            None => true,
        }
    }

    /// Grant waiting producers, oldest first, while slots are free.
    fn grant_waiting(&mut self) -> Vec<Promise<()>> {
        let mut woken = Vec::new();
        while self.has_room() {
            let Some(weak) = self.producers.pop_front() else {
                break;
            };
            if let Some(producer) = weak.upgrade().filter(Promise::is_pending) {
                self.granted.push(producer.downgrade());
                woken.push(producer);
            }
        }
        woken
    }
}

/// FIFO channel between tasks on one scheduler.
///
/// `dequeue` yields `Some(item)` per item, then `None` exactly once after [`Queue::close`] and
/// the drain of what was left, then fails with [`TaskError::QueueClosed`]. Waiting consumers are
/// served in the order they asked. The capacity bound only applies to producers that go through
/// [`Queue::reserve`] or [`Queue::send`]; `enqueue` itself never waits.
pub struct Queue<T> {
    shared: Rc<RefCell<QueueState<T>>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: 'static> Queue<T> {
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Rc::new(RefCell::new(QueueState {
                items: VecDeque::new(),
                consumers: VecDeque::new(),
                producers: VecDeque::new(),
                granted: Vec::new(),
                capacity,
                closed: false,
                terminal_delivered: false,
            })),
        }
    }

    /// Hand `item` to the oldest waiting consumer, or store it.
    pub fn enqueue(&self, item: T) -> Result<(), TaskError> {
        loop {
            let consumer = {
                let mut state = self.shared.borrow_mut();
                if state.closed {
                    return Err(TaskError::QueueClosed);
                }
                match state.consumers.pop_front() {
                    Some(consumer) => consumer,
                    None => {
                        state.items.push_back(item);
                        return Ok(());
                    }
                }
            };
            if let Some(consumer) = consumer.upgrade().filter(Promise::is_pending) {
                consumer.complete(Some(item));
                return Ok(());
            }
        }
    }

    pub fn dequeue(&self) -> Promise<Option<T>> {
        let mut state = self.shared.borrow_mut();
        let item = state.items.pop_front();
        let woken = state.grant_waiting();
        if !woken.is_empty() {
            drop(state);
            for producer in woken {
                producer.complete(());
            }
            state = self.shared.borrow_mut();
        }
        if let Some(item) = item {
            return Promise::completed(Some(item));
        }
        if state.closed {
            if state.terminal_delivered {
                return Promise::failed(TaskError::QueueClosed);
            }
            state.terminal_delivered = true;
            return Promise::completed(None);
        }
        let consumer = Promise::new();
        state.consumers.push_back(consumer.downgrade());
        consumer
    }

    /// Completes once the queue has room for one more item.
    ///
    /// The slot stays reserved while the returned promise is alive, so the holder should
    /// enqueue right after awaiting it.
    pub fn reserve(&self) -> Promise<()> {
        let mut state = self.shared.borrow_mut();
        if state.closed {
            return Promise::failed(TaskError::QueueClosed);
        }
        let nobody_ahead = state.producers.iter().all(|weak| weak.upgrade().is_none());
        if nobody_ahead && state.has_room() {
            let granted = Promise::completed(());
            state.granted.push(granted.downgrade());
            return granted;
        }
        let producer = Promise::new();
        state.producers.push_back(producer.downgrade());
        producer
    }

    /// Wait for room, then enqueue.
    pub async fn send(&self, item: T) -> Result<(), TaskError> {
        self.reserve().await?;
        self.enqueue(item)
    }

    /// Stop accepting items. Remaining items can still be dequeued; the first waiting consumer
    /// (if any) receives the terminal `None`, later ones and waiting producers fail.
    pub fn close(&self) {
        let (consumers, producers) = {
            let mut state = self.shared.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.consumers),
                std::mem::take(&mut state.producers),
            )
        };

        for consumer in consumers.iter().filter_map(WeakPromise::upgrade) {
            if !consumer.is_pending() {
                continue;
            }
            let first = {
                let mut state = self.shared.borrow_mut();
                !std::mem::replace(&mut state.terminal_delivered, true)
            };
            if first {
                consumer.complete(None);
            } else {
                consumer.fail(TaskError::QueueClosed);
            }
        }
        for producer in producers.iter().filter_map(WeakPromise::upgrade) {
            producer.fail(TaskError::QueueClosed);
        }
    }

    pub fn len(&self) -> usize {
        self.shared.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.borrow().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }
}
