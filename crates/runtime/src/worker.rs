use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of OS threads for blocking calls (file reads, pipe writes, process waits).
///
/// Threads are detached and exit once the pool is dropped and the job channel drains.
pub(crate) struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut spawned = 0;

        for index in 0..size.max(1) {
            let receiver = Arc::clone(&receiver);
            let result = thread::Builder::new()
                .name(format!("tagdex-worker-{index}"))
                .spawn(move || loop {
                    let job = {
                        let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                });
            match result {
                Ok(_) => spawned += 1,
                Err(err) => log::warn!("Failed to spawn worker thread {index}: {err}"),
            }
        }

        if spawned == 0 {
            log::warn!("No worker threads available; blocking jobs run inline");
        }

        Self {
            sender: (spawned > 0).then_some(sender),
        }
    }

    pub(crate) fn default_size() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4)
    }

    pub(crate) fn execute(&self, job: Job) {
        match &self.sender {
            Some(sender) => {
                if let Err(mpsc::SendError(job)) = sender.send(job) {
                    job();
                }
            }
            None => job(),
        }
    }
}
