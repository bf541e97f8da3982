//! Cooperative single-threaded task runtime for tagdex.
//!
//! All indexing and query work runs as tasks on one logical thread. Blocking work (database
//! statements, file reads, subprocess pipes) runs on OS threads and rejoins through a
//! [`Promise`].

pub mod error;
pub mod promise;
pub mod queue;
pub mod scheduler;
mod worker;

pub use error::{Result, TaskError};
pub use promise::{Outcome, Promise, WeakPromise};
pub use queue::Queue;
pub use scheduler::{yield_now, Scheduler, TaskPolicy, YieldNow};
