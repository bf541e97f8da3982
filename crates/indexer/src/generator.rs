use crate::config::TaggerConfig;
use crate::error::GeneratorError;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tagdex_runtime::{Promise, Queue, Scheduler, TaskError, TaskPolicy};
use tokio::sync::mpsc;

const READ_BUFFER: usize = 256;
const EXIT_POLL: Duration = Duration::from_millis(10);

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;
type SharedChild = Arc<Mutex<Option<Child>>>;

/// Owns the tagger process for one run.
///
/// Dropping it while the process is still attached closes stdin, gives the process the grace
/// period to exit on its own and then kills it. That teardown runs on its own thread.
struct ChildProcess {
    child: SharedChild,
    stdin: SharedStdin,
    grace: Duration,
}

impl ChildProcess {
    /// The failure of a process that has already exited, if it failed.
    fn failed_exit(&self) -> Option<GeneratorError> {
        let mut slot = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let status = slot.as_mut()?.try_wait().ok()??;
        (!status.success()).then(|| GeneratorError::TaggerFailed {
            code: status.code(),
        })
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let Some(mut child) = self.child.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return;
        };
        let stdin = Arc::clone(&self.stdin);
        let grace = self.grace;
        let spawned = thread::Builder::new()
            .name("tagdex-tagger-teardown".to_string())
            .spawn(move || {
                // A write still in progress keeps the lock; the kill below unblocks it.
                if let Ok(mut slot) = stdin.try_lock() {
                    slot.take();
                }
                let deadline = Instant::now() + grace;
                while Instant::now() < deadline {
                    match child.try_wait() {
                        Ok(Some(_)) => return,
                        Ok(None) => thread::sleep(EXIT_POLL),
                        Err(_) => break,
                    }
                }
                log::debug!("Tagger did not exit within {grace:?}; killing it");
                let _ = child.kill();
                let _ = child.wait();
            });
        if let Err(err) = spawned {
            log::warn!("Failed to spawn tagger teardown thread: {err}");
        }
    }
}

/// One tagging run: the parsed-line queue and the promise of the whole run.
pub struct GeneratorRun {
    /// Raw output lines of the tagger, closed when its output ends.
    pub lines: Queue<String>,
    /// Settles when the tagger has exited; fails with [`GeneratorError::TaggerFailed`] on a
    /// non-zero exit. Disposing it tears the process down.
    pub done: Promise<()>,
}

/// Drives the external tag generator.
///
/// Filenames are written to the tagger's stdin one per line; its stdout is read line by line
/// on a dedicated thread.
#[derive(Clone)]
pub struct TagGenerator {
    scheduler: Scheduler,
    config: TaggerConfig,
    capacity: usize,
}

impl TagGenerator {
    pub fn new(scheduler: &Scheduler, config: TaggerConfig) -> Self {
        Self {
            scheduler: scheduler.clone(),
            config,
            capacity: READ_BUFFER,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Launch the tagger and start feeding it from `filenames` until that queue is closed.
    ///
    /// `on_next_file` runs for every filename before it is written; the write waits on the
    /// returned promise, and a `false` result skips the file.
    pub fn start<F>(
        &self,
        filenames: Queue<PathBuf>,
        on_next_file: F,
    ) -> Result<GeneratorRun, GeneratorError>
    where
        F: FnMut(&Path) -> Promise<bool> + 'static,
    {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command.spawn().map_err(|source| GeneratorError::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        log::debug!("Started tagger {} (pid {})", self.config.program, child.id());

        let stdin: SharedStdin = Arc::new(Mutex::new(child.stdin.take()));
        let stdout = child.stdout.take();
        let process = ChildProcess {
            child: Arc::new(Mutex::new(Some(child))),
            stdin: Arc::clone(&stdin),
            grace: self.config.grace_period(),
        };

        let lines = Queue::bounded(self.capacity);
        let scheduler = self.scheduler.clone();
        let feeder = scheduler.start_with(
            TaskPolicy::WhileFutureLives,
            feed(scheduler.clone(), filenames, Arc::clone(&stdin), on_next_file),
        );
        let reader = scheduler.start_with(
            TaskPolicy::WhileFutureLives,
            read_output(scheduler.clone(), stdout, lines.clone(), self.capacity),
        );

        let done = scheduler.clone().start_with(TaskPolicy::WhileFutureLives, async move {
            let process = process;
            if let Err(err) = feeder.await {
                // A tagger that died early breaks the pipe; its exit status says more.
                return Err(process.failed_exit().map_or(err, TaskError::from));
            }
            reader.await?;

            let child = process.child.lock().unwrap_or_else(PoisonError::into_inner).take();
            let Some(mut child) = child else {
                return Ok(());
            };
            let status = scheduler.run_blocking(move || Ok(child.wait()?)).await?;
            if !status.success() {
                return Err(GeneratorError::TaggerFailed {
                    code: status.code(),
                }
                .into());
            }
            log::debug!("Tagger exited cleanly");
            Ok(())
        });

        Ok(GeneratorRun { lines, done })
    }
}

fn write_line(stdin: &SharedStdin, line: &[u8]) -> Result<(), GeneratorError> {
    let mut slot = stdin.lock().unwrap_or_else(PoisonError::into_inner);
    let pipe = slot.as_mut().ok_or(GeneratorError::StdinClosed)?;
    pipe.write_all(line)?;
    pipe.flush()?;
    Ok(())
}

fn close_stdin(stdin: &SharedStdin) {
    stdin.lock().unwrap_or_else(PoisonError::into_inner).take();
}

/// Closes the tagger's stdin however the feeder ends, so the tagger can finish.
struct StdinCloser(SharedStdin);

impl Drop for StdinCloser {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.0.try_lock() {
            slot.take();
        }
    }
}

/// Closes a queue however its owning task ends.
struct CloseOnDrop<T: 'static>(Queue<T>);

impl<T: 'static> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

async fn feed<F>(
    scheduler: Scheduler,
    filenames: Queue<PathBuf>,
    stdin: SharedStdin,
    mut on_next_file: F,
) -> Result<(), TaskError>
where
    F: FnMut(&Path) -> Promise<bool> + 'static,
{
    let _closer = StdinCloser(Arc::clone(&stdin));
    // The feeder is the only consumer: once it stops, producers must not wait on it.
    let _close_input = CloseOnDrop(filenames.clone());
    let mut in_flight: Option<Promise<()>> = None;

    while let Some(path) = filenames.dequeue().await? {
        if !on_next_file(&path).await? {
            continue;
        }
        if let Some(write) = in_flight.take() {
            write.await?;
        }
        let mut line = path.to_string_lossy().into_owned();
        line.push('\n');
        let pipe = Arc::clone(&stdin);
        in_flight = Some(scheduler.run_blocking(move || Ok(write_line(&pipe, line.as_bytes())?)));
    }

    if let Some(write) = in_flight.take() {
        write.await?;
    }
    let pipe = Arc::clone(&stdin);
    scheduler.run_blocking(move || {
        close_stdin(&pipe);
        Ok(())
    })
    .await?;
    Ok(())
}

async fn read_output(
    scheduler: Scheduler,
    stdout: Option<ChildStdout>,
    lines: Queue<String>,
    capacity: usize,
) -> Result<(), TaskError> {
    let _close = CloseOnDrop(lines.clone());
    let Some(stdout) = stdout else {
        return Ok(());
    };

    let (tx, mut rx) = mpsc::channel::<std::io::Result<String>>(capacity);
    thread::Builder::new()
        .name("tagdex-tagger-reader".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        if tx.blocking_send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        break;
                    }
                }
            }
        })
        .map_err(GeneratorError::from)?;

    while let Some(line) = scheduler.external(rx.recv()).await {
        let line = line.map_err(GeneratorError::from)?;
        lines.send(line).await?;
    }
    Ok(())
}
