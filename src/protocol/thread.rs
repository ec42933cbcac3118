use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, error, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Checks without queue progress before a draining pool gives up waiting.
const DRAIN_STALL_CHECKS: u32 = 10;
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

struct Shared {
    name: String,
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    alive: AtomicBool,
    live_workers: AtomicUsize,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("name", &self.name)
            .field("alive", &self.alive)
            .field("live_workers", &self.live_workers)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, job: Job) {
        self.queue().push_back(job);
        self.available.notify_one();
    }
}

#[derive(Debug, Default)]
struct Workers {
    handles: Vec<thread::JoinHandle<()>>,
    users: usize,
    next_id: usize,
}

/// Bounded pool of worker threads draining a FIFO task queue.
///
/// Workers are started on demand with [`WorkPool::add_threads`], never beyond the configured
/// maximum. Each call to `add_threads` registers one user; the pool only shuts down once
/// every user has called [`WorkPool::terminate`] (or one of them forces it).
#[derive(Debug)]
pub struct WorkPool {
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
    max_threads: usize,
    drain_interval: Duration,
}

/// Submits tasks to a [`WorkPool`] from inside running tasks.
#[derive(Debug, Clone)]
pub struct Spawner {
    shared: Arc<Shared>,
}

impl Spawner {
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push(Box::new(f));
    }

    /// Tasks queued and not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }
}

impl WorkPool {
    pub fn new(name: impl Into<String>, max_threads: usize) -> Self {
        assert!(max_threads > 0);

        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                alive: AtomicBool::new(true),
                live_workers: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Workers::default()),
            max_threads,
            drain_interval: DRAIN_INTERVAL,
        }
    }

    /// Interval between queue checks while [`WorkPool::terminate`] drains.
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Starts up to `count` more workers, capped at the pool maximum. Returns how many
    /// were started.
    pub fn add_threads(&self, count: usize) -> usize {
        let mut workers = self.workers();
        if !self.shared.alive.load(Ordering::SeqCst) {
            return 0;
        }
        workers.users += 1;

        let to_add = count.min(self.max_threads.saturating_sub(workers.handles.len()));
        let mut started = 0;
        for _ in 0..to_add {
            let id = workers.next_id;
            workers.next_id += 1;

            let shared = Arc::clone(&self.shared);
            shared.live_workers.fetch_add(1, Ordering::SeqCst);
            let spawned = thread::Builder::new()
                .name(format!("{}-{id}", self.shared.name))
                .spawn(move || work_loop(id, shared));

            match spawned {
                Ok(handle) => {
                    workers.handles.push(handle);
                    started += 1;
                }
                Err(e) => {
                    self.shared.live_workers.fetch_sub(1, Ordering::SeqCst);
                    error!("{}: failed to start worker {id}: {e}", self.shared.name);
                    break;
                }
            }
        }
        debug!(
            "{}: {} workers, {} users",
            self.shared.name,
            workers.handles.len(),
            workers.users
        );
        started
    }

    /// Starts every worker the pool allows.
    pub fn initiate(&self) -> usize {
        self.add_threads(self.max_threads)
    }

    pub fn add_task<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push(Box::new(f));
    }

    /// Reserves one more worker and queues `f`. Returns whether a worker was added; the
    /// task is queued either way.
    pub fn add_thread_with_task<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let added = self.add_threads(1);
        self.add_task(f);
        added == 1
    }

    pub fn spawner(&self) -> Spawner {
        Spawner {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Releases one user. When none remain, or when `force` is set, lets the queue drain
    /// for as long as it keeps shrinking, then stops and joins every worker.
    ///
    /// A forced termination leaves the pool unusable.
    pub fn terminate(&self, force: bool) -> bool {
        let mut workers = self.workers();
        workers.users = workers.users.saturating_sub(1);
        if workers.users > 0 && !force {
            return false;
        }

        self.drain();

        {
            let _queue = self.shared.queue();
            self.shared.alive.store(false, Ordering::SeqCst);
            self.shared.available.notify_all();
        }
        for handle in workers.handles.drain(..) {
            if handle.join().is_err() {
                error!("{}: worker exited abnormally", self.shared.name);
            }
        }

        let abandoned = {
            let mut queue = self.shared.queue();
            let n = queue.len();
            queue.clear();
            n
        };
        if abandoned > 0 {
            warn!(
                "{}: discarded {abandoned} queued tasks at shutdown",
                self.shared.name
            );
        }

        self.shared.alive.store(!force, Ordering::SeqCst);
        true
    }

    fn drain(&self) {
        let mut last = self.pending_tasks();
        let mut stalled = 0;

        while last > 0 && stalled < DRAIN_STALL_CHECKS {
            thread::sleep(self.drain_interval);
            let now = self.pending_tasks();
            if now == last {
                stalled += 1;
            } else {
                stalled = 0;
                last = now;
            }
        }

        if stalled >= DRAIN_STALL_CHECKS {
            error!(
                "{}: timed out draining a non-empty queue of {last} tasks",
                self.shared.name
            );
        }
    }

    /// Blocks until the queue is observed empty. Tasks may still be running.
    pub fn wait(&self) {
        while self.pending_tasks() > 0 {
            thread::yield_now();
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn live_threads(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    fn workers(&self) -> MutexGuard<'_, Workers> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        if !self.workers().handles.is_empty() {
            debug!("{}: shutting down on drop", self.shared.name);
            self.terminate(true);
        }
    }
}

fn work_loop(id: usize, shared: Arc<Shared>) {
    debug!("{}: worker {id} started", shared.name);
    while shared.alive.load(Ordering::SeqCst) {
        let job = {
            let queue = shared.queue();
            let mut queue = shared
                .available
                .wait_while(queue, |q| {
                    q.is_empty() && shared.alive.load(Ordering::SeqCst)
                })
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.pop_front()
        };

        if let Some(job) = job {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("{}: task panicked on worker {id}", shared.name);
            }
        }
    }

    let remaining = shared.live_workers.fetch_sub(1, Ordering::SeqCst) - 1;
    debug!(
        "{}: worker {id} exited, {remaining} workers remain",
        shared.name
    );
}
