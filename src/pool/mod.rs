use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::oneshot;

pub const NO_TASK_ID: u16 = 0;
const THREAD_NAME_LIMIT: usize = 15;
const GLOBAL_POOL_NAME: &str = "ani-ipc";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("task submitted from a worker of the same pool")]
    ReentrantSubmit,

    #[error("thread pool is stopping")]
    Stopped,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("task was dropped before producing a result")]
    TaskDropped,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    id: u16,
    job: Job,
}

struct Queue {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

thread_local! {
    static OWNER: Cell<usize> = const { Cell::new(0) };
    static TASK_ID: Cell<u16> = const { Cell::new(NO_TASK_ID) };
}

pub struct ThreadPool {
    name: String,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        let size = if size == 0 {
            thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            size
        };
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                stop: false,
            }),
            available: Condvar::new(),
        });

        let mut pool = Self {
            name: name.to_string(),
            shared,
            workers: Vec::with_capacity(size),
        };
        for i in 0..size {
            let shared = pool.shared.clone();
            let worker = thread::Builder::new()
                .name(worker_thread_name(name, i))
                .spawn(move || worker_loop(shared))?;
            pool.workers.push(worker);
        }
        tracing::debug!(pool = %pool.name, workers = size, "thread pool started");
        Ok(pool)
    }

    pub fn global() -> io::Result<Arc<ThreadPool>> {
        static GLOBAL: OnceLock<Arc<ThreadPool>> = OnceLock::new();
        if let Some(pool) = GLOBAL.get() {
            return Ok(pool.clone());
        }
        let pool = Arc::new(ThreadPool::new(GLOBAL_POOL_NAME, 0)?);
        Ok(GLOBAL.get_or_init(|| pool).clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn is_owner(&self) -> bool {
        OWNER.with(|owner| owner.get() == self.shared.key())
    }

    /// [`NO_TASK_ID`] outside this pool.
    pub fn current_task_id(&self) -> u16 {
        if self.is_owner() {
            TASK_ID.with(Cell::get)
        } else {
            NO_TASK_ID
        }
    }

    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_id(NO_TASK_ID, f)
    }

    pub fn submit_with_id<F, T>(&self, id: u16, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_owner() {
            return Err(PoolError::ReentrantSubmit);
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message);
            let _ = tx.send(outcome);
        });
        {
            let mut queue = self.shared.lock();
            if queue.stop {
                return Err(PoolError::Stopped);
            }
            queue.tasks.push_back(Task { id, job });
        }
        self.shared.available.notify_one();
        Ok(TaskHandle { rx })
    }

    // Already queued tasks still run.
    pub fn stop(&self) {
        self.shared.lock().stop = true;
        self.shared.available.notify_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last owner can be a task on this very pool; it cannot join itself.
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
        tracing::debug!(pool = %self.name, "thread pool stopped");
    }
}

fn worker_loop(shared: Arc<Shared>) {
    OWNER.with(|owner| owner.set(shared.key()));
    loop {
        let task = {
            let mut queue = shared.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.stop {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        TASK_ID.with(|id| id.set(task.id));
        (task.job)();
        TASK_ID.with(|id| id.set(NO_TASK_ID));
    }
}

fn worker_thread_name(name: &str, index: usize) -> String {
    let suffix = format!("[{index}]");
    let keep = THREAD_NAME_LIMIT.saturating_sub(suffix.len());
    let prefix: String = name.chars().take(keep).collect();
    format!("{prefix}{suffix}")
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Block on it with [`TaskHandle::wait`] from plain threads, or `.await` it
/// from async code. `wait` must not be called from inside an async runtime.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    pub fn wait(self) -> Result<T, PoolError> {
        settle(self.rx.blocking_recv())
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(settle)
    }
}

fn settle<T>(received: Result<Result<T, String>, oneshot::error::RecvError>) -> Result<T, PoolError> {
    match received {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(PoolError::TaskPanicked(message)),
        Err(_) => Err(PoolError::TaskDropped),
    }
}

pub struct ResultSet<T> {
    handles: Vec<TaskHandle<T>>,
}

impl<T> Default for ResultSet<T> {
    fn default() -> Self {
        Self {
            handles: Vec::new(),
        }
    }
}

impl<T> ResultSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: TaskHandle<T>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn wait_all(self) -> Result<Vec<T>, PoolError> {
        let mut values = Vec::with_capacity(self.handles.len());
        let mut failures = Vec::new();
        for (i, handle) in self.handles.into_iter().enumerate() {
            match handle.wait() {
                Ok(value) => values.push(value),
                Err(err) => failures.push(format!("task {i}: {err}")),
            }
        }
        if failures.is_empty() {
            Ok(values)
        } else {
            Err(PoolError::TaskPanicked(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_submitted_tasks_and_returns_results() {
        let pool = ThreadPool::new("test", 2).unwrap();
        assert_eq!(pool.size(), 2);
        let a = pool.submit(|| 2 + 2).unwrap();
        let b = pool.submit(|| "done".to_string()).unwrap();
        assert_eq!(a.wait().unwrap(), 4);
        assert_eq!(b.wait().unwrap(), "done");
    }

    #[test]
    fn zero_size_means_hardware_concurrency() {
        let pool = ThreadPool::new("auto", 0).unwrap();
        assert!(pool.size() >= 1);
    }

    #[test]
    fn submit_from_own_worker_is_rejected() {
        let pool = Arc::new(ThreadPool::new("reentrant", 1).unwrap());
        let inner = pool.clone();
        let nested = pool
            .submit(move || inner.submit(|| 1).map(|_| ()))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(nested, Err(PoolError::ReentrantSubmit));
    }

    #[test]
    fn submit_from_another_pools_worker_is_allowed() {
        let outer = ThreadPool::new("outer", 1).unwrap();
        let inner = Arc::new(ThreadPool::new("inner", 1).unwrap());
        let target = inner.clone();
        let value = outer
            .submit(move || target.submit(|| 7).map(|h| h.wait()))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(value, Ok(Ok(7)));
    }

    #[test]
    fn task_ids_are_visible_only_inside_the_pool() {
        let pool = Arc::new(ThreadPool::new("ids", 1).unwrap());
        assert!(!pool.is_owner());
        assert_eq!(pool.current_task_id(), NO_TASK_ID);

        let p = pool.clone();
        let seen = pool
            .submit_with_id(42, move || (p.is_owner(), p.current_task_id()))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(seen, (true, 42));

        let p = pool.clone();
        let seen = pool.submit(move || p.current_task_id()).unwrap().wait().unwrap();
        assert_eq!(seen, NO_TASK_ID);
    }

    #[test]
    fn workers_are_named_after_the_pool() {
        let pool = ThreadPool::new("a-rather-long-pool-name", 1).unwrap();
        let name = pool
            .submit(|| thread::current().name().map(str::to_string))
            .unwrap()
            .wait()
            .unwrap()
            .unwrap();
        assert_eq!(name, "a-rather-lon[0]");
        assert!(name.len() <= THREAD_NAME_LIMIT);
    }

    #[test]
    fn panicking_task_is_reported_and_worker_survives() {
        let pool = ThreadPool::new("panics", 1).unwrap();
        let err = pool
            .submit(|| -> u8 { panic!("boom") })
            .unwrap()
            .wait()
            .unwrap_err();
        assert_eq!(err, PoolError::TaskPanicked("boom".to_string()));
        assert_eq!(pool.submit(|| 5u8).unwrap().wait().unwrap(), 5);
    }

    #[test]
    fn stopped_pool_refuses_new_tasks() {
        let pool = ThreadPool::new("stopped", 1).unwrap();
        pool.stop();
        assert!(matches!(pool.submit(|| ()), Err(PoolError::Stopped)));
    }

    #[test]
    fn drop_drains_queue_and_joins_workers() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new("drain", 2).unwrap();
            for _ in 0..16 {
                let counter = counter.clone();
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(2));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn result_set_collects_all_results() {
        let pool = ThreadPool::new("set", 3).unwrap();
        let mut set = ResultSet::new();
        for i in 0..5u32 {
            set.insert(pool.submit(move || i * i).unwrap());
        }
        assert_eq!(set.len(), 5);
        assert_eq!(set.wait_all().unwrap(), vec![0, 1, 4, 9, 16]);
    }

    #[test]
    fn result_set_names_every_failed_task() {
        let pool = ThreadPool::new("set-fail", 2).unwrap();
        let mut set = ResultSet::new();
        set.insert(pool.submit(|| 1).unwrap());
        set.insert(pool.submit(|| -> i32 { panic!("first") }).unwrap());
        set.insert(pool.submit(|| -> i32 { panic!("second") }).unwrap());
        let PoolError::TaskPanicked(message) = set.wait_all().unwrap_err() else {
            panic!("expected aggregated panic");
        };
        assert!(message.contains("task 1: task panicked: first"));
        assert!(message.contains("task 2: task panicked: second"));
    }

    #[tokio::test]
    async fn task_handle_can_be_awaited() {
        let pool = ThreadPool::new("async", 1).unwrap();
        let handle = pool.submit(|| 40 + 2).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
    }
}
