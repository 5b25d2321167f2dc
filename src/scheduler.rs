//! Cancellable deferred tasks.
//!
//! The monitor defers one task at a time: moving a paused or stopped session
//! to waiting. Scheduling goes through the [`Scheduler`] trait so that tests
//! can fire deferred tasks by hand instead of sleeping.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::Duration,
};

/// A task to run once.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Runs `task` after `delay`, unless the returned handle is cancelled or
    /// dropped first.
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle;
}

/// Handle to a deferred task.
///
/// Cancelling a task that is already running is not an error; the task runs
/// to completion. Dropping the handle cancels the task.
#[derive(Debug)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    wake: Option<mpsc::Sender<()>>,
}

impl TaskHandle {
    fn new(cancelled: Arc<AtomicBool>, wake: Option<mpsc::Sender<()>>) -> Self {
        Self { cancelled, wake }
    }

    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        // Disconnecting wakes the timer thread up early.
        self.wake.take();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Runs each task on a short-lived thread of its own.
#[derive(Copy, Clone, Debug, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (wake, woken) = mpsc::channel::<()>();

        let flag = Arc::clone(&cancelled);
        let spawned = thread::Builder::new()
            .name("nowplaying-timer".to_owned())
            .spawn(move || match woken.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) if !flag.load(Ordering::Acquire) => task(),
                _ => trace!("deferred task cancelled"),
            });

        if let Err(e) = spawned {
            error!("failed to spawn timer thread: {e}");
        }

        TaskHandle::new(cancelled, Some(wake))
    }
}

/// Scheduler that only runs tasks when told to.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct ManualScheduler {
    tasks: std::sync::Mutex<Vec<Deferred>>,
}

#[cfg(test)]
struct Deferred {
    delay: Duration,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

#[cfg(test)]
impl ManualScheduler {
    /// Number of tasks that have neither run nor been cancelled.
    pub(crate) fn pending(&self) -> usize {
        let tasks = self.tasks.lock().unwrap();
        tasks
            .iter()
            .filter(|deferred| !deferred.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Delay of the most recently scheduled pending task.
    pub(crate) fn last_delay(&self) -> Option<Duration> {
        let tasks = self.tasks.lock().unwrap();
        tasks
            .iter()
            .rev()
            .find(|deferred| !deferred.cancelled.load(Ordering::Acquire))
            .map(|deferred| deferred.delay)
    }

    /// Runs all pending tasks, as if their delays elapsed. Returns how many
    /// ran.
    pub(crate) fn fire_all(&self) -> usize {
        let due: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());

        let mut fired = 0;
        for deferred in due {
            if !deferred.cancelled.load(Ordering::Acquire) {
                (deferred.task)();
                fired += 1;
            }
        }
        fired
    }
}

#[cfg(test)]
impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.tasks.lock().unwrap().push(Deferred {
            delay,
            cancelled: Arc::clone(&cancelled),
            task,
        });
        TaskHandle::new(cancelled, None)
    }
}
