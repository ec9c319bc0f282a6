//! Recurring-callback scheduling.
//!
//! `ExpiringMap` only needs two capabilities from its environment: run a
//! callback every `period`, and stop doing so, waiting for an invocation
//! that is already running. [`Scheduler`] names that contract;
//! [`TimerScheduler`] provides it with one background thread.

use crate::error::ScheduleError;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Callback run by a scheduler. Invocations of one task never overlap.
pub type Task = Arc<dyn Fn() + Send + Sync>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// For `Scheduler` implementations minting their own ids.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

pub trait Scheduler: Send + Sync {
    /// Runs `task` every `period`, first after one full period.
    fn schedule_repeating(&self, period: Duration, task: Task) -> Result<TaskId, ScheduleError>;

    /// Deregisters `id`. If the task is running on another thread, blocks
    /// until that invocation returns. Unknown ids are ignored.
    fn cancel(&self, id: TaskId);
}

struct Registration {
    period: Duration,
    task: Task,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Registration>,
    // Cancelled ids are left in the heap and skipped when popped.
    deadlines: BinaryHeap<Reverse<(Instant, TaskId)>>,
    running: Option<TaskId>,
    next_id: u64,
    shutdown: bool,
}

impl State {
    /// Drops heap entries of cancelled tasks once they outnumber live ones.
    fn maybe_compact(&mut self) {
        if self.deadlines.len() > 2 * self.tasks.len() + 16 {
            let tasks = &self.tasks;
            self.deadlines.retain(|Reverse((_, id))| tasks.contains_key(id));
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    idle: Condvar,
}

/// A scheduler backed by a single named thread.
pub struct TimerScheduler {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl TimerScheduler {
    pub fn new() -> Result<Self, ScheduleError> {
        Self::with_name("expiring-map-timer")
    }

    pub fn with_name(name: &str) -> Result<Self, ScheduleError> {
        let shared = Arc::new(Shared::default());
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&worker))?;
        Ok(Self {
            shared,
            thread_id: handle.thread().id(),
            thread: Some(handle),
        })
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }
}

impl Scheduler for TimerScheduler {
    fn schedule_repeating(&self, period: Duration, task: Task) -> Result<TaskId, ScheduleError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(ScheduleError::ShutDown);
        }
        let id = TaskId(state.next_id);
        state.next_id += 1;
        state.tasks.insert(id, Registration { period, task });
        state.deadlines.push(Reverse((Instant::now() + period, id)));
        drop(state);
        self.shared.wake.notify_one();
        debug!(task = id.0, ?period, "task scheduled");
        Ok(id)
    }

    fn cancel(&self, id: TaskId) {
        let mut state = self.shared.state.lock();
        if state.tasks.remove(&id).is_none() {
            return;
        }
        state.maybe_compact();
        debug!(task = id.0, "task cancelled");
        // A task cancelling itself from its own invocation must not wait on itself.
        if thread::current().id() == self.thread_id {
            return;
        }
        while state.running == Some(id) {
            self.shared.idle.wait(&mut state);
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.thread.take() {
            if thread::current().id() != self.thread_id && handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    while !state.shutdown {
        let Some(&Reverse((deadline, id))) = state.deadlines.peek() else {
            shared.wake.wait(&mut state);
            continue;
        };
        if deadline > Instant::now() {
            shared.wake.wait_until(&mut state, deadline);
            continue;
        }
        state.deadlines.pop();
        let Some(reg) = state.tasks.get(&id) else {
            continue;
        };
        let (task, period) = (reg.task.clone(), reg.period);
        state.running = Some(id);
        invoke(&mut state, id, &task);
        state.running = None;
        if state.tasks.contains_key(&id) {
            // Missed periods are skipped rather than replayed back to back.
            let next = (deadline + period).max(Instant::now());
            state.deadlines.push(Reverse((next, id)));
        }
        shared.idle.notify_all();
    }
}

fn invoke(state: &mut MutexGuard<'_, State>, id: TaskId, task: &Task) {
    MutexGuard::unlocked(state, || {
        if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
            error!(task = id.0, "scheduled task panicked");
        }
    });
}

static DEFAULT: OnceLock<Option<Arc<TimerScheduler>>> = OnceLock::new();

/// Process-wide scheduler, started on first use. `None` if its thread
/// could not be spawned.
pub fn default_scheduler() -> Option<Arc<dyn Scheduler>> {
    DEFAULT
        .get_or_init(|| match TimerScheduler::with_name("expiring-map-default-timer") {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                error!(error = %e, "default scheduler unavailable");
                None
            }
        })
        .clone()
        .map(|s| s as Arc<dyn Scheduler>)
}
