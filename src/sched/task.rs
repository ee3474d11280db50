//! Tasks and fork handles. A forked task is pushed onto the forking worker's
//! deque; whichever worker executes it first wins. A task executed by a
//! different worker runs the coherence handoff: acquire of the fork-time
//! release token before the body, a release after it.

use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::coherence::ReleaseHandle;
use crate::sched::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, NoUninit)]
#[repr(u8)]
pub enum TaskStatus {
    Created,
    Ready,
    Running,
    Done,
}

pub trait Job: Send + Sync {
    fn execute(&self, worker: &Worker);
}

pub type JobRef = Arc<dyn Job>;

pub struct TaskCell<R> {
    status: Atomic<TaskStatus>,
    owner: usize,
    rh: ReleaseHandle,
    body: Mutex<Option<Box<dyn FnOnce() -> R + Send>>>,
    result: Mutex<Option<R>>,
    stolen: AtomicBool,
}

impl<R: Send + 'static> TaskCell<R> {
    pub fn new(owner: usize, rh: ReleaseHandle, body: Box<dyn FnOnce() -> R + Send>) -> TaskCell<R> {
        TaskCell {
            status: Atomic::new(TaskStatus::Created),
            owner,
            rh,
            body: Mutex::new(Some(body)),
            result: Mutex::new(None),
            stolen: AtomicBool::new(false),
        }
    }

    pub fn make_ready(&self) {
        self.status.store(TaskStatus::Ready, Ordering::Release);
    }

    pub fn status(&self) -> TaskStatus {
        self.status.load(Ordering::Acquire)
    }
}

impl<R: Send + 'static> Job for TaskCell<R> {
    fn execute(&self, worker: &Worker) {
        if self
            .status
            .compare_exchange(
                TaskStatus::Ready,
                TaskStatus::Running,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let body = self
            .body
            .lock()
            .unwrap()
            .take()
            .expect("task body already taken");

        let cross_worker = worker.index != self.owner;
        if cross_worker {
            self.stolen.store(true, Ordering::Relaxed);
            // the stolen continuation must observe everything the forking
            // rank released up to the fork
            worker.engine().acquire_handle(self.rh);
        }

        let r = body();

        if cross_worker {
            worker.engine().release();
        }
        *self.result.lock().unwrap() = Some(r);
        self.status.store(TaskStatus::Done, Ordering::Release);
    }
}

/// Handle for a forked task.
pub struct TaskHandle<R> {
    cell: Arc<TaskCell<R>>,
}

impl<R: Send + 'static> TaskHandle<R> {
    pub(crate) fn new(cell: Arc<TaskCell<R>>) -> TaskHandle<R> {
        TaskHandle { cell }
    }

    /// Wait for the task, running other work while it is pending. Takes the
    /// result; a second call panics.
    pub fn join(&self) -> R {
        let worker = Worker::current();
        while self.cell.status() != TaskStatus::Done {
            if !worker.run_one() {
                std::thread::yield_now();
            }
        }
        self.cell
            .result
            .lock()
            .unwrap()
            .take()
            .expect("task result already taken")
    }

    /// True while the task has not left the forking worker.
    pub fn serialized(&self) -> bool {
        !self.cell.stolen.load(Ordering::Relaxed)
    }
}

/// A fork/join scope. Children forked inside it are joined individually; the
/// end of the scope pairs the joining worker's release with the parent's
/// acquire so the continuation observes everything its children wrote.
pub struct TaskGroup {
    _priv: (),
}

pub fn task_group_begin() -> TaskGroup {
    TaskGroup { _priv: () }
}

pub fn task_group_end(_tg: TaskGroup) {
    let worker = Worker::current();
    worker.engine().release();
    worker.engine().acquire();
}
