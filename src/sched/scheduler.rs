//! The work-stealing scheduler. Each worker pushes and pops the young end of
//! its own deque; thieves steal the oldest entry. A per-worker mailbox
//! carries work placed by ADWS work hints, and a global injector carries
//! root work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer};

use crate::coherence::ReleaseHandle;
use crate::sched::task::{JobRef, TaskCell, TaskHandle};
use crate::sched::worker::Worker;

pub struct Scheduler {
    n_workers: usize,
    stealers: Vec<Stealer<JobRef>>,
    mailboxes: Vec<Injector<JobRef>>,
    injector: Injector<JobRef>,
    /// Condition variable for worker parking
    monitor: (Mutex<()>, Condvar),
    shutdown: AtomicBool,
}

impl Scheduler {
    pub fn new(n_workers: usize, stealers: Vec<Stealer<JobRef>>) -> Arc<Scheduler> {
        debug_assert_eq!(n_workers, stealers.len());
        Arc::new(Scheduler {
            n_workers,
            stealers,
            mailboxes: (0..n_workers).map(|_| Injector::new()).collect(),
            injector: Injector::new(),
            monitor: (Mutex::new(()), Condvar::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    pub fn notify_workers(&self) {
        let _guard = self.monitor.0.lock().unwrap();
        self.monitor.1.notify_all();
    }

    pub fn park(&self, timeout: Duration) {
        let guard = self.monitor.0.lock().unwrap();
        let _ = self.monitor.1.wait_timeout(guard, timeout).unwrap();
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify_workers();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Deposit directed work into `target`'s mailbox.
    pub fn push_mailbox(&self, target: usize, job: JobRef) {
        self.mailboxes[target].push(job);
        self.notify_workers();
    }

    pub fn inject(&self, job: JobRef) {
        self.injector.push(job);
        self.notify_workers();
    }

    fn drain(queue: &Injector<JobRef>) -> Option<JobRef> {
        loop {
            match queue.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn take_mailbox(&self, worker: usize) -> Option<JobRef> {
        Self::drain(&self.mailboxes[worker])
    }

    pub fn take_injected(&self) -> Option<JobRef> {
        Self::drain(&self.injector)
    }

    /// Steal the oldest entry from some victim's deque, probing every worker
    /// once starting from `start`.
    pub fn steal_from_victims(&self, thief: usize, start: usize) -> Option<JobRef> {
        for i in 0..self.n_workers {
            let victim = (start + i) % self.n_workers;
            if victim == thief {
                continue;
            }
            loop {
                match self.stealers[victim].steal() {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }
}

/// Fork `f` as a child task of the current worker. The child is immediately
/// stealable; the current task keeps running (its continuation is the code
/// after the fork). Writes made so far are released first so a thief's
/// acquire of the fork-time token observes them.
pub fn fork<R, F>(f: F) -> TaskHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    fork_on(None, f)
}

/// Fork with an ADWS placement hint: when `target` names another worker the
/// child is deposited into that worker's mailbox so it starts next to the
/// data its work hint maps to.
pub fn fork_on<R, F>(target: Option<usize>, f: F) -> TaskHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let worker = Worker::current();
    let rh: ReleaseHandle = {
        let mut engine = worker.engine();
        engine.release();
        engine.release_lazy()
    };
    let cell = Arc::new(TaskCell::new(worker.index, rh, Box::new(f)));
    cell.make_ready();
    let job: JobRef = cell.clone();
    match target {
        Some(t) if t != worker.index => worker.scheduler().push_mailbox(t, job),
        _ => worker.push(job),
    }
    TaskHandle::new(cell)
}

/// Yield to one directed task, if any arrived for this worker.
pub fn poll() {
    Worker::current().poll();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::TaskStatus;

    #[test]
    fn injector_hands_out_jobs_once() {
        use crate::coherence::ReleaseHandle;
        let sched = Scheduler::new(1, vec![crossbeam_deque::Worker::new_lifo().stealer()]);
        let cell = Arc::new(TaskCell::new(
            0,
            ReleaseHandle { rank: 0, epoch: 1 },
            Box::new(|| 5usize),
        ));
        cell.make_ready();
        assert_eq!(cell.status(), TaskStatus::Ready);
        sched.inject(cell);
        assert!(sched.take_injected().is_some());
        assert!(sched.take_injected().is_none());
    }

    #[test]
    fn mailboxes_are_per_worker() {
        let stealers = vec![
            crossbeam_deque::Worker::new_lifo().stealer(),
            crossbeam_deque::Worker::new_lifo().stealer(),
        ];
        let sched = Scheduler::new(2, stealers);
        let cell = Arc::new(TaskCell::new(
            0,
            ReleaseHandle { rank: 0, epoch: 1 },
            Box::new(|| ()),
        ));
        cell.make_ready();
        sched.push_mailbox(1, cell);
        assert!(sched.take_mailbox(0).is_none());
        assert!(sched.take_mailbox(1).is_some());
    }
}
