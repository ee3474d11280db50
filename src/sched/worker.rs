//! Workers: one OS thread per rank, each owning its rank's coherence engine
//! and a Chase-Lev deque. Only the owning thread ever touches the engine or
//! pops the local end of the deque.

use std::cell::{Cell, RefCell, RefMut};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_deque::Worker as Deque;

use crate::coherence::Engine;
use crate::net::Comm;
use crate::sched::scheduler::Scheduler;
use crate::sched::task::JobRef;

pub struct Worker {
    pub index: usize,
    deque: Deque<JobRef>,
    engine: RefCell<Engine>,
    scheduler: Arc<Scheduler>,
    comm: Comm,
    steal_seed: Cell<u64>,
}

thread_local! {
    static CURRENT: Cell<*const Worker> = const { Cell::new(std::ptr::null()) };
}

impl Worker {
    pub fn new(
        index: usize,
        deque: Deque<JobRef>,
        engine: Engine,
        scheduler: Arc<Scheduler>,
        comm: Comm,
    ) -> Worker {
        Worker {
            index,
            deque,
            engine: RefCell::new(engine),
            scheduler,
            comm,
            steal_seed: Cell::new(index as u64 + 1),
        }
    }

    /// Register this worker as the thread's current worker.
    ///
    /// # Safety
    /// The worker must outlive every use of `Worker::current` on this thread;
    /// pair with `clear_current` before it is dropped.
    pub unsafe fn set_current(worker: *const Worker) {
        CURRENT.with(|c| c.set(worker));
    }

    pub fn clear_current() {
        CURRENT.with(|c| c.set(std::ptr::null()));
    }

    pub fn current() -> &'static Worker {
        Self::try_current().expect("not running on a runtime worker thread")
    }

    pub fn try_current() -> Option<&'static Worker> {
        let p = CURRENT.with(|c| c.get());
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    pub fn engine(&self) -> RefMut<Engine> {
        self.engine.borrow_mut()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    pub fn push(&self, job: JobRef) {
        self.deque.push(job);
        self.scheduler.notify_workers();
    }

    fn pop(&self) -> Option<JobRef> {
        self.deque.pop()
    }

    fn next_victim(&self, n: usize) -> usize {
        // xorshift; victim order only needs to be well spread
        let mut x = self.steal_seed.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.steal_seed.set(x);
        (x % n as u64) as usize
    }

    /// Run one pending job: newest local work first, then directed work from
    /// the mailbox, then injected work, then a steal of the oldest entry of
    /// some victim's deque.
    pub fn run_one(&self) -> bool {
        let job = self
            .pop()
            .or_else(|| self.scheduler.take_mailbox(self.index))
            .or_else(|| self.scheduler.take_injected())
            .or_else(|| self.scheduler.steal_from_victims(self.index, self.next_victim(self.scheduler.n_workers())));
        match job {
            Some(job) => {
                job.execute(self);
                true
            }
            None => false,
        }
    }

    /// Execute at most one directed task from this worker's mailbox. Called
    /// from the algorithm templates so cross-worker tasks placed by a work
    /// hint run promptly.
    pub fn poll(&self) {
        if let Some(job) = self.scheduler.take_mailbox(self.index) {
            job.execute(self);
        }
    }

    /// Park briefly when there is nothing to run. The timeout bounds the
    /// window of a lost wakeup between the emptiness check and the wait.
    pub fn park(&self) {
        self.scheduler.park(Duration::from_millis(1));
    }
}
